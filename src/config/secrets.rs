//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides helpers for showing secret
//! connection strings in logs without leaking credentials.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Render a connection URL with any password replaced by `***`.
///
/// Handles `;`-separated endpoint lists such as sentinel URLs.
pub fn redact_url(url: &SecretString) -> String {
    url.expose_secret()
        .split(';')
        .map(redact_one)
        .collect::<Vec<_>>()
        .join(";")
}

fn redact_one(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((auth, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match auth.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => format!("{scheme}://***@{host}"),
    }
}
