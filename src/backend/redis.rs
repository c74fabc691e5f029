//! Redis lock backend.
//!
//! `lock` is a single `SET key owner NX [PX ttl]`, so acquisition is atomic
//! on the server. `clear` walks the keyspace with `SCAN` and deletes page
//! by page. Two connection modes:
//!
//! - direct (`redis://`, `rediss://`): one auto-reconnecting connection
//!   manager, created on first use;
//! - sentinel (`sentinel://h1:26379;sentinel://h2:26379` plus a master
//!   name): the primary is looked up through the sentinels, and looked up
//!   again after the connection to it breaks or it turns read-only.

use std::time::{Duration, Instant};

use ::redis::aio::{ConnectionManager, MultiplexedConnection};
use ::redis::sentinel::{SentinelClient, SentinelNodeConnectionInfo, SentinelServerType};
use ::redis::{Client, Cmd, ErrorKind, FromRedisValue, RedisConnectionInfo, RedisError};
use async_trait::async_trait;
use opentelemetry::KeyValue;
use secrecy::ExposeSecret;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use super::LockBackend;
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::model::{ExecutionId, LockKey};
use crate::telemetry::metrics;

const SENTINEL_SCHEME: &str = "sentinel://";
const DEFAULT_SENTINEL_PORT: u16 = 26379;

/// Lock backend on a Redis server or sentinel-managed Redis group.
pub struct RedisBackend {
    target: Target,
    scan_count: usize,
}

enum Target {
    Direct {
        client: Client,
        conn: OnceCell<ConnectionManager>,
    },
    Sentinel(Mutex<SentinelState>),
}

struct SentinelState {
    client: SentinelClient,
    master_name: String,
    conn: Option<MultiplexedConnection>,
}

impl RedisBackend {
    /// Build from backend configuration. Does not connect yet.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let url = config
            .url
            .as_ref()
            .ok_or_else(|| Error::Config("redis backend requires a URL".to_string()))?;
        let url = url.expose_secret();

        if url.starts_with(SENTINEL_SCHEME) {
            let master_name = config.master_name.clone().ok_or_else(|| {
                Error::Config("sentinel URL given without a master name".to_string())
            })?;
            let topology = SentinelTopology::parse(url)?;
            Self::sentinel(topology, master_name, config.scan_count)
        } else {
            Self::direct(url, config.scan_count)
        }
    }

    /// Connect to a single Redis server.
    pub fn direct(url: &str, scan_count: usize) -> Result<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            target: Target::Direct {
                client,
                conn: OnceCell::new(),
            },
            scan_count: scan_count.max(1),
        })
    }

    /// Resolve the primary of `master_name` through sentinels.
    pub fn sentinel(topology: SentinelTopology, master_name: String, scan_count: usize) -> Result<Self> {
        let node_info = SentinelNodeConnectionInfo {
            tls_mode: None,
            redis_connection_info: Some(RedisConnectionInfo {
                db: topology.db,
                username: topology.username.clone(),
                password: topology.password.clone(),
                ..Default::default()
            }),
        };
        let client = SentinelClient::build(
            topology.sentinels.clone(),
            master_name.clone(),
            Some(node_info),
            SentinelServerType::Master,
        )?;
        Ok(Self {
            target: Target::Sentinel(Mutex::new(SentinelState {
                client,
                master_name,
                conn: None,
            })),
            scan_count: scan_count.max(1),
        })
    }

    async fn query<T: FromRedisValue>(&self, operation: &'static str, cmd: &Cmd) -> Result<T> {
        let start = Instant::now();
        let result = self.run(cmd).await;
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", format!("redis.{operation}"))],
        );
        if let Err(ref e) = result {
            metrics::lock_operations().add(
                1,
                &[
                    KeyValue::new("operation", operation),
                    KeyValue::new("result", "error"),
                ],
            );
            warn!(operation, error = %e, "redis command failed");
        }
        result
    }

    async fn run<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        match &self.target {
            Target::Direct { client, conn } => {
                let mut conn = conn
                    .get_or_try_init(|| client.get_connection_manager())
                    .await?
                    .clone();
                let value: T = cmd.query_async(&mut conn).await?;
                Ok(value)
            }
            Target::Sentinel(state) => {
                let mut conn = primary_connection(state).await?;
                let result: std::result::Result<T, RedisError> = cmd.query_async(&mut conn).await;
                match result {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        if needs_rediscovery(&e) {
                            let mut state = state.lock().await;
                            warn!(master = %state.master_name, error = %e, "dropping primary connection, will re-resolve");
                            state.conn = None;
                        }
                        Err(e.into())
                    }
                }
            }
        }
    }
}

async fn primary_connection(state: &Mutex<SentinelState>) -> Result<MultiplexedConnection> {
    let mut state = state.lock().await;
    if let Some(conn) = &state.conn {
        return Ok(conn.clone());
    }
    let conn = state.client.get_async_connection().await?;
    debug!(master = %state.master_name, "resolved primary through sentinels");
    state.conn = Some(conn.clone());
    Ok(conn)
}

fn needs_rediscovery(e: &RedisError) -> bool {
    e.is_connection_dropped() || e.is_io_error() || e.kind() == ErrorKind::ReadOnly
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`.
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 4);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl LockBackend for RedisBackend {
    async fn lock(&self, key: &LockKey, owner: &ExecutionId, ttl: Option<Duration>) -> Result<bool> {
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key.as_str()).arg(owner.as_str()).arg("NX");
        if let Some(ttl) = ttl {
            // PX 0 is rejected by the server
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            cmd.arg("PX").arg(millis);
        }
        let reply: Option<String> = self.query("lock", &cmd).await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &LockKey) -> Result<()> {
        let mut cmd = ::redis::cmd("DEL");
        cmd.arg(key.as_str());
        let _: i64 = self.query("unlock", &cmd).await?;
        Ok(())
    }

    async fn get(&self, key: &LockKey) -> Result<Option<ExecutionId>> {
        let mut cmd = ::redis::cmd("GET");
        cmd.arg(key.as_str());
        let owner: Option<String> = self.query("get", &cmd).await?;
        Ok(owner.map(ExecutionId))
    }

    async fn clear(&self, prefix: &str) -> Result<()> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut removed = 0usize;
        loop {
            let mut scan = ::redis::cmd("SCAN");
            scan.arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.scan_count);
            let (next, keys): (u64, Vec<String>) = self.query("scan", &scan).await?;

            let keys: Vec<String> = keys.into_iter().filter(|k| k.starts_with(prefix)).collect();
            if !keys.is_empty() {
                let mut del = ::redis::cmd("DEL");
                del.arg(&keys);
                let n: usize = self.query("clear", &del).await?;
                removed += n;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        debug!(prefix, removed, "redis locks cleared");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sentinel topology
// ---------------------------------------------------------------------------

/// Sentinel endpoints and primary credentials parsed from a
/// `sentinel://[[user]:password@]host[:port][/db];sentinel://...` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelTopology {
    /// `redis://host:port` address of each sentinel.
    pub sentinels: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: i64,
}

impl SentinelTopology {
    pub fn parse(url: &str) -> Result<Self> {
        let mut topology = SentinelTopology {
            sentinels: Vec::new(),
            username: None,
            password: None,
            db: 0,
        };

        for part in url.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let rest = part.strip_prefix(SENTINEL_SCHEME).ok_or_else(|| {
                Error::Config(format!("sentinel endpoint must start with {SENTINEL_SCHEME}"))
            })?;

            let (auth, hostport) = match rest.rsplit_once('@') {
                Some((auth, hostport)) => (Some(auth), hostport),
                None => (None, rest),
            };
            if let Some(auth) = auth {
                let (user, password) = match auth.split_once(':') {
                    Some((user, password)) => (user, Some(password)),
                    None => (auth, None),
                };
                if !user.is_empty() {
                    topology.username = Some(user.to_string());
                }
                if let Some(password) = password.filter(|p| !p.is_empty()) {
                    topology.password = Some(password.to_string());
                }
            }

            let (hostport, db) = match hostport.split_once('/') {
                Some((hostport, db)) => (hostport, Some(db)),
                None => (hostport, None),
            };
            if let Some(db) = db.filter(|d| !d.is_empty()) {
                topology.db = db
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid sentinel db `{db}`")))?;
            }

            let (host, port) = split_host_port(hostport)?;
            if host.contains(':') {
                topology.sentinels.push(format!("redis://[{host}]:{port}"));
            } else {
                topology.sentinels.push(format!("redis://{host}:{port}"));
            }
        }

        if topology.sentinels.is_empty() {
            return Err(Error::Config("sentinel URL names no endpoints".to_string()));
        }
        Ok(topology)
    }
}

fn split_host_port(hostport: &str) -> Result<(&str, u16)> {
    // bracketed IPv6: [::1]:26379
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::Config(format!("invalid sentinel host `{hostport}`")))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None => DEFAULT_SENTINEL_PORT,
        };
        return Ok((host, port));
    }
    let (host, port) = match hostport.rsplit_once(':') {
        Some((host, port)) => (host, parse_port(port)?),
        None => (hostport, DEFAULT_SENTINEL_PORT),
    };
    if host.is_empty() {
        return Err(Error::Config(format!("invalid sentinel host `{hostport}`")));
    }
    Ok((host, port))
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| Error::Config(format!("invalid sentinel port `{port}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[test]
    fn parses_multiple_sentinels_with_credentials() {
        let topology =
            SentinelTopology::parse("sentinel://:s3cret@10.0.0.1:26380/2;sentinel://10.0.0.2").unwrap();
        assert_eq!(
            topology.sentinels,
            vec!["redis://10.0.0.1:26380", "redis://10.0.0.2:26379"]
        );
        assert_eq!(topology.password.as_deref(), Some("s3cret"));
        assert_eq!(topology.username, None);
        assert_eq!(topology.db, 2);
    }

    #[test]
    fn parses_ipv6_and_username() {
        let topology = SentinelTopology::parse("sentinel://app:pw@[::1]:5000").unwrap();
        assert_eq!(topology.sentinels, vec!["redis://[::1]:5000"]);
        assert_eq!(topology.username.as_deref(), Some("app"));
    }

    #[test]
    fn rejects_bad_endpoints() {
        assert!(SentinelTopology::parse("").is_err());
        assert!(SentinelTopology::parse("redis://host:6379").is_err());
        assert!(SentinelTopology::parse("sentinel://host:notaport").is_err());
        assert!(SentinelTopology::parse("sentinel://host/x").is_err());
    }

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(escape_glob("lock_[a]*?"), "lock_\\[a\\]\\*\\?");
        assert_eq!(escape_glob("SINGLETONLOCK_"), "SINGLETONLOCK_");
    }

    #[test]
    fn sentinel_url_requires_master_name() {
        let config = BackendConfig {
            url: Some(SecretString::from("sentinel://localhost".to_string())),
            master_name: None,
            ..BackendConfig::default()
        };
        assert!(matches!(RedisBackend::from_config(&config), Err(Error::Config(_))));
    }

    #[test]
    fn rediscovery_follows_connection_loss_and_readonly() {
        let demoted = RedisError::from((ErrorKind::ReadOnly, "You can't write against a read only replica."));
        assert!(needs_rediscovery(&demoted));

        let reset = RedisError::from(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert!(needs_rediscovery(&reset));

        let rejected = RedisError::from((ErrorKind::ResponseError, "ERR wrong number of arguments"));
        assert!(!needs_rediscovery(&rejected));
    }
}
