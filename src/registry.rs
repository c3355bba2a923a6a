//! Port registry for proxied hosts, stored in Redis.
//!
//! Each entry is the JSON metadata a host registered with, keyed by its
//! local proxy port. Entries are written by `POST /register`, dropped by
//! `DELETE /deregister/{port}` or by a failed login to that port, and swept
//! by `GET /clean` when nothing listens on the port any more.

use std::fmt;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;

const SCAN_BATCH: usize = 100;
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum RegistryError {
    /// Redis is unreachable or rejected a command.
    Redis(String),
    /// The entry has no usable `port` field.
    InvalidEntry(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redis(e) => write!(f, "Registry unavailable: {e}"),
            Self::InvalidEntry(e) => write!(f, "Invalid registry entry: {e}"),
        }
    }
}

impl From<redis::RedisError> for RegistryError {
    fn from(e: redis::RedisError) -> Self {
        Self::Redis(e.to_string())
    }
}

/// Registry key for an entry: its `port`, given as an integer or a numeric
/// string.
pub fn port_key(entry: &Value) -> Option<String> {
    let port = match entry.get("port")? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    u16::try_from(port)
        .ok()
        .filter(|&p| p > 0)
        .map(|p| p.to_string())
}

pub struct PortRegistry {
    client: redis::Client,
    probe_host: String,
}

impl PortRegistry {
    /// Parses the URL only; Redis is contacted on first use.
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        Ok(Self {
            client: redis::Client::open(config.redis_url.as_str())?,
            probe_host: config.probe_host.clone(),
        })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, RegistryError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Store `entry` under its port. Returns the key.
    pub async fn register(&self, entry: &Value) -> Result<String, RegistryError> {
        let key = port_key(entry)
            .ok_or_else(|| RegistryError::InvalidEntry("missing or bad port".to_string()))?;
        let mut conn = self.conn().await?;
        redis::cmd("SET")
            .arg(&key)
            .arg(entry.to_string())
            .query_async::<_, ()>(&mut conn)
            .await?;
        info!("Registered port {key}");
        Ok(key)
    }

    pub async fn deregister(&self, key: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        info!("Deregistered port {key}");
        Ok(())
    }

    /// Every registered entry. Values that are not JSON are skipped.
    pub async fn hosts(&self) -> Result<Vec<(String, Value)>, RegistryError> {
        let mut conn = self.conn().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        let mut hosts = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = redis::cmd("GET")
                .arg(&key)
                .query_async(&mut conn)
                .await?;
            match raw.as_deref().map(serde_json::from_str::<Value>) {
                Some(Ok(value)) => hosts.push((key, value)),
                Some(Err(e)) => warn!("Registry key {key} holds invalid JSON: {e}"),
                None => {}
            }
        }
        Ok(hosts)
    }

    /// Probe every entry's port and drop the ones nothing listens on.
    /// Returns the survivors.
    pub async fn clean(&self) -> Result<Vec<Value>, RegistryError> {
        let mut alive = Vec::new();
        for (key, entry) in self.hosts().await? {
            let port = port_key(&entry).and_then(|p| p.parse::<u16>().ok());
            let open = match port {
                Some(port) => is_port_open(&self.probe_host, port).await,
                None => false,
            };
            if open {
                alive.push(entry);
            } else {
                debug!("Port {key} is dead, evicting");
                self.deregister(&key).await?;
            }
        }
        Ok(alive)
    }
}

/// A local TCP port that is free right now.
pub async fn find_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("0.0.0.0:0").await?;
    Ok(listener.local_addr()?.port())
}

pub async fn is_port_open(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}
