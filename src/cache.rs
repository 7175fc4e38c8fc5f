//! Redis-backed response cache (spec §4.5): a single host or a cluster,
//! keyed by a SHA-1 fingerprint of `redis_prefix || path || "/" || raw_query`.
//! POST requests never read or write the cache.

use sha1::{Digest, Sha1};

use crate::config::{redis_host_port, Config};
use crate::telemetry::MetaData;

/// The subset of a pipeline's output actually worth caching: the encoded
/// bytes, the format used to encode them, and the `g`/`c` metric groups
/// recorded while producing them (timings are deliberately NOT cached —
/// a cache hit gets its own `time_cache_read` instead).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheEntry {
    pub out_fmt: String,
    pub out_bytes: Vec<u8>,
    pub meta_g: std::collections::BTreeMap<String, i64>,
    pub meta_c: std::collections::BTreeMap<String, i64>,
}

impl CacheEntry {
    pub fn into_meta_data(self) -> (MetaData, String, Vec<u8>) {
        let mut meta = MetaData::new();
        meta.g = self.meta_g;
        meta.c = self.meta_c;
        (meta, self.out_fmt, self.out_bytes)
    }
}

/// Fingerprint a request the way the original does: `sha1(prefix + path +
/// "/" + raw_query)`, using the RAW (pre-normalization) query string so
/// differently-ordered-but-equivalent queries land on different keys.
pub fn fingerprint(prefix: &str, path: &str, raw_query: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(prefix.as_bytes());
    hasher.update(path.as_bytes());
    hasher.update(b"/");
    hasher.update(raw_query.as_bytes());
    hex::encode(hasher.finalize())
}

enum Backend {
    Single(redis::aio::MultiplexedConnection),
    Cluster(redis::cluster_async::ClusterConnection),
}

/// Thin wrapper around a `redis` connection, single-host or cluster
/// depending on `Config::redis_cluster`. Connection setup mirrors the
/// original's `redis_setup()`.
pub struct Cache {
    backend: Backend,
}

impl Cache {
    /// Returns `None` when `redis_hosts` is unset, matching the original
    /// leaving `redis_client` as `None` and the caller treating caching as
    /// simply unavailable.
    pub async fn connect(cfg: &Config) -> Option<Self> {
        let hosts = cfg.redis_hosts.as_ref()?;

        if cfg.redis_cluster {
            let urls: Vec<String> = hosts
                .split(',')
                .map(|h| {
                    let (host, port) = redis_host_port(h.trim());
                    format!("redis://{host}:{port}")
                })
                .collect();
            let client = redis::cluster::ClusterClientBuilder::new(urls).build().ok()?;
            let conn = client.get_async_connection().await.ok()?;
            Some(Cache { backend: Backend::Cluster(conn) })
        } else {
            let (host, port) = redis_host_port(hosts);
            let client = redis::Client::open(format!("redis://{host}:{port}")).ok()?;
            let conn = client.get_multiplexed_async_connection().await.ok()?;
            Some(Cache { backend: Backend::Single(conn) })
        }
    }

    pub async fn get(&mut self, key: &str) -> Option<CacheEntry> {
        use redis::AsyncCommands;
        let raw: Vec<u8> = match &mut self.backend {
            Backend::Single(conn) => conn.get(key).await.ok()?,
            Backend::Cluster(conn) => conn.get(key).await.ok()?,
        };
        if raw.is_empty() {
            return None;
        }
        serde_json::from_slice(&raw).ok()
    }

    pub async fn put(&mut self, key: &str, entry: &CacheEntry) -> bool {
        use redis::AsyncCommands;
        let Ok(raw) = serde_json::to_vec(entry) else {
            return false;
        };
        let result: redis::RedisResult<()> = match &mut self.backend {
            Backend::Single(conn) => conn.set(key, raw).await,
            Backend::Cluster(conn) => conn.set(key, raw).await,
        };
        result.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_sensitive_to_raw_query_order() {
        let a = fingerprint("dirpy", "/img.jpg", "resize=w:10&crop=n:5");
        let b = fingerprint("dirpy", "/img.jpg", "crop=n:5&resize=w:10");
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = fingerprint("dirpy", "/img.jpg", "resize=w:10");
        let b = fingerprint("dirpy", "/img.jpg", "resize=w:10");
        assert_eq!(a, b);
    }
}
