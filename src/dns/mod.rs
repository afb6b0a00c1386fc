//! DNS client
//!
//! Static hosts are consulted first, then the system resolver. Answers are
//! filtered by the configured query strategy and kept in an LRU cache.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::{DnsSettings, QueryStrategy};
use crate::error::{Error, Result};

/// Default cache size for resolved domains
const DEFAULT_CACHE_SIZE: usize = 1024;

/// How long a system answer stays cached
const CACHE_TTL: Duration = Duration::from_secs(600);

struct CacheEntry {
    ips: Vec<IpAddr>,
    expires: Instant,
}

/// Resolver used by outbounds to turn domains into addresses
pub struct DnsClient {
    settings: DnsSettings,
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl DnsClient {
    pub fn new(settings: DnsSettings) -> Self {
        Self::with_cache_size(settings, DEFAULT_CACHE_SIZE)
    }

    pub fn with_cache_size(settings: DnsSettings, cache_size: usize) -> Self {
        let size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            settings,
            cache: Mutex::new(LruCache::new(size)),
        }
    }

    pub fn strategy(&self) -> QueryStrategy {
        self.settings.strategy
    }

    /// Resolve a domain. Never returns an empty list.
    pub async fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>> {
        let key = domain.trim_end_matches('.').to_ascii_lowercase();

        if let Some(ips) = self.settings.hosts.get(&key) {
            let ips = self.filter(ips.iter().copied());
            if !ips.is_empty() {
                trace!("DNS hosts hit for {}: {:?}", key, ips);
                return Ok(ips);
            }
        }

        // Check cache first
        {
            let mut cache = self.cache.lock();
            match cache.get(&key) {
                Some(entry) if entry.expires > Instant::now() => return Ok(entry.ips.clone()),
                Some(_) => {
                    cache.pop(&key);
                }
                None => {}
            }
        }

        // Port is irrelevant for resolution
        let answers = tokio::net::lookup_host((key.as_str(), 0))
            .await
            .map_err(|e| Error::Transport(format!("failed to resolve {}: {}", key, e)))?;
        let mut ips = self.filter(answers.map(|addr| addr.ip()));
        ips.dedup();

        if ips.is_empty() {
            return Err(Error::Transport(format!(
                "no {:?} address for {}",
                self.settings.strategy, key
            )));
        }

        debug!("Resolved {} -> {:?}", key, ips);

        self.cache.lock().put(
            key,
            CacheEntry {
                ips: ips.clone(),
                expires: Instant::now() + CACHE_TTL,
            },
        );

        Ok(ips)
    }

    fn filter(&self, ips: impl Iterator<Item = IpAddr>) -> Vec<IpAddr> {
        let strategy = self.settings.strategy;
        ips.filter(|ip| strategy.accepts(ip)).collect()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().len()
    }
}
