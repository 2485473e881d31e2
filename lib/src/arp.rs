//! MAC-address lookups for the optional `src_mac` logging field. Looking up
//! the OS ARP/neighbor table is a platform concern this crate doesn't own;
//! `ArpResolver` is the seam a caller plugs a real lookup into, with a no-op
//! default and a TTL-caching decorator around any resolver.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use ttl_cache::TtlCache;

/// Resolves an IP to a MAC address string (already formatted, e.g.
/// `"aa:bb:cc:dd:ee:ff"`). Implementations are expected to be cheap or
/// cached; this is called on the hot path of every logged connection.
pub trait ArpResolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> Option<String>;
}

/// Resolves nothing. Used when no platform-specific ARP lookup is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullArpResolver;

impl ArpResolver for NullArpResolver {
    fn resolve(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// Wraps another resolver with a bounded TTL cache so repeated lookups for
/// the same address within the refresh window don't re-hit the inner
/// resolver on every request.
pub struct CachingArpResolver<R> {
    inner: R,
    cache: Mutex<TtlCache<IpAddr, Option<String>>>,
    ttl: Duration,
}

impl<R: ArpResolver> CachingArpResolver<R> {
    pub fn new(inner: R, capacity: usize, ttl: Duration) -> Self {
        Self {
            inner,
            cache: Mutex::new(TtlCache::new(capacity)),
            ttl,
        }
    }
}

impl<R: ArpResolver> ArpResolver for CachingArpResolver<R> {
    fn resolve(&self, ip: IpAddr) -> Option<String> {
        let mut cache = self.cache.lock().expect("arp cache mutex poisoned");
        if let Some(cached) = cache.get(&ip) {
            return cached.clone();
        }
        let resolved = self.inner.resolve(ip);
        cache.insert(ip, resolved.clone(), self.ttl);
        resolved
    }
}
