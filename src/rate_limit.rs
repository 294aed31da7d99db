//! Per-client-IP token bucket rate limiting.
//!
//! Buckets refill continuously at the configured RPS and cap at the burst
//! size. A zero RPS or burst disables limiting entirely; loopback callers
//! and requests whose client IP cannot be derived bypass the limiter.
//! Client IPs behind trusted proxies are derived by walking
//! `X-Forwarded-For` right-to-left, which keeps a spoofed left side inert.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::warn;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    rps: f64,
    burst: f64,
    idle_ttl: Duration,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new(rps: f64, burst: f64, idle_ttl: Duration) -> Self {
        Self {
            rps,
            burst,
            idle_ttl,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.rps > 0.0 && self.burst > 0.0
    }

    /// Check and consume one token for the client.
    pub fn allow(&self, ip: IpAddr) -> bool {
        if !self.enabled() || ip.is_loopback() {
            return true;
        }

        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(ip).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rps).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            warn!("rate limit exceeded for {}", ip);
            false
        }
    }

    /// Drop buckets that have been idle longer than the TTL.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets
            .retain(|_, b| now.saturating_duration_since(b.last_refill) <= self.idle_ttl);
        before - buckets.len()
    }

    /// Sweeper cadence: half the idle TTL, at least one second.
    pub fn sweep_interval(&self) -> Duration {
        std::cmp::max(Duration::from_secs(1), self.idle_ttl / 2)
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

/// Trusted proxy set expressed as CIDR blocks (a bare address is a /32
/// or /128).
pub struct TrustedProxies {
    cidrs: Vec<(IpAddr, u8)>,
}

impl TrustedProxies {
    pub fn parse(specs: &[String]) -> anyhow::Result<Self> {
        let mut cidrs = Vec::with_capacity(specs.len());
        for spec in specs {
            let (addr, prefix) = match spec.split_once('/') {
                Some((addr, prefix)) => {
                    let addr: IpAddr = addr
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid proxy address '{spec}'"))?;
                    let prefix: u8 = prefix
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid proxy prefix '{spec}'"))?;
                    let max = if addr.is_ipv4() { 32 } else { 128 };
                    if prefix > max {
                        anyhow::bail!("proxy prefix out of range in '{spec}'");
                    }
                    (addr, prefix)
                }
                None => {
                    let addr: IpAddr = spec
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid proxy address '{spec}'"))?;
                    let prefix = if addr.is_ipv4() { 32 } else { 128 };
                    (addr, prefix)
                }
            };
            cidrs.push((addr, prefix));
        }
        Ok(Self { cidrs })
    }

    pub fn is_empty(&self) -> bool {
        self.cidrs.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.cidrs
            .iter()
            .any(|(net, prefix)| cidr_contains(*net, *prefix, ip))
    }
}

fn cidr_contains(net: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let bits = u32::from(net) ^ u32::from(ip);
            prefix == 0 || bits >> (32 - u32::from(prefix)) == 0
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let bits = u128::from(net) ^ u128::from(ip);
            prefix == 0 || bits >> (128 - u32::from(prefix)) == 0
        }
        _ => false,
    }
}

/// Derive the effective client IP for a request.
///
/// When the peer is a trusted proxy, `X-Forwarded-For` is walked from the
/// right and the first address outside the trusted set wins; a client can
/// prepend whatever it likes on the left without effect. Otherwise the
/// peer address is authoritative.
pub fn client_ip(
    remote: SocketAddr,
    forwarded_for: Option<&str>,
    proxies: &TrustedProxies,
) -> Option<IpAddr> {
    let peer = remote.ip();
    if proxies.is_empty() || !proxies.contains(peer) {
        return Some(peer);
    }

    if let Some(header) = forwarded_for {
        for entry in header.split(',').rev() {
            match normalize_ip(entry) {
                Some(ip) if !proxies.contains(ip) => return Some(ip),
                _ => continue,
            }
        }
    }
    Some(peer)
}

/// Canonical parse of one forwarded-for entry: brackets, IPv6 zone ids,
/// and v4 port suffixes stripped.
pub fn normalize_ip(raw: &str) -> Option<IpAddr> {
    let mut s = raw.trim();
    if let Some(stripped) = s.strip_prefix('[') {
        s = stripped.split(']').next().unwrap_or(stripped);
    }
    let s = s.split('%').next().unwrap_or(s);
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some(ip);
    }
    // v4 with a port, e.g. "10.0.0.1:4711".
    if let Ok(sock) = s.parse::<SocketAddr>() {
        return Some(sock.ip());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn consumes_burst_then_rejects() {
        let limiter = RateLimiter::new(1.0, 2.0, Duration::from_secs(60));
        let client = ip("10.0.0.9");
        assert!(limiter.allow(client));
        assert!(limiter.allow(client));
        assert!(!limiter.allow(client));
    }

    #[test]
    fn refills_over_time() {
        let limiter = RateLimiter::new(50.0, 5.0, Duration::from_secs(60));
        let client = ip("10.0.0.9");
        for _ in 0..5 {
            assert!(limiter.allow(client));
        }
        assert!(!limiter.allow(client));

        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.allow(client));
    }

    #[test]
    fn zero_rps_disables() {
        let limiter = RateLimiter::new(0.0, 10.0, Duration::from_secs(60));
        let client = ip("10.0.0.9");
        for _ in 0..100 {
            assert!(limiter.allow(client));
        }
    }

    #[test]
    fn loopback_bypasses() {
        let limiter = RateLimiter::new(1.0, 1.0, Duration::from_secs(60));
        assert!(limiter.allow(ip("127.0.0.1")));
        assert!(limiter.allow(ip("127.0.0.1")));
        assert!(limiter.allow(ip("::1")));
    }

    #[test]
    fn sweep_drops_idle_buckets() {
        let limiter = RateLimiter::new(1.0, 1.0, Duration::from_millis(10));
        limiter.allow(ip("10.0.0.1"));
        limiter.allow(ip("10.0.0.2"));
        assert_eq!(limiter.bucket_count(), 2);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(limiter.sweep(Instant::now()), 2);
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn cidr_membership() {
        let proxies =
            TrustedProxies::parse(&["10.0.0.0/8".to_string(), "192.168.1.1".to_string()])
                .unwrap();
        assert!(proxies.contains(ip("10.200.3.4")));
        assert!(proxies.contains(ip("192.168.1.1")));
        assert!(!proxies.contains(ip("192.168.1.2")));
        assert!(!proxies.contains(ip("11.0.0.1")));
    }

    #[test]
    fn untrusted_peer_ignores_forwarded_for() {
        let proxies = TrustedProxies::parse(&["10.0.0.0/8".to_string()]).unwrap();
        let remote: SocketAddr = "203.0.113.7:9000".parse().unwrap();
        let got = client_ip(remote, Some("1.2.3.4"), &proxies);
        assert_eq!(got, Some(ip("203.0.113.7")));
    }

    #[test]
    fn trusted_peer_walks_right_to_left() {
        let proxies = TrustedProxies::parse(&["10.0.0.0/8".to_string()]).unwrap();
        let remote: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        // The spoofed left entry must lose to the right-most external hop.
        let got = client_ip(remote, Some("6.6.6.6, 198.51.100.2, 10.0.0.2"), &proxies);
        assert_eq!(got, Some(ip("198.51.100.2")));
    }

    #[test]
    fn all_trusted_chain_falls_back_to_peer() {
        let proxies = TrustedProxies::parse(&["10.0.0.0/8".to_string()]).unwrap();
        let remote: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let got = client_ip(remote, Some("10.0.0.3, 10.0.0.2"), &proxies);
        assert_eq!(got, Some(ip("10.0.0.1")));
    }

    #[test]
    fn normalizes_brackets_zones_and_ports() {
        assert_eq!(normalize_ip(" [::1] "), Some(ip("::1")));
        assert_eq!(normalize_ip("fe80::1%eth0"), Some(ip("fe80::1")));
        assert_eq!(normalize_ip("10.0.0.1:443"), Some(ip("10.0.0.1")));
        assert_eq!(normalize_ip("garbage"), None);
    }
}
