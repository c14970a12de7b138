//! Host safety checks for outbound requests.
//!
//! A host is safe only if every address it resolves to is publicly
//! routable. Blocked ranges:
//! - IPv4: 0.0.0.0/8, 10.0.0.0/8, 100.64.0.0/10, 127.0.0.0/8,
//!   169.254.0.0/16, 172.16.0.0/12, 192.168.0.0/16, 224.0.0.0/4, 240.0.0.0/4
//! - IPv6: ::/128, ::1/128, fc00::/7, fe80::/10, ff00::/8
//! - IPv4-mapped IPv6 addresses are judged by their embedded IPv4 address
//!
//! Ranges listed in [`SafetyChecker::allow`] are exempt.

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::IpAddr;
use std::sync::Arc;

const BLOCKED_V4: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "224.0.0.0/4",
    "240.0.0.0/4",
];

const BLOCKED_V6: &[&str] = &["::/128", "::1/128", "fc00::/7", "fe80::/10", "ff00::/8"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SafetyError {
    #[error("{host} resolves to blocked address {addr}")]
    Blocked { host: String, addr: IpAddr },

    #[error("no A/AAAA records for {0}")]
    NoRecords(String),

    #[error("failed to resolve {host}: {reason}")]
    Resolution { host: String, reason: String },
}

/// True if `ip` is unspecified or inside one of the blocked ranges
pub fn is_blocked(ip: IpAddr) -> bool {
    if ip.is_unspecified() {
        return true;
    }
    match ip {
        IpAddr::V4(v4) => BLOCKED_V4
            .iter()
            .filter_map(|cidr| cidr.parse::<Ipv4Net>().ok())
            .any(|net| net.contains(&v4)),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked(IpAddr::V4(mapped));
            }
            BLOCKED_V6
                .iter()
                .filter_map(|cidr| cidr.parse::<Ipv6Net>().ok())
                .any(|net| net.contains(&v6))
        }
    }
}

/// DNS lookup used by the checker
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// All A and AAAA answers for `host`. An empty list is a valid answer.
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, SafetyError>;
}

/// [`HostResolver`] backed by hickory, configured from the system
pub struct DnsResolver {
    inner: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn from_system_conf() -> Self {
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            tracing::warn!(
                "Failed to read system resolver config: {}. Falling back to defaults.",
                e
            );
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { inner }
    }
}

#[async_trait]
impl HostResolver for DnsResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, SafetyError> {
        match self.inner.lookup_ip(host).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(SafetyError::Resolution {
                    host: host.to_string(),
                    reason: e.to_string(),
                }),
            },
        }
    }
}

/// Classifies hosts as safe or blocked for outbound requests
pub struct SafetyChecker {
    resolver: Arc<dyn HostResolver>,
    allow: Vec<IpNet>,
}

impl SafetyChecker {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            resolver,
            allow: Vec::new(),
        }
    }

    /// Checker using the system DNS configuration
    pub fn system() -> Self {
        Self::new(Arc::new(DnsResolver::from_system_conf()))
    }

    /// Exempt `ranges` from the blocked list
    pub fn allow(mut self, ranges: impl IntoIterator<Item = IpNet>) -> Self {
        self.allow.extend(ranges);
        self
    }

    /// True if an outbound connection to `ip` is permitted
    pub fn is_addr_safe(&self, ip: IpAddr) -> bool {
        !is_blocked(ip) || self.allow.iter().any(|net| net.contains(&ip))
    }

    /// Check `host` and return the addresses it may be dialed on.
    ///
    /// Literal IPs (bracketed IPv6 included) are classified directly.
    /// Hostnames are resolved, and a single blocked answer rejects the whole
    /// host even if other answers are public.
    pub async fn check_host(&self, host: &str) -> Result<Vec<IpAddr>, SafetyError> {
        let trimmed = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let addrs = match trimmed.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => self.resolver.lookup(trimmed).await?,
        };

        if addrs.is_empty() {
            return Err(SafetyError::NoRecords(trimmed.to_string()));
        }

        if let Some(addr) = addrs.iter().copied().find(|ip| !self.is_addr_safe(*ip)) {
            tracing::warn!(host = trimmed, %addr, "Blocked outbound host");
            return Err(SafetyError::Blocked {
                host: trimmed.to_string(),
                addr,
            });
        }

        Ok(addrs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Resolver answering from a table. Each host maps to a list of answers
    /// handed out in order; the last answer repeats once the list runs out.
    #[derive(Default)]
    pub(crate) struct StaticResolver {
        answers: Mutex<HashMap<String, Vec<Vec<IpAddr>>>>,
    }

    impl StaticResolver {
        pub(crate) fn with(self, host: &str, answers: &[&[&str]]) -> Self {
            let parsed = answers
                .iter()
                .map(|ips| ips.iter().map(|ip| ip.parse().unwrap()).collect())
                .collect();
            self.answers
                .lock()
                .unwrap()
                .insert(host.to_string(), parsed);
            self
        }
    }

    #[async_trait]
    impl HostResolver for StaticResolver {
        async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, SafetyError> {
            let mut answers = self.answers.lock().unwrap();
            match answers.get_mut(host) {
                Some(queue) if queue.len() > 1 => Ok(queue.remove(0)),
                Some(queue) => Ok(queue.first().cloned().unwrap_or_default()),
                None => Err(SafetyError::Resolution {
                    host: host.to_string(),
                    reason: "NXDOMAIN".to_string(),
                }),
            }
        }
    }

    fn checker(resolver: StaticResolver) -> SafetyChecker {
        SafetyChecker::new(Arc::new(resolver))
    }

    #[test]
    fn test_range_tables_parse() {
        for cidr in BLOCKED_V4 {
            assert!(cidr.parse::<Ipv4Net>().is_ok(), "{}", cidr);
        }
        for cidr in BLOCKED_V6 {
            assert!(cidr.parse::<Ipv6Net>().is_ok(), "{}", cidr);
        }
    }

    #[test]
    fn test_blocked_ipv4() {
        for ip in [
            "127.0.0.1",
            "127.255.255.254",
            "10.0.0.1",
            "10.255.255.255",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "169.254.169.254",
            "100.64.0.1",
            "100.127.255.255",
            "0.0.0.0",
            "0.1.2.3",
            "224.0.0.1",
            "239.255.255.255",
            "240.0.0.1",
            "255.255.255.255",
        ] {
            assert!(is_blocked(ip.parse().unwrap()), "{} should be blocked", ip);
        }
    }

    #[test]
    fn test_blocked_ipv6() {
        for ip in [
            "::",
            "::1",
            "fe80::1",
            "febf::1",
            "fc00::1",
            "fd00:ec2::254",
            "ff02::1",
            "::ffff:127.0.0.1",
            "::ffff:10.1.2.3",
        ] {
            assert!(is_blocked(ip.parse().unwrap()), "{} should be blocked", ip);
        }
    }

    #[test]
    fn test_public_addresses_allowed() {
        for ip in [
            "93.184.216.34",
            "8.8.8.8",
            "1.1.1.1",
            "172.15.255.255",
            "172.32.0.1",
            "100.63.255.255",
            "100.128.0.1",
            "2606:2800:220:1:248:1893:25c8:1946",
            "2001:4860:4860::8888",
            "::ffff:93.184.216.34",
        ] {
            assert!(!is_blocked(ip.parse().unwrap()), "{} should be allowed", ip);
        }
    }

    #[tokio::test]
    async fn test_literal_ips_skip_resolution() {
        let checker = checker(StaticResolver::default());
        assert!(checker.check_host("93.184.216.34").await.is_ok());
        assert!(matches!(
            checker.check_host("127.0.0.1").await,
            Err(SafetyError::Blocked { .. })
        ));
        assert!(matches!(
            checker.check_host("[::1]").await,
            Err(SafetyError::Blocked { .. })
        ));
    }

    #[tokio::test]
    async fn test_any_blocked_answer_rejects_host() {
        let resolver = StaticResolver::default()
            .with("public.test", &[&["93.184.216.34", "2606:2800:220:1::1"]])
            .with("mixed.test", &[&["93.184.216.34", "10.0.0.7"]]);
        let checker = checker(resolver);

        assert_eq!(checker.check_host("public.test").await.unwrap().len(), 2);
        assert_eq!(
            checker.check_host("mixed.test").await,
            Err(SafetyError::Blocked {
                host: "mixed.test".to_string(),
                addr: "10.0.0.7".parse().unwrap(),
            })
        );
    }

    #[tokio::test]
    async fn test_resolution_failures() {
        let resolver = StaticResolver::default().with("empty.test", &[&[]]);
        let checker = checker(resolver);

        assert_eq!(
            checker.check_host("empty.test").await,
            Err(SafetyError::NoRecords("empty.test".to_string()))
        );
        assert!(matches!(
            checker.check_host("nowhere.test").await,
            Err(SafetyError::Resolution { .. })
        ));
    }

    #[tokio::test]
    async fn test_allow_list_exempts_ranges() {
        let checker = checker(StaticResolver::default())
            .allow(["127.0.0.0/8".parse::<IpNet>().unwrap()]);
        assert!(checker.check_host("127.0.0.1").await.is_ok());
        assert!(checker.check_host("10.0.0.1").await.is_err());
    }
}
