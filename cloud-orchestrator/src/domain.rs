//! Domain ownership validation for vhosts.
//!
//! A vhost is checked against these rules, in order:
//!
//! 1. The instance's own fqdn is always valid.
//! 2. Any other name under a kind base domain is reserved and rejected.
//! 3. Names under the service base domain must be exactly
//!    `<owner>.<service base>` and not a blacklisted label.
//! 4. Anything else is a custom domain: it must resolve only to allowed
//!    addresses, and a TXT record `<label>.<registrable domain>` must hold the
//!    owner's username.
//!
//! Failures never raise. Each problem becomes a remark and the domain is
//! valid only when there are none.

use async_trait::async_trait;
use cloud_config::CloudConfig;
use cloud_provider::InstanceKind;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("no records found")]
    NoRecords,
    #[error("{0}")]
    Failed(String),
}

pub type LookupResult<T> = std::result::Result<T, LookupError>;

#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// A and AAAA records of `name`.
    async fn lookup_ip(&self, name: &str) -> LookupResult<Vec<IpAddr>>;

    /// TXT records of `name`, each with its character strings joined.
    async fn lookup_txt(&self, name: &str) -> LookupResult<Vec<String>>;
}

/// Resolver backed by the host's resolver configuration.
pub struct HickoryResolver {
    inner: TokioAsyncResolver,
}

impl HickoryResolver {
    pub fn from_system_conf() -> anyhow::Result<Self> {
        let inner = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| anyhow::anyhow!("Failed to read system resolver configuration: {e}"))?;
        Ok(Self { inner })
    }
}

fn lookup_error(err: ResolveError) -> LookupError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => LookupError::NoRecords,
        _ => LookupError::Failed(err.to_string()),
    }
}

#[async_trait]
impl DnsResolver for HickoryResolver {
    async fn lookup_ip(&self, name: &str) -> LookupResult<Vec<IpAddr>> {
        let lookup = self.inner.lookup_ip(name).await.map_err(lookup_error)?;
        Ok(lookup.iter().collect())
    }

    async fn lookup_txt(&self, name: &str) -> LookupResult<Vec<String>> {
        let lookup = self.inner.txt_lookup(name).await.map_err(lookup_error)?;
        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<String>()
            })
            .collect())
    }
}

/// In-memory DNS zone for tests and offline setups.
#[derive(Default)]
pub struct StaticResolver {
    ips: Mutex<BTreeMap<String, Vec<IpAddr>>>,
    txt: Mutex<BTreeMap<String, Vec<String>>>,
    broken: Mutex<BTreeSet<String>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ip(&self, name: &str, ip: IpAddr) -> &Self {
        if let Ok(mut ips) = self.ips.lock() {
            ips.entry(name.to_string()).or_default().push(ip);
        }
        self
    }

    pub fn add_txt(&self, name: &str, value: &str) -> &Self {
        if let Ok(mut txt) = self.txt.lock() {
            txt.entry(name.to_string()).or_default().push(value.to_string());
        }
        self
    }

    /// Make every lookup of `name` fail with a server error.
    pub fn break_name(&self, name: &str) -> &Self {
        if let Ok(mut broken) = self.broken.lock() {
            broken.insert(name.to_string());
        }
        self
    }

    fn lookup<T: Clone>(
        &self,
        zone: &Mutex<BTreeMap<String, Vec<T>>>,
        name: &str,
    ) -> LookupResult<Vec<T>> {
        let broken = self
            .broken
            .lock()
            .map_err(|_| LookupError::Failed("resolver state poisoned".to_string()))?;
        if broken.contains(name) {
            return Err(LookupError::Failed(format!("SERVFAIL for {name}")));
        }
        let zone = zone
            .lock()
            .map_err(|_| LookupError::Failed("resolver state poisoned".to_string()))?;
        match zone.get(name) {
            Some(records) if !records.is_empty() => Ok(records.clone()),
            _ => Err(LookupError::NoRecords),
        }
    }
}

#[async_trait]
impl DnsResolver for StaticResolver {
    async fn lookup_ip(&self, name: &str) -> LookupResult<Vec<IpAddr>> {
        self.lookup(&self.ips, name)
    }

    async fn lookup_txt(&self, name: &str) -> LookupResult<Vec<String>> {
        self.lookup(&self.txt, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainValidation {
    pub valid: bool,
    pub remarks: Vec<String>,
}

impl DomainValidation {
    fn from_remarks(remarks: Vec<String>) -> Self {
        Self {
            valid: remarks.is_empty(),
            remarks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRules {
    pub kind_base_domains: Vec<String>,
    pub service_base_domain: String,
    pub blacklisted_subdomains: Vec<String>,
    pub verification_txt_name: String,
    pub allowed_a_aaaa: Vec<IpAddr>,
}

impl DomainRules {
    pub fn from_config(config: &CloudConfig) -> Self {
        let vhosts = &config.network.vhosts;
        Self {
            kind_base_domains: vec![config.container_base_fqdn(), config.vps_base_fqdn()],
            service_base_domain: vhosts.service_subdomain.base_domain.clone(),
            blacklisted_subdomains: vhosts.service_subdomain.blacklisted_subdomains.clone(),
            verification_txt_name: vhosts.user_domain.verification_txt_name.clone(),
            allowed_a_aaaa: vhosts.user_domain.allowed_a_aaaa.clone(),
        }
    }

    fn is_under(domain: &str, base: &str) -> bool {
        domain == base || domain.ends_with(&format!(".{base}"))
    }

    /// Whether a vhost is served with the service certificate resolver.
    pub fn is_service_domain(&self, domain: &str) -> bool {
        Self::is_under(domain, &self.service_base_domain)
            || self
                .kind_base_domains
                .iter()
                .any(|base| Self::is_under(domain, base))
    }
}

#[derive(Clone)]
pub struct DomainValidator {
    resolver: Arc<dyn DnsResolver>,
    rules: DomainRules,
}

impl DomainValidator {
    pub fn new(resolver: Arc<dyn DnsResolver>, rules: DomainRules) -> Self {
        Self { resolver, rules }
    }

    pub fn rules(&self) -> &DomainRules {
        &self.rules
    }

    /// Validate `domain` as a vhost of the instance `fqdn` owned by `owner`.
    pub async fn validate(&self, owner: &str, fqdn: &str, domain: &str) -> DomainValidation {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();

        if domain == fqdn.to_ascii_lowercase() {
            return DomainValidation::from_remarks(Vec::new());
        }

        if let Some(base) = self
            .rules
            .kind_base_domains
            .iter()
            .find(|base| DomainRules::is_under(&domain, base))
        {
            return DomainValidation::from_remarks(vec![format!(
                "Invalid domain {domain}: names under {base} are reserved for instance hostnames"
            )]);
        }

        let service_base = &self.rules.service_base_domain;
        if DomainRules::is_under(&domain, service_base) {
            return DomainValidation::from_remarks(self.service_subdomain_remarks(
                owner,
                &domain,
                service_base,
            ));
        }

        DomainValidation::from_remarks(self.custom_domain_remarks(owner, &domain).await)
    }

    fn service_subdomain_remarks(&self, owner: &str, domain: &str, base: &str) -> Vec<String> {
        let mut remarks = Vec::new();
        let prefix = domain
            .strip_suffix(base)
            .unwrap_or_default()
            .trim_end_matches('.');
        let labels: Vec<&str> = prefix.split('.').filter(|l| !l.is_empty()).collect();

        if labels.len() != 1 {
            remarks.push(format!(
                "Invalid domain {domain}: only one subdomain level is allowed, e.g. '{owner}.{base}'"
            ));
            return remarks;
        }

        let label = labels[0];
        if label != owner.to_ascii_lowercase() {
            remarks.push(format!(
                "Invalid domain {domain}: the subdomain '{label}' does not match the owner '{owner}'"
            ));
        }
        if self
            .rules
            .blacklisted_subdomains
            .iter()
            .any(|b| b.eq_ignore_ascii_case(label))
        {
            remarks.push(format!(
                "Invalid domain {domain}: the subdomain '{label}' is blacklisted"
            ));
        }
        remarks
    }

    async fn custom_domain_remarks(&self, owner: &str, domain: &str) -> Vec<String> {
        let mut remarks = Vec::new();

        match self.resolver.lookup_ip(domain).await {
            Ok(addresses) if !addresses.is_empty() => {
                let allowed = &self.rules.allowed_a_aaaa;
                for address in addresses {
                    if !allowed.contains(&address) {
                        remarks.push(format!(
                            "Invalid domain {domain}: unknown A/AAAA record ({address}), must be one of {allowed:?}"
                        ));
                    }
                }
            }
            Ok(_) | Err(LookupError::NoRecords) => {
                remarks.push(format!("Invalid domain {domain}: no A or AAAA records present"));
            }
            Err(LookupError::Failed(e)) => {
                remarks.push(format!(
                    "Could not verify custom domain {domain}: {e}, is the domain registered?"
                ));
                return remarks;
            }
        }

        let txt_name = format!(
            "{}.{}",
            self.rules.verification_txt_name,
            registrable_domain(domain)
        );
        match self.resolver.lookup_txt(&txt_name).await {
            Ok(values) => {
                if !values.iter().any(|v| v.trim_matches('"') == owner) {
                    remarks.push(format!(
                        "Invalid domain {domain}: TXT record {txt_name} must be set to {owner}, found {values:?}"
                    ));
                }
            }
            Err(LookupError::NoRecords) => {
                remarks.push(format!(
                    "Invalid domain {domain}: could not find TXT record {txt_name} set to {owner}"
                ));
            }
            Err(LookupError::Failed(e)) => {
                remarks.push(format!(
                    "Invalid domain {domain}: unable to look up {txt_name}: {e}"
                ));
            }
        }

        debug!(domain, remarks = remarks.len(), "custom domain checked");
        remarks
    }
}

/// The last two labels of `domain`.
pub fn registrable_domain(domain: &str) -> String {
    let labels: Vec<&str> = domain.trim_end_matches('.').split('.').collect();
    let start = labels.len().saturating_sub(2);
    labels[start..].join(".")
}

fn label_regex() -> &'static Regex {
    static LABEL: OnceLock<Regex> = OnceLock::new();
    LABEL.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$")
            .expect("hostname label pattern is valid")
    })
}

/// Syntax check for a lowercase DNS hostname with at least two labels.
pub fn is_valid_hostname(name: &str) -> bool {
    let name = name.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = name.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|label| label_regex().is_match(label))
}

/// Syntax check for a single lowercase hostname label.
pub fn is_valid_label(label: &str) -> bool {
    label_regex().is_match(label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const FQDN: &str = "web.alice.container.cloud.example.org";

    fn rules() -> DomainRules {
        DomainRules {
            kind_base_domains: vec![
                "container.cloud.example.org".into(),
                "vps.cloud.example.org".into(),
            ],
            service_base_domain: "users.example.org".into(),
            blacklisted_subdomains: vec!["www".into()],
            verification_txt_name: "_cloud".into(),
            allowed_a_aaaa: vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10))],
        }
    }

    fn validator(resolver: StaticResolver) -> DomainValidator {
        DomainValidator::new(Arc::new(resolver), rules())
    }

    #[tokio::test]
    async fn test_own_fqdn_is_valid() {
        let result = validator(StaticResolver::new()).validate("alice", FQDN, FQDN).await;
        assert_eq!(result, DomainValidation { valid: true, remarks: vec![] });
    }

    #[tokio::test]
    async fn test_reserved_namespace_is_rejected() {
        let v = validator(StaticResolver::new());
        let other = v
            .validate("alice", FQDN, "db.alice.container.cloud.example.org")
            .await;
        assert!(!other.valid);
        assert_eq!(other.remarks.len(), 1);

        let other_kind = v.validate("alice", FQDN, "x.bob.vps.cloud.example.org").await;
        assert!(!other_kind.valid);
    }

    #[tokio::test]
    async fn test_service_subdomain_must_match_owner() {
        let v = validator(StaticResolver::new());
        assert!(v.validate("alice", FQDN, "alice.users.example.org").await.valid);
        assert!(!v.validate("bob", FQDN, "alice.users.example.org").await.valid);
        assert!(!v.validate("alice", FQDN, "blog.alice.users.example.org").await.valid);
        assert!(!v.validate("alice", FQDN, "users.example.org").await.valid);
    }

    #[tokio::test]
    async fn test_blacklisted_label_is_rejected() {
        let v = validator(StaticResolver::new());
        let result = v.validate("www", FQDN, "www.users.example.org").await;
        assert!(!result.valid);
        assert!(result.remarks[0].contains("blacklisted"));
    }

    #[tokio::test]
    async fn test_custom_domain_with_records_is_valid() {
        let resolver = StaticResolver::new();
        resolver
            .add_ip("blog.alice.dev", IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)))
            .add_txt("_cloud.alice.dev", "alice");
        let result = validator(resolver).validate("alice", FQDN, "blog.alice.dev").await;
        assert!(result.valid, "{:?}", result.remarks);
    }

    #[tokio::test]
    async fn test_custom_domain_problems_become_remarks() {
        let resolver = StaticResolver::new();
        resolver
            .add_ip("shop.example.net", IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)))
            .add_txt("_cloud.example.net", "mallory");
        let result = validator(resolver)
            .validate("alice", FQDN, "shop.example.net")
            .await;
        assert!(!result.valid);
        assert_eq!(result.remarks.len(), 2);
    }

    #[tokio::test]
    async fn test_unresolvable_domain() {
        let v = validator(StaticResolver::new());
        let missing = v.validate("alice", FQDN, "nothing.example.com").await;
        assert!(!missing.valid);
        assert!(missing.remarks[0].contains("no A or AAAA"));

        let resolver = StaticResolver::new();
        resolver.break_name("flaky.example.com");
        let flaky = validator(resolver)
            .validate("alice", FQDN, "flaky.example.com")
            .await;
        assert_eq!(flaky.remarks.len(), 1);
        assert!(flaky.remarks[0].starts_with("Could not verify"));
    }

    #[test]
    fn test_registrable_domain() {
        assert_eq!(registrable_domain("a.b.example.com"), "example.com");
        assert_eq!(registrable_domain("example.com."), "example.com");
        assert_eq!(registrable_domain("localhost"), "localhost");
    }

    #[test]
    fn test_hostname_syntax() {
        assert!(is_valid_hostname("blog.alice.dev"));
        assert!(is_valid_hostname("a-b.example.org."));
        assert!(!is_valid_hostname("localhost"));
        assert!(!is_valid_hostname("-bad.example.org"));
        assert!(!is_valid_hostname("under_score.example.org"));
        assert!(!is_valid_hostname("a..b.org"));
        assert!(is_valid_label("web1"));
        assert!(!is_valid_label("web.1"));
        assert!(!is_valid_label("WEB"));
        assert!(!is_valid_hostname("Blog.alice.dev"));
    }

    #[test]
    fn test_service_domain_classification() {
        let rules = rules();
        assert!(rules.is_service_domain("alice.users.example.org"));
        assert!(rules.is_service_domain(FQDN));
        assert!(!rules.is_service_domain("blog.alice.dev"));
    }
}
