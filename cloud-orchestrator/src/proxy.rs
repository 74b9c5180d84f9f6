//! Dynamic configuration for the reverse proxy.
//!
//! Rebuilt from a full instance scan on every request. Every vhost that
//! validates becomes an HTTP router and service; every forwarded port becomes
//! a TCP and a UDP router and service. Maps are ordered so that the same
//! snapshot always serialises to the same document.

use cloud_config::ProxyConfig as ProxySettings;
use cloud_core::Result;
use cloud_ports::PortForwardMap;
use cloud_provider::VhostOptions;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

use crate::lifecycle::InstanceManager;
use crate::registry::port_claims;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProxyDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HttpSection {
    pub routers: BTreeMap<String, HttpRouter>,
    pub services: BTreeMap<String, Service<UrlServer>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TcpSection {
    pub routers: BTreeMap<String, TcpRouter>,
    pub services: BTreeMap<String, Service<AddressServer>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UdpSection {
    pub routers: BTreeMap<String, UdpRouter>,
    pub services: BTreeMap<String, Service<AddressServer>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouter {
    pub entry_points: Vec<String>,
    pub rule: String,
    pub service: String,
    pub tls: RouterTls,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterTls {
    pub cert_resolver: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpRouter {
    pub entry_points: Vec<String>,
    pub rule: String,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UdpRouter {
    pub entry_points: Vec<String>,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service<S> {
    pub load_balancer: LoadBalancer<S>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadBalancer<S> {
    pub servers: Vec<S>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrlServer {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressServer {
    pub address: String,
}

impl<S> Service<S> {
    fn single(server: S) -> Self {
        Self {
            load_balancer: LoadBalancer {
                servers: vec![server],
            },
        }
    }
}

/// A vhost that passed validation, ready to be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedVhost {
    pub fqdn: String,
    pub address: Ipv4Addr,
    pub vhost: String,
    pub options: VhostOptions,
    /// Served with the service-subdomain certificate resolver.
    pub service_domain: bool,
}

fn dashed(name: &str) -> String {
    name.replace('.', "-")
}

/// Assemble the document from validated vhosts and the port map.
pub fn build_proxy_document(
    settings: &ProxySettings,
    entrypoints: &[String],
    vhosts: &[RoutedVhost],
    ports: &PortForwardMap,
) -> ProxyDocument {
    let mut document = ProxyDocument::default();

    for routed in vhosts {
        let name = format!("{}-{}", dashed(&routed.fqdn), dashed(&routed.vhost));
        let cert_resolver = if routed.service_domain {
            &settings.service_subdomain_cert_resolver
        } else {
            &settings.user_domain_cert_resolver
        };
        let scheme = if routed.options.https { "https" } else { "http" };

        let http = document.http.get_or_insert_with(HttpSection::default);
        http.routers.insert(
            name.clone(),
            HttpRouter {
                entry_points: entrypoints.to_vec(),
                rule: format!("Host(`{}`)", routed.vhost),
                service: name.clone(),
                tls: RouterTls {
                    cert_resolver: cert_resolver.clone(),
                },
            },
        );
        http.services.insert(
            name,
            Service::single(UrlServer {
                url: format!("{scheme}://{}:{}", routed.address, routed.options.port),
            }),
        );
    }

    for (external, target) in ports.iter() {
        let Some(address) = target.address else {
            warn!(fqdn = %target.fqdn, port = external, "forwarded port has no instance address");
            continue;
        };
        let upstream = format!("{address}:{}", target.internal);
        let prefix = dashed(&target.fqdn);
        let tcp_name = format!("{prefix}-{external}-tcp");
        let udp_name = format!("{prefix}-{external}-udp");

        let tcp = document.tcp.get_or_insert_with(TcpSection::default);
        tcp.routers.insert(
            tcp_name.clone(),
            TcpRouter {
                entry_points: vec![format!("{}-{external}-tcp", settings.entrypoint_prefix)],
                rule: "HostSNI(`*`)".to_string(),
                service: tcp_name.clone(),
            },
        );
        tcp.services.insert(
            tcp_name,
            Service::single(AddressServer {
                address: upstream.clone(),
            }),
        );

        let udp = document.udp.get_or_insert_with(UdpSection::default);
        udp.routers.insert(
            udp_name.clone(),
            UdpRouter {
                entry_points: vec![format!("{}-{external}-udp", settings.entrypoint_prefix)],
                service: udp_name.clone(),
            },
        );
        udp.services.insert(udp_name, Service::single(AddressServer { address: upstream }));
    }

    document
}

impl InstanceManager {
    /// Proxy document for the current cluster state. An empty `entrypoints`
    /// list falls back to the configured web entrypoints.
    pub async fn build_proxy_config(&self, entrypoints: &[String]) -> Result<ProxyDocument> {
        let entrypoints: Vec<String> = if entrypoints.is_empty() {
            self.config.proxy.web_entrypoints.clone()
        } else {
            entrypoints.to_vec()
        };

        let instances = self.scan_instances(true).await?;
        let rules = self.validator.rules();

        let mut routed = Vec::new();
        for instance in instances.values() {
            let Some(address) = instance.primary_address() else {
                continue;
            };
            for (vhost, options) in &instance.metadata.network.vhosts {
                let validation = self
                    .validator
                    .validate(instance.owner(), &instance.fqdn, vhost)
                    .await;
                if !validation.valid {
                    debug!(fqdn = %instance.fqdn, vhost = %vhost, "vhost does not validate, not routed");
                    continue;
                }
                routed.push(RoutedVhost {
                    fqdn: instance.fqdn.clone(),
                    address,
                    vhost: vhost.clone(),
                    options: *options,
                    service_domain: rules.is_service_domain(vhost),
                });
            }
        }

        let ports = PortForwardMap::build(&self.port_range, port_claims(instances.values()));
        Ok(build_proxy_document(
            &self.config.proxy,
            &entrypoints,
            &routed,
            &ports,
        ))
    }
}
