//! Typed shape of the engine's JSON configuration document.
//!
//! Every section is a plain serde struct. Optional parts are `Option` or
//! empty collections skipped at serialization time, which keeps the
//! document sparse without building ad hoc JSON values. Key order follows
//! field declaration order, so output is stable for equal input.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigDocument {
    pub log: LogSection,
    pub dns: DnsSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fakedns: Option<FakeDnsSection>,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub routing: RoutingSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsSection>,
}

impl ConfigDocument {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn outbound_tags(&self) -> Vec<&str> {
        self.outbounds.iter().map(|o| o.tag.as_str()).collect()
    }

    pub fn inbound_tags(&self) -> Vec<&str> {
        self.inbounds.iter().map(|i| i.tag.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSection {
    /// Access log path, or `"none"` when the channel is off.
    pub access: String,
    /// Error log path, or `"none"` when the channel is off.
    pub error: String,
    #[serde(rename = "loglevel")]
    pub level: String,
    pub dns_log: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsSection {
    #[serde(skip_serializing_if = "HostTable::is_empty")]
    pub hosts: HostTable,
    pub servers: Vec<DnsServer>,
}

/// Static host overrides in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostTable(pub Vec<(String, HostAddress)>);

impl HostTable {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, domain: &str) -> Option<&HostAddress> {
        self.0.iter().find(|(d, _)| d == domain).map(|(_, a)| a)
    }
}

impl Serialize for HostTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (domain, address) in &self.0 {
            map.serialize_entry(domain, address)?;
        }
        map.end()
    }
}

/// One address is written as a string, several as an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HostAddress {
    Single(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DnsServer {
    Plain(String),
    Scoped(ScopedDnsServer),
}

impl DnsServer {
    pub fn address(&self) -> &str {
        match self {
            Self::Plain(address) => address,
            Self::Scoped(server) => &server.address,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopedDnsServer {
    pub address: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    #[serde(rename = "expectIPs", skip_serializing_if = "Vec::is_empty")]
    pub expect_ips: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_fallback: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FakeDnsSection {
    pub ip_pool: String,
    pub pool_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inbound {
    pub tag: String,
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<InboundSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Sniffing>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum InboundSettings {
    Socks { auth: String, udp: bool },
    Redirect {
        address: String,
        network: String,
        port: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sniffing {
    pub enabled: bool,
    pub dest_override: Vec<String>,
    pub metadata_only: bool,
    pub route_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub tag: String,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<OutboundSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mux: Option<MuxSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OutboundSettings {
    Vless { vnext: Vec<VlessServer> },
    Trojan { servers: Vec<TrojanServer> },
    Freedom(FreedomSettings),
    Blackhole { response: BlackholeResponse },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VlessServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<VlessUser>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VlessUser {
    pub id: String,
    pub encryption: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    pub level: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrojanServer {
    pub address: String,
    pub port: u16,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreedomSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment: Option<Fragment>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub noises: Vec<Noise>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fragment {
    pub packets: String,
    pub length: String,
    pub interval: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Noise {
    #[serde(rename = "type")]
    pub kind: String,
    pub packet: String,
    pub delay: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlackholeResponse {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_settings: Option<HeaderSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kcp_settings: Option<KcpSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealitySettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sockopt: Option<Sockopt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderSettings {
    pub header: Header,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KcpSettings {
    pub header: Header,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WsSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrpcSettings {
    #[serde(rename = "serviceName", skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    #[serde(rename = "multiMode")]
    pub multi_mode: bool,
    pub idle_timeout: u32,
    pub health_check_timeout: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub server_name: String,
    pub allow_insecure: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    pub show: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    #[serde(rename = "spiderX", skip_serializing_if = "Option::is_none")]
    pub spider_x: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sockopt {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialer_proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_no_delay: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mark: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MuxSection {
    pub enabled: bool,
    pub concurrency: i32,
    pub xudp_concurrency: i32,
    #[serde(rename = "xudpProxyUDP443")]
    pub xudp_proxy_udp443: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingSection {
    pub domain_strategy: String,
    pub rules: Vec<RouteRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_matcher: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inbound_tag: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domain: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ip: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub protocol: Vec<String>,
    pub outbound_tag: String,
}

impl RouteRule {
    /// An empty `field` rule pointing at `outbound_tag`.
    pub fn field(outbound_tag: impl Into<String>) -> Self {
        Self {
            kind: "field".to_string(),
            rule_tag: None,
            domain_matcher: None,
            inbound_tag: Vec::new(),
            domain: Vec::new(),
            ip: Vec::new(),
            port: None,
            network: None,
            protocol: Vec::new(),
            outbound_tag: outbound_tag.into(),
        }
    }
}

/// Written as `{}`; its presence alone turns the engine's counters on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSection {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_table_keeps_insertion_order() {
        let table = HostTable(vec![
            ("z.example".into(), HostAddress::Single("1.1.1.1".into())),
            (
                "a.example".into(),
                HostAddress::Many(vec!["2.2.2.2".into(), "3.3.3.3".into()]),
            ),
        ]);
        let json = serde_json::to_string(&table).unwrap();
        assert_eq!(
            json,
            r#"{"z.example":"1.1.1.1","a.example":["2.2.2.2","3.3.3.3"]}"#
        );
    }

    #[test]
    fn test_empty_stats_is_an_object() {
        assert_eq!(serde_json::to_string(&StatsSection {}).unwrap(), "{}");
    }

    #[test]
    fn test_route_rule_omits_empty_matchers() {
        let mut rule = RouteRule::field("direct");
        rule.port = Some("53".into());
        let json = serde_json::to_string(&rule).unwrap();
        assert_eq!(json, r#"{"type":"field","port":"53","outboundTag":"direct"}"#);
    }
}
