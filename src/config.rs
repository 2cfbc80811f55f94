//! The declarative session configuration consumed by the document builder.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const OUTBOUND_PROXY_TAG: &str = "proxy";
pub const OUTBOUND_DIRECT_TAG: &str = "direct";
pub const OUTBOUND_REJECT_TAG: &str = "reject";

/// Everything needed to produce one engine document. Assembled once per
/// session start and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySessionConfig {
    pub log: LogConfig,
    pub dns: DnsConfig,
    pub inbound: InboundConfig,
    pub outbound: OutboundConfig,
    pub routing: RoutingConfig,
    pub stats: StatsConfig,
}

impl ProxySessionConfig {
    /// Checks the invariants the builder relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.outbound.link.trim().is_empty() {
            return Err("outbound link is empty".to_string());
        }
        if self.inbound.port_http == 0 || self.inbound.port_socks == 0 {
            return Err("inbound ports must be non-zero".to_string());
        }
        if self.inbound.port_http == self.inbound.port_socks {
            return Err(format!(
                "http and socks inbounds share port {}",
                self.inbound.port_http
            ));
        }
        if self.dns.direct_ip.trim().is_empty() || self.dns.proxy_ip.trim().is_empty() {
            return Err("dns server addresses must be set".to_string());
        }
        for rule in &self.routing.rules {
            rule.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    #[default]
    None,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    pub enable_access: bool,
    pub access_path: Option<PathBuf>,
    pub enable_error: bool,
    pub error_path: Option<PathBuf>,
    pub level: LogLevel,
    pub enable_dns: bool,
    pub enable_mask_address: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enable_access: false,
            access_path: None,
            enable_error: false,
            error_path: None,
            level: LogLevel::None,
            enable_dns: false,
            enable_mask_address: true,
        }
    }
}

/// One static host override: a domain resolved to one or more addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostOverride {
    pub domain: String,
    #[serde(deserialize_with = "addresses_from_list_or_csv")]
    pub addresses: Vec<String>,
}

/// Accepts `["a", "b"]` or the settings form's `"a, b"`.
fn addresses_from_list_or_csv<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Csv(String),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::List(list) => list
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect(),
        Raw::Csv(csv) => HostOverride::parse("", &csv).addresses,
    })
}

impl HostOverride {
    /// Builds an override from a comma separated address list, dropping
    /// whitespace the way the settings form does.
    pub fn parse(domain: impl Into<String>, addresses: &str) -> Self {
        let addresses = addresses
            .split(',')
            .map(|part| part.chars().filter(|c| !c.is_whitespace()).collect::<String>())
            .filter(|part| !part.is_empty())
            .collect();
        Self {
            domain: domain.into(),
            addresses,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsConfig {
    pub hosts: Vec<HostOverride>,
    pub direct_ip: String,
    pub proxy_ip: String,
    pub enable_fake_dns: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            hosts: preset_hosts(),
            direct_ip: "223.5.5.5".to_string(),
            proxy_ip: "1.1.1.1".to_string(),
            enable_fake_dns: true,
        }
    }
}

fn preset_hosts() -> Vec<HostOverride> {
    [
        ("geosite:category-ads-all", "127.0.0.1"),
        ("domain:googleapis.cn", "googleapis.com"),
        ("dns.alidns.com", "223.5.5.5,223.6.6.6,2400:3200::1,2400:3200:baba::1"),
        (
            "one.one.one.one",
            "1.1.1.1, 1.0.0.1, 2606:4700:4700::1111, 2606:4700:4700::1001",
        ),
        ("dot.pub", "1.12.12.12, 120.53.53.53"),
        (
            "dns.google",
            "8.8.8.8, 8.8.4.4, 2001:4860:4860::8888, 2001:4860:4860::8844",
        ),
        (
            "dns.quad9.net",
            "9.9.9.9, 149.112.112.112, 2620:fe::fe, 2620:fe::9",
        ),
        (
            "common.dot.dns.yandex.net",
            "77.88.8.8, 77.88.8.1, 2a02:6b8::feed:0ff, 2a02:6b8:0:1::feed:0ff",
        ),
    ]
    .into_iter()
    .map(|(domain, addresses)| HostOverride::parse(domain, addresses))
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundConfig {
    pub port_http: u16,
    pub port_socks: u16,
    pub allow_lan: bool,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            port_http: 10808,
            port_socks: 10809,
            allow_lan: true,
        }
    }
}

impl InboundConfig {
    pub fn listen_address(&self) -> &'static str {
        if self.allow_lan {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Udp443Policy {
    #[default]
    Allow,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MuxConfig {
    pub enabled: bool,
    pub concurrency: i32,
    pub xudp_concurrency: i32,
    pub xudp_proxy_udp443: Udp443Policy,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 8,
            xudp_concurrency: 16,
            xudp_proxy_udp443: Udp443Policy::Allow,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundConfig {
    /// The node link; the only source of truth for the proxy outbound.
    pub link: String,
    #[serde(default)]
    pub mux: MuxConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DomainStrategy {
    AsIs,
    #[default]
    IPIfNonMatch,
    IPOnDemand,
}

impl DomainStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AsIs => "AsIs",
            Self::IPIfNonMatch => "IPIfNonMatch",
            Self::IPOnDemand => "IPOnDemand",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingConfig {
    pub domain_strategy: DomainStrategy,
    pub rules: Vec<RoutingRule>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            domain_strategy: DomainStrategy::IPIfNonMatch,
            rules: preset_rules(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsConfig {
    pub enable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundTag {
    Proxy,
    Direct,
    Reject,
}

impl OutboundTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proxy => OUTBOUND_PROXY_TAG,
            Self::Direct => OUTBOUND_DIRECT_TAG,
            Self::Reject => OUTBOUND_REJECT_TAG,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SniffProtocol {
    Http,
    Tls,
    Bittorrent,
}

impl SniffProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tls => "tls",
            Self::Bittorrent => "bittorrent",
        }
    }
}

/// An inclusive port range; a single port has `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn new(start: u16, end: u16) -> Result<Self, String> {
        if start > end {
            return Err(format!("port range {start}-{end} is reversed"));
        }
        Ok(Self { start, end })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |value: &str| {
            value
                .trim()
                .parse::<u16>()
                .map_err(|_| format!("invalid port {value:?}"))
        };
        match s.split_once('-') {
            Some((start, end)) => Self::new(parse(start)?, parse(end)?),
            None => Ok(Self::single(parse(s)?)),
        }
    }
}

impl Serialize for PortRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A user routing rule. Matchers are ANDed by the engine; at least one
/// must be present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    pub tag: String,
    pub outbound: OutboundTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Vec<Network>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Vec<SniffProtocol>>,
}

impl RoutingRule {
    pub fn new(tag: impl Into<String>, outbound: OutboundTag) -> Self {
        Self {
            tag: tag.into(),
            outbound,
            domain: None,
            ip: None,
            port: None,
            network: None,
            protocol: None,
        }
    }

    pub fn with_domain<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domain = Some(domains.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_ip<I, S>(mut self, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ip = Some(ips.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_port(mut self, port: PortRange) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_network(mut self, network: &[Network]) -> Self {
        self.network = Some(network.to_vec());
        self
    }

    pub fn with_protocol(mut self, protocol: &[SniffProtocol]) -> Self {
        self.protocol = Some(protocol.to_vec());
        self
    }

    /// Domain matchers, empty when the rule has none.
    pub fn domains(&self) -> &[String] {
        self.domain.as_deref().unwrap_or_default()
    }

    /// IP/CIDR matchers, empty when the rule has none.
    pub fn ips(&self) -> &[String] {
        self.ip.as_deref().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.tag.trim().is_empty() {
            return Err("routing rule has an empty tag".to_string());
        }
        let has_matcher = !self.domains().is_empty()
            || !self.ips().is_empty()
            || self.port.is_some()
            || self.network.as_ref().is_some_and(|n| !n.is_empty())
            || self.protocol.as_ref().is_some_and(|p| !p.is_empty());
        if !has_matcher {
            return Err(format!("routing rule {:?} has no matcher", self.tag));
        }
        Ok(())
    }
}

const SNIFF_ALL: [SniffProtocol; 3] = [
    SniffProtocol::Http,
    SniffProtocol::Tls,
    SniffProtocol::Bittorrent,
];
const TCP_UDP: [Network; 2] = [Network::Tcp, Network::Udp];

/// The rule set a fresh install starts with.
pub fn preset_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule::new("UDP443 Reject", OutboundTag::Reject)
            .with_port(PortRange::single(443))
            .with_network(&[Network::Udp])
            .with_protocol(&SNIFF_ALL),
        RoutingRule::new("AD Reject", OutboundTag::Reject)
            .with_domain(["geosite:category-ads-all"])
            .with_network(&TCP_UDP)
            .with_protocol(&SNIFF_ALL),
        RoutingRule::new("LAN IP Direct", OutboundTag::Direct)
            .with_ip(["geoip:private"])
            .with_network(&TCP_UDP)
            .with_protocol(&SNIFF_ALL),
        RoutingRule::new("China Domain Direct", OutboundTag::Direct)
            .with_domain([
                "domain:dns.alidns.com",
                "domain:doh.pub",
                "domain:dot.pub",
                "domain:doh.360.cn",
                "domain:dot.360.cn",
                "geosite:cn",
                "geosite:geolocation-cn",
            ])
            .with_network(&TCP_UDP)
            .with_protocol(&SNIFF_ALL),
        RoutingRule::new("China IP Direct", OutboundTag::Direct)
            .with_ip([
                "223.5.5.5/32",
                "223.6.6.6/32",
                "2400:3200::1/128",
                "2400:3200:baba::1/128",
                "119.29.29.29/32",
                "1.12.12.12/32",
                "120.53.53.53/32",
                "2402:4e00::/128",
                "2402:4e00:1::/128",
                "180.76.76.76/32",
                "2400:da00::6666/128",
                "114.114.114.114/32",
                "114.114.115.115/32",
                "180.184.1.1/32",
                "180.184.2.2/32",
                "101.226.4.6/32",
                "218.30.118.6/32",
                "123.125.81.6/32",
                "140.207.198.6/32",
                "geoip:cn",
            ])
            .with_network(&TCP_UDP)
            .with_protocol(&SNIFF_ALL),
        RoutingRule::new("Last Proxy", OutboundTag::Proxy)
            .with_port(PortRange {
                start: 0,
                end: 65535,
            })
            .with_network(&TCP_UDP)
            .with_protocol(&SNIFF_ALL),
    ]
}
