//! Maps a [`ProxySessionConfig`] onto the engine document.
//!
//! `build` is a pure function: no I/O, no clocks, no randomness. The
//! node link is parsed here, so a bad link or an unknown transport or
//! security type fails the whole build and nothing partial comes back.

use crate::config::{
    DnsConfig, InboundConfig, LogConfig, MuxConfig, OutboundTag, ProxySessionConfig, RoutingRule,
    Udp443Policy, OUTBOUND_DIRECT_TAG, OUTBOUND_PROXY_TAG, OUTBOUND_REJECT_TAG,
};
use crate::document::*;
use crate::error::{BuildError, LinkError};
use crate::link::{self, NodeProtocol, OutboundNode};

pub const FRAGMENT_TAG: &str = "fragment";
pub const DNS_IN_TAG: &str = "dns-in";
pub const DNS_OUT_TAG: &str = "dns-out";
pub const DNS_IN_PORT: u16 = 10853;
const DNS_IN_UPSTREAM: &str = "1.1.1.1";
const FAKE_DNS_ADDRESS: &str = "fakedns";
const FAKE_DNS_POOL: &str = "198.18.0.0/16";
const FAKE_DNS_POOL_SIZE: u32 = 65535;
const PRIVATE_IP_MATCHER: &str = "geoip:private";
const LOG_OFF: &str = "none";

/// Builds the engine document for `config`.
pub fn build(config: &ProxySessionConfig) -> Result<ConfigDocument, BuildError> {
    for rule in &config.routing.rules {
        rule.validate().map_err(|reason| BuildError::InvalidRule {
            tag: rule.tag.clone(),
            reason,
        })?;
    }

    let node = link::parse(&config.outbound.link).map_err(|err| match err {
        LinkError::UnsupportedProtocol(scheme) => BuildError::UnsupportedOutboundProtocol(scheme),
        other => BuildError::Link(other),
    })?;
    let proxy = proxy_outbound(&node, &config.outbound.mux)?;
    let fake_dns = config.dns.enable_fake_dns;

    Ok(ConfigDocument {
        log: log_section(&config.log),
        dns: dns_section(&config.dns, &config.routing.rules),
        fakedns: fake_dns.then(|| FakeDnsSection {
            ip_pool: FAKE_DNS_POOL.to_string(),
            pool_size: FAKE_DNS_POOL_SIZE,
        }),
        inbounds: inbounds(&config.inbound, fake_dns),
        outbounds: outbounds(proxy, fake_dns),
        routing: routing_section(config),
        stats: config.stats.enable.then_some(StatsSection {}),
    })
}

/// Builds and pretty-prints the document.
pub fn build_json(config: &ProxySessionConfig) -> Result<String, BuildError> {
    Ok(build(config)?.to_json()?)
}

fn log_section(log: &LogConfig) -> LogSection {
    let channel = |enabled: bool, path: &Option<std::path::PathBuf>| match (enabled, path) {
        (true, Some(path)) => path.display().to_string(),
        _ => LOG_OFF.to_string(),
    };
    LogSection {
        access: channel(log.enable_access, &log.access_path),
        error: channel(log.enable_error, &log.error_path),
        level: log.level.as_str().to_string(),
        dns_log: log.enable_dns,
        mask_address: log.enable_mask_address.then(|| "quarter".to_string()),
    }
}

fn dns_section(dns: &DnsConfig, rules: &[RoutingRule]) -> DnsSection {
    let hosts = HostTable(
        dns.hosts
            .iter()
            .filter(|host| !host.addresses.is_empty())
            .map(|host| {
                let address = match host.addresses.as_slice() {
                    [single] => HostAddress::Single(single.clone()),
                    many => HostAddress::Many(many.to_vec()),
                };
                (host.domain.clone(), address)
            })
            .collect(),
    );

    let domains_for = |tag: Option<OutboundTag>| -> Vec<String> {
        rules
            .iter()
            .filter(|rule| tag.map_or(true, |tag| rule.outbound == tag))
            .flat_map(|rule| rule.domains().iter().cloned())
            .collect()
    };
    let ips_for = |tag: OutboundTag| -> Vec<String> {
        rules
            .iter()
            .filter(|rule| rule.outbound == tag)
            .flat_map(|rule| rule.ips().iter().cloned())
            .collect()
    };

    let mut servers = Vec::new();
    if dns.enable_fake_dns {
        servers.push(DnsServer::Scoped(ScopedDnsServer {
            address: FAKE_DNS_ADDRESS.to_string(),
            domains: domains_for(None),
            expect_ips: Vec::new(),
            skip_fallback: None,
        }));
    }
    servers.push(DnsServer::Plain(dns.proxy_ip.clone()));
    servers.push(DnsServer::Scoped(ScopedDnsServer {
        address: dns.proxy_ip.clone(),
        domains: domains_for(Some(OutboundTag::Proxy)),
        expect_ips: ips_for(OutboundTag::Proxy),
        skip_fallback: Some(false),
    }));
    // Private ranges never come back from a public resolver.
    let direct_ips = ips_for(OutboundTag::Direct)
        .into_iter()
        .filter(|ip| ip != PRIVATE_IP_MATCHER)
        .collect();
    servers.push(DnsServer::Scoped(ScopedDnsServer {
        address: dns.direct_ip.clone(),
        domains: domains_for(Some(OutboundTag::Direct)),
        expect_ips: direct_ips,
        skip_fallback: Some(true),
    }));

    DnsSection { hosts, servers }
}

fn inbounds(inbound: &InboundConfig, fake_dns: bool) -> Vec<Inbound> {
    let listen = inbound.listen_address().to_string();
    let dest_override = if fake_dns {
        vec!["fakedns+others".to_string()]
    } else {
        ["http", "tls", "quic"].map(String::from).to_vec()
    };
    let sniffing = Sniffing {
        enabled: true,
        dest_override,
        metadata_only: false,
        route_only: true,
    };

    vec![
        Inbound {
            tag: "http".to_string(),
            listen: listen.clone(),
            port: inbound.port_http,
            protocol: "http".to_string(),
            settings: None,
            sniffing: Some(sniffing.clone()),
        },
        Inbound {
            tag: "socks".to_string(),
            listen,
            port: inbound.port_socks,
            protocol: "socks".to_string(),
            settings: Some(InboundSettings::Socks {
                auth: "noauth".to_string(),
                udp: true,
            }),
            sniffing: Some(sniffing),
        },
        Inbound {
            tag: DNS_IN_TAG.to_string(),
            listen: "127.0.0.1".to_string(),
            port: DNS_IN_PORT,
            protocol: "dokodemo-door".to_string(),
            settings: Some(InboundSettings::Redirect {
                address: DNS_IN_UPSTREAM.to_string(),
                network: "tcp,udp".to_string(),
                port: 53,
            }),
            sniffing: None,
        },
    ]
}

fn proxy_outbound(node: &OutboundNode, mux: &MuxConfig) -> Result<Outbound, BuildError> {
    let settings = match node.protocol {
        NodeProtocol::Vless => OutboundSettings::Vless {
            vnext: vec![VlessServer {
                address: node.address.clone(),
                port: node.port,
                users: vec![VlessUser {
                    id: node.id.clone(),
                    encryption: node.encryption.clone().unwrap_or_else(|| "none".to_string()),
                    flow: node.flow.clone(),
                    level: 0,
                }],
            }],
        },
        NodeProtocol::Trojan => OutboundSettings::Trojan {
            servers: vec![TrojanServer {
                address: node.address.clone(),
                port: node.port,
                password: node.id.clone(),
            }],
        },
    };

    Ok(Outbound {
        tag: OUTBOUND_PROXY_TAG.to_string(),
        protocol: node.protocol.as_str().to_string(),
        settings: Some(settings),
        stream_settings: Some(stream_settings(node)?),
        mux: mux.enabled.then(|| MuxSection {
            enabled: true,
            concurrency: mux.concurrency,
            xudp_concurrency: mux.xudp_concurrency,
            xudp_proxy_udp443: match mux.xudp_proxy_udp443 {
                Udp443Policy::Allow => "allow".to_string(),
                Udp443Policy::Reject => "reject".to_string(),
            },
        }),
    })
}

fn stream_settings(node: &OutboundNode) -> Result<StreamSettings, BuildError> {
    let header = || Header {
        kind: node
            .header_type
            .clone()
            .unwrap_or_else(|| "none".to_string()),
    };

    let transport = node.transport.as_deref().unwrap_or("tcp");
    let mut stream = StreamSettings {
        sockopt: Some(Sockopt {
            dialer_proxy: Some(FRAGMENT_TAG.to_string()),
            ..Sockopt::default()
        }),
        ..StreamSettings::default()
    };
    match transport {
        "tcp" | "raw" => {
            stream.network = "tcp".to_string();
            stream.tcp_settings = Some(HeaderSettings { header: header() });
        }
        "kcp" => {
            stream.network = "kcp".to_string();
            stream.kcp_settings = Some(KcpSettings {
                header: header(),
                seed: node.seed.clone(),
            });
        }
        "ws" => {
            stream.network = "ws".to_string();
            stream.ws_settings = Some(WsSettings {
                path: node.path.clone(),
                host: node.host.clone(),
            });
        }
        "grpc" => {
            stream.network = "grpc".to_string();
            stream.grpc_settings = Some(GrpcSettings {
                service_name: node.service_name.clone(),
                authority: node.authority.clone(),
                multi_mode: node.mode.as_deref() == Some("multi"),
                idle_timeout: 60,
                health_check_timeout: 20,
            });
        }
        other => return Err(BuildError::UnsupportedTransportType(other.to_string())),
    }

    let security = node.security.as_deref().unwrap_or("none");
    match security {
        "none" => {}
        "tls" => {
            stream.tls_settings = Some(TlsSettings {
                server_name: node.sni.clone().unwrap_or_else(|| node.address.clone()),
                allow_insecure: node.allow_insecure,
                alpn: node.alpn.clone(),
                fingerprint: node.fingerprint.clone(),
            });
        }
        "reality" => {
            stream.reality_settings = Some(RealitySettings {
                show: false,
                server_name: node.sni.clone(),
                fingerprint: node.fingerprint.clone(),
                public_key: node.public_key.clone(),
                short_id: node.short_id.clone(),
                spider_x: node.spider_x.clone(),
            });
        }
        other => return Err(BuildError::UnsupportedSecurityType(other.to_string())),
    }
    stream.security = Some(security.to_string());

    Ok(stream)
}

fn outbounds(proxy: Outbound, fake_dns: bool) -> Vec<Outbound> {
    let mut outbounds = vec![
        proxy,
        Outbound {
            tag: OUTBOUND_DIRECT_TAG.to_string(),
            protocol: "freedom".to_string(),
            settings: Some(OutboundSettings::Freedom(FreedomSettings {
                domain_strategy: Some("UseIP".to_string()),
                ..FreedomSettings::default()
            })),
            stream_settings: None,
            mux: None,
        },
        Outbound {
            tag: OUTBOUND_REJECT_TAG.to_string(),
            protocol: "blackhole".to_string(),
            settings: Some(OutboundSettings::Blackhole {
                response: BlackholeResponse {
                    kind: "http".to_string(),
                },
            }),
            stream_settings: None,
            mux: None,
        },
        fragment_outbound(),
    ];
    if fake_dns {
        outbounds.push(Outbound {
            tag: DNS_OUT_TAG.to_string(),
            protocol: "dns".to_string(),
            settings: None,
            stream_settings: None,
            mux: None,
        });
    }
    outbounds
}

/// Splits the TLS ClientHello and adds noise ahead of it; the proxy
/// outbound dials through this one.
fn fragment_outbound() -> Outbound {
    Outbound {
        tag: FRAGMENT_TAG.to_string(),
        protocol: "freedom".to_string(),
        settings: Some(OutboundSettings::Freedom(FreedomSettings {
            domain_strategy: None,
            fragment: Some(Fragment {
                packets: "tlshello".to_string(),
                length: "50-100".to_string(),
                interval: "10-20".to_string(),
            }),
            noises: vec![Noise {
                kind: "rand".to_string(),
                packet: "10-20".to_string(),
                delay: "10-16".to_string(),
            }],
        })),
        stream_settings: Some(StreamSettings {
            network: "tcp".to_string(),
            sockopt: Some(Sockopt {
                dialer_proxy: None,
                tcp_no_delay: Some(true),
                mark: Some(255),
            }),
            ..StreamSettings::default()
        }),
        mux: None,
    }
}

fn routing_section(config: &ProxySessionConfig) -> RoutingSection {
    let bootstrap = |ip: &str, outbound: &str| {
        let mut rule = RouteRule::field(outbound);
        rule.ip = vec![ip.to_string()];
        rule.port = Some("53".to_string());
        rule
    };

    let mut rules = vec![
        bootstrap(&config.dns.proxy_ip, OUTBOUND_PROXY_TAG),
        bootstrap(&config.dns.direct_ip, OUTBOUND_DIRECT_TAG),
    ];
    rules.extend(config.routing.rules.iter().map(user_rule));
    if config.dns.enable_fake_dns {
        let mut rule = RouteRule::field(DNS_OUT_TAG);
        rule.inbound_tag = vec![DNS_IN_TAG.to_string()];
        rule.port = Some("53".to_string());
        rules.push(rule);
    }

    RoutingSection {
        domain_strategy: config.routing.domain_strategy.as_str().to_string(),
        rules,
    }
}

fn user_rule(rule: &RoutingRule) -> RouteRule {
    let mut out = RouteRule::field(rule.outbound.as_str());
    out.rule_tag = Some(rule.tag.clone());
    out.domain_matcher = Some("hybrid".to_string());
    out.domain = rule.domains().to_vec();
    out.ip = rule.ips().to_vec();
    out.port = rule.port.map(|port| port.to_string());
    out.network = rule
        .network
        .as_ref()
        .filter(|network| !network.is_empty())
        .map(|network| {
            network
                .iter()
                .map(|n| n.as_str())
                .collect::<Vec<_>>()
                .join(",")
        });
    out.protocol = rule
        .protocol
        .iter()
        .flatten()
        .map(|protocol| protocol.as_str().to_string())
        .collect();
    out
}
