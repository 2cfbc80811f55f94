//! Node link parsing.
//!
//! A node link has the shape
//! `<protocol>://<identity>@<host>:<port>?<query>#<name>`. Parsing is a
//! small tokenizer that splits on `://`, `#`, `?`, the last `@` and the
//! port colon, and reports which segment was malformed.

use std::collections::BTreeMap;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Serialize;
use crate::error::LinkError;

/// Characters escaped in the identity and name segments of a link.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b':')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b']')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Query values additionally escape the pair separators. `+` is escaped
/// too, since links carry it literally.
const QUERY_VALUE: &AsciiSet = &SEGMENT.add(b'&').add(b'=').add(b'+');

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeProtocol {
    Vless,
    Trojan,
}

impl NodeProtocol {
    pub fn from_scheme(scheme: &str) -> Result<Self, LinkError> {
        match scheme.to_ascii_lowercase().as_str() {
            "vless" => Ok(Self::Vless),
            "trojan" => Ok(Self::Trojan),
            _ => Err(LinkError::UnsupportedProtocol(scheme.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vless => "vless",
            Self::Trojan => "trojan",
        }
    }
}

/// A structured outbound node derived from a link. Never persisted; the
/// link string stays the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundNode {
    pub protocol: NodeProtocol,
    pub name: String,
    pub address: String,
    pub port: u16,
    /// The user id for vless, the password for trojan.
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    /// Raw `type` parameter; validated when the document is built.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    /// Raw `security` parameter; validated when the document is built.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spider_x: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    pub allow_insecure: bool,
}

impl OutboundNode {
    /// Renders the node back into a link. Parameter order is fixed, so a
    /// parsed link may come back with its query reordered.
    pub fn to_link(&self) -> String {
        let mut pairs: Vec<String> = Vec::new();
        let mut append = |key: &str, value: &str| {
            pairs.push(format!("{key}={}", utf8_percent_encode(value, QUERY_VALUE)));
        };
        let optional = [
            ("encryption", &self.encryption),
            ("flow", &self.flow),
            ("type", &self.transport),
            ("headerType", &self.header_type),
            ("host", &self.host),
            ("path", &self.path),
            ("serviceName", &self.service_name),
            ("authority", &self.authority),
            ("mode", &self.mode),
            ("seed", &self.seed),
            ("security", &self.security),
            ("sni", &self.sni),
            ("fp", &self.fingerprint),
            ("pbk", &self.public_key),
            ("sid", &self.short_id),
            ("spx", &self.spider_x),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                append(key, value);
            }
        }
        if !self.alpn.is_empty() {
            append("alpn", &self.alpn.join(","));
        }
        if self.allow_insecure {
            append("allowInsecure", "1");
        }
        let query = pairs.join("&");

        let host = if self.address.contains(':') {
            format!("[{}]", self.address)
        } else {
            self.address.clone()
        };
        let mut link = format!(
            "{}://{}@{}:{}",
            self.protocol.as_str(),
            utf8_percent_encode(&self.id, SEGMENT),
            host,
            self.port
        );
        if !query.is_empty() {
            link.push('?');
            link.push_str(&query);
        }
        link.push('#');
        link.push_str(&utf8_percent_encode(&self.name, SEGMENT).to_string());
        link
    }
}

/// Returns the scheme of a link without validating the rest.
pub fn link_protocol(link: &str) -> Option<&str> {
    link.trim().split_once("://").map(|(scheme, _)| scheme)
}

/// Parses a node link into an [`OutboundNode`].
pub fn parse(link: &str) -> Result<OutboundNode, LinkError> {
    let link = link.trim();
    let (scheme, rest) = link
        .split_once("://")
        .ok_or_else(|| LinkError::malformed("scheme", "missing '://'"))?;
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(LinkError::malformed("scheme", format!("invalid scheme {scheme:?}")));
    }
    let protocol = NodeProtocol::from_scheme(scheme)?;

    let (body, fragment) = rest.split_once('#').unwrap_or((rest, ""));
    let (authority, query) = body.split_once('?').unwrap_or((body, ""));

    let at = authority
        .rfind('@')
        .ok_or_else(|| LinkError::malformed("identity", "missing '@'"))?;
    let (identity, host_port) = (&authority[..at], &authority[at + 1..]);
    let id = decode_component(identity);
    if id.is_empty() {
        return Err(LinkError::malformed("identity", "identity is empty"));
    }

    let (address, port) = split_host_port(host_port)?;
    let params = query_params(query);
    let name = decode_component(fragment);
    let name = if name.is_empty() {
        format!("{}-{address}:{port}", protocol.as_str())
    } else {
        name
    };

    let get = |key: &str| params.get(key).filter(|v| !v.is_empty()).cloned();
    let alpn = get("alpn")
        .map(|value| {
            value
                .split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let allow_insecure = get("allowinsecure")
        .or_else(|| get("insecure"))
        .is_some_and(|value| value == "1" || value.eq_ignore_ascii_case("true"));

    Ok(OutboundNode {
        protocol,
        name,
        address,
        port,
        id,
        encryption: get("encryption"),
        flow: get("flow"),
        transport: get("type"),
        header_type: get("headertype"),
        host: get("host"),
        path: get("path"),
        service_name: get("servicename"),
        authority: get("authority"),
        mode: get("mode"),
        seed: get("seed"),
        security: get("security"),
        sni: get("sni"),
        fingerprint: get("fp"),
        public_key: get("pbk"),
        short_id: get("sid"),
        spider_x: get("spx"),
        alpn,
        allow_insecure,
    })
}

fn decode_component(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

/// Decodes the query into lowercase keys. Unknown keys are kept here and
/// ignored by the caller. Only percent escapes are decoded, so a `+` in a
/// path or spider path stays a `+`.
fn query_params(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key).to_ascii_lowercase(), decode_component(value))
        })
        .collect()
}

fn split_host_port(value: &str) -> Result<(String, u16), LinkError> {
    let host_port = value.split_once('/').map(|(head, _)| head).unwrap_or(value);

    let (host, port) = if let Some(stripped) = host_port.strip_prefix('[') {
        let end = stripped
            .find(']')
            .ok_or_else(|| LinkError::malformed("host", "unterminated ipv6 address"))?;
        let port = stripped[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| LinkError::malformed("port", "missing ':'"))?;
        (&stripped[..end], port)
    } else {
        host_port
            .rsplit_once(':')
            .ok_or_else(|| LinkError::malformed("port", "missing ':'"))?
    };

    if host.is_empty() {
        return Err(LinkError::malformed("host", "host is empty"));
    }
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| LinkError::malformed("port", format!("{port:?} is not a valid port")))?;
    Ok((host.to_string(), port))
}

fn add_padding(value: &str) -> String {
    let remainder = value.len() % 4;
    if remainder == 0 {
        value.to_string()
    } else {
        format!("{value}{}", "=".repeat(4 - remainder))
    }
}

fn decode_base64_to_string(input: &str) -> Option<String> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let padded = add_padding(&cleaned);
    for candidate in [&cleaned, &padded] {
        for engine in [URL_SAFE_NO_PAD, URL_SAFE, STANDARD_NO_PAD, STANDARD] {
            if let Ok(bytes) = engine.decode(candidate.as_bytes()) {
                if let Ok(value) = String::from_utf8(bytes) {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// Decodes a subscription body into node links.
///
/// Bodies are usually base64 of a newline separated link list; a body
/// that is already plain links is accepted as is. Links keep their own
/// percent-encoding, which [`parse`] undoes per segment.
pub fn decode_subscription(body: &str) -> Vec<String> {
    let text = if body.contains("://") {
        body.to_string()
    } else {
        decode_base64_to_string(body).unwrap_or_default()
    };
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REALITY: &str = "vless://2b1c3f7e-1111-2222-3333-444455556666@example.com:443?encryption=none&flow=xtls-rprx-vision&type=tcp&headerType=none&security=reality&sni=www.apple.com&fp=chrome&pbk=AbCdEf123&sid=6ba85179e30d4fc2&spx=%2F#HK%20Node";

    #[test]
    fn test_parse_reality_link() {
        let node = parse(REALITY).unwrap();
        assert_eq!(node.protocol, NodeProtocol::Vless);
        assert_eq!(node.address, "example.com");
        assert_eq!(node.port, 443);
        assert_eq!(node.id, "2b1c3f7e-1111-2222-3333-444455556666");
        assert_eq!(node.name, "HK Node");
        assert_eq!(node.flow.as_deref(), Some("xtls-rprx-vision"));
        assert_eq!(node.transport.as_deref(), Some("tcp"));
        assert_eq!(node.security.as_deref(), Some("reality"));
        assert_eq!(node.public_key.as_deref(), Some("AbCdEf123"));
        assert_eq!(node.short_id.as_deref(), Some("6ba85179e30d4fc2"));
        assert_eq!(node.spider_x.as_deref(), Some("/"));
        assert!(!node.allow_insecure);
    }

    #[test]
    fn test_parse_grpc_tls_with_alpn() {
        let link = "vless://uuid@1.2.3.4:8443?type=grpc&serviceName=gun&security=tls&alpn=h2%2Chttp%2F1.1&fp=safari#grpc";
        let node = parse(link).unwrap();
        assert_eq!(node.service_name.as_deref(), Some("gun"));
        assert_eq!(node.alpn, vec!["h2", "http/1.1"]);
        assert_eq!(node.fingerprint.as_deref(), Some("safari"));
    }

    #[test]
    fn test_parse_trojan_and_ipv6() {
        let node = parse("trojan://p%40ss@[2001:db8::1]:443?security=tls#t").unwrap();
        assert_eq!(node.protocol, NodeProtocol::Trojan);
        assert_eq!(node.id, "p@ss");
        assert_eq!(node.address, "2001:db8::1");
        assert_eq!(node.port, 443);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let node = parse("vless://id@h:1?foo=bar&type=ws&path=%2Fws#n").unwrap();
        assert_eq!(node.transport.as_deref(), Some("ws"));
        assert_eq!(node.path.as_deref(), Some("/ws"));
    }

    #[test]
    fn test_missing_name_gets_generated() {
        let node = parse("vless://id@host:10086").unwrap();
        assert_eq!(node.name, "vless-host:10086");
    }

    #[test]
    fn test_unsupported_protocol() {
        let err = parse("vmess://abcdef").unwrap_err();
        assert_eq!(err, LinkError::UnsupportedProtocol("vmess".to_string()));
    }

    #[test]
    fn test_malformed_links() {
        let cases = [
            ("example.com:443", "scheme"),
            ("vless://example.com:443?type=tcp", "identity"),
            ("vless://@example.com:443", "identity"),
            ("vless://id@example.com?type=tcp", "port"),
            ("vless://id@example.com:https?type=tcp", "port"),
            ("vless://id@example.com:0", "port"),
            ("vless://id@example.com:70000", "port"),
            ("vless://id@:443", "host"),
            ("vless://id@[::1:443", "host"),
        ];
        for (link, expected) in cases {
            match parse(link) {
                Err(LinkError::MalformedLink { segment, .. }) => {
                    assert_eq!(segment, expected, "{link}")
                }
                other => panic!("{link}: expected malformed {expected}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_round_trip_keeps_fields() {
        let node = parse(REALITY).unwrap();
        let again = parse(&node.to_link()).unwrap();
        assert_eq!(node, again);

        let node = parse("vless://id@h:2?type=grpc&serviceName=a%20b&security=tls&alpn=h2,http/1.1&allowInsecure=1#x%23y").unwrap();
        let again = parse(&node.to_link()).unwrap();
        assert_eq!(node, again);
        assert_eq!(again.name, "x#y");
    }

    #[test]
    fn test_plus_in_query_is_literal() {
        let node = parse("vless://id@h:443?type=ws&path=/a+b&security=reality&pbk=k&spx=/a+b%2Bc%20d#n").unwrap();
        assert_eq!(node.path.as_deref(), Some("/a+b"));
        assert_eq!(node.spider_x.as_deref(), Some("/a+b+c d"));

        let again = parse(&node.to_link()).unwrap();
        assert_eq!(again, node);
    }

    #[test]
    fn test_link_protocol() {
        assert_eq!(link_protocol("vless://a@b:1"), Some("vless"));
        assert_eq!(link_protocol("nonsense"), None);
    }

    #[test]
    fn test_decode_subscription_base64() {
        let body = STANDARD.encode("vless://a@h:1#one\n\nvless://b@h:2#two%20x\n");
        let links = decode_subscription(&body);
        assert_eq!(links, vec!["vless://a@h:1#one", "vless://b@h:2#two%20x"]);
        assert_eq!(parse(&links[1]).unwrap().name, "two x");
    }

    #[test]
    fn test_decode_subscription_plain_and_garbage() {
        assert_eq!(decode_subscription("vless://a@h:1#one\r\n"), vec!["vless://a@h:1#one"]);
        assert!(decode_subscription("***not base64***").is_empty());
    }
}
