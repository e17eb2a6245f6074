//! Engine configuration compiler
//!
//! Compiles a [`ConnectionProfile`] into the JSON document the proxy engine
//! runs with. The document is built from typed structs so field order, and
//! therefore the rendered bytes, never change for the same profile.
//!
//! # Layout
//!
//! ```text
//! log        { loglevel }
//! inbounds   [ socks @ 127.0.0.1:10808, udp on ]
//! outbounds  [ vless -> {address, port, user id} + streamSettings ]
//! dns        { servers: [1.1.1.1, 8.8.8.8] }
//! ```

use crate::link::ConnectionProfile;
use serde::{Deserialize, Serialize};
use std::io;

/// Engine log level
pub const LOG_LEVEL: &str = "warning";

/// Loopback address of the local SOCKS listener
pub const SOCKS_LISTEN: &str = "127.0.0.1";

/// Port of the local SOCKS listener
pub const SOCKS_PORT: u16 = 10808;

/// Resolvers handed to the engine
pub const DNS_SERVERS: [&str; 2] = ["1.1.1.1", "8.8.8.8"];

/// Outbound protocol spoken to the remote server
pub const OUTBOUND_PROTOCOL: &str = "vless";

/// `host:port` of the engine's SOCKS listener, as the relay dials it
pub fn socks_endpoint() -> String {
    format!("{}:{}", SOCKS_LISTEN, SOCKS_PORT)
}

/// Compiled engine configuration document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub log: LogSettings,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub dns: DnsSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    pub loglevel: String,
}

/// Local listener the relay connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inbound {
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    pub settings: InboundSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundSettings {
    pub auth: String,
    pub udp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub protocol: String,
    pub settings: OutboundSettings,
    pub stream_settings: StreamSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundSettings {
    pub vnext: Vec<ServerEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub address: String,
    pub port: u16,
    pub users: Vec<ServerUser>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerUser {
    pub id: String,
    pub encryption: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_settings: Option<TcpSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub server_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpn: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpSettings {
    pub header: HttpHeader,
}

/// HTTP obfuscation header for raw TCP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    #[serde(rename = "type")]
    pub kind: String,
    pub request: HttpRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<RequestHeaders>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeaders {
    #[serde(rename = "Host")]
    pub host: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSettings {
    pub servers: Vec<String>,
}

impl EngineConfig {
    /// Render as pretty-printed JSON
    pub fn to_json(&self) -> io::Result<String> {
        serde_json::to_string_pretty(self).map_err(io::Error::from)
    }

    /// Parse a previously rendered document
    pub fn from_json(content: &str) -> io::Result<Self> {
        serde_json::from_str(content).map_err(io::Error::from)
    }

    /// The single remote server this document dials
    pub fn server(&self) -> Option<&ServerEndpoint> {
        self.outbounds.first()?.settings.vnext.first()
    }
}

/// Compile a profile into an engine document
pub fn translate(profile: &ConnectionProfile) -> EngineConfig {
    let stream_settings = StreamSettings {
        network: profile.transport().to_string(),
        security: profile
            .security
            .clone()
            .unwrap_or_else(|| "none".to_string()),
        tls_settings: tls_settings(profile),
        tcp_settings: tcp_settings(profile),
    };

    EngineConfig {
        log: LogSettings {
            loglevel: LOG_LEVEL.to_string(),
        },
        inbounds: vec![Inbound {
            listen: SOCKS_LISTEN.to_string(),
            port: SOCKS_PORT,
            protocol: "socks".to_string(),
            settings: InboundSettings {
                auth: "noauth".to_string(),
                udp: true,
            },
        }],
        outbounds: vec![Outbound {
            protocol: OUTBOUND_PROTOCOL.to_string(),
            settings: OutboundSettings {
                vnext: vec![ServerEndpoint {
                    address: profile.address.clone(),
                    port: profile.port,
                    users: vec![ServerUser {
                        id: profile.user_id.clone(),
                        encryption: "none".to_string(),
                    }],
                }],
            },
            stream_settings,
        }],
        dns: DnsSettings {
            servers: DNS_SERVERS.iter().map(|s| s.to_string()).collect(),
        },
    }
}

/// Compile and render in one step
pub fn render(profile: &ConnectionProfile) -> io::Result<String> {
    translate(profile).to_json()
}

fn tls_settings(profile: &ConnectionProfile) -> Option<TlsSettings> {
    if !profile.is_tls() {
        return None;
    }

    let server_name = profile
        .sni_list
        .first()
        .cloned()
        .unwrap_or_else(|| profile.address.clone());

    Some(TlsSettings {
        server_name,
        alpn: (!profile.alpn_list.is_empty()).then(|| profile.alpn_list.clone()),
        fingerprint: profile
            .fingerprint
            .as_ref()
            .filter(|fp| !fp.trim().is_empty())
            .cloned(),
    })
}

fn tcp_settings(profile: &ConnectionProfile) -> Option<TcpSettings> {
    if profile.transport() != "tcp" || profile.header_type.as_deref() != Some("http") {
        return None;
    }

    let headers = (!profile.host_header_list.is_empty()).then(|| RequestHeaders {
        host: profile.host_header_list.clone(),
    });

    Some(TcpSettings {
        header: HttpHeader {
            kind: "http".to_string(),
            request: HttpRequest {
                path: vec![profile.path().to_string()],
                headers,
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link;
    use serde_json::json;

    const SAMPLE: &str = "vless://11111111-1111-1111-1111-111111111111@example.com:443?security=tls&sni=cdn.example.com&type=tcp&headerType=http&path=%2Fws&host=a.com,b.com#My%20Node";

    fn profile(link: &str) -> ConnectionProfile {
        link::parse(link).unwrap()
    }

    #[test]
    fn test_full_document() {
        let rendered = render(&profile(SAMPLE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();

        let expected = json!({
            "log": {"loglevel": "warning"},
            "inbounds": [{
                "listen": "127.0.0.1",
                "port": 10808,
                "protocol": "socks",
                "settings": {"auth": "noauth", "udp": true}
            }],
            "outbounds": [{
                "protocol": "vless",
                "settings": {"vnext": [{
                    "address": "example.com",
                    "port": 443,
                    "users": [{"id": "11111111-1111-1111-1111-111111111111", "encryption": "none"}]
                }]},
                "streamSettings": {
                    "network": "tcp",
                    "security": "tls",
                    "tlsSettings": {"serverName": "cdn.example.com"},
                    "tcpSettings": {"header": {
                        "type": "http",
                        "request": {"path": ["/ws"], "headers": {"Host": ["a.com", "b.com"]}}
                    }}
                }
            }],
            "dns": {"servers": ["1.1.1.1", "8.8.8.8"]}
        });

        assert_eq!(value, expected);
    }

    #[test]
    fn test_render_is_byte_identical() {
        let first = render(&profile(SAMPLE)).unwrap();
        let second = render(&profile(SAMPLE)).unwrap();
        assert_eq!(first, second);

        // Fixed key order
        let log = first.find("\"log\"").unwrap();
        let inbounds = first.find("\"inbounds\"").unwrap();
        let outbounds = first.find("\"outbounds\"").unwrap();
        let dns = first.find("\"dns\"").unwrap();
        assert!(log < inbounds && inbounds < outbounds && outbounds < dns);
    }

    #[test]
    fn test_no_tls_block_without_tls() {
        let config = translate(&profile("vless://uuid@host.example:443?type=tcp"));
        let stream = &config.outbounds[0].stream_settings;
        assert!(stream.tls_settings.is_none());
        assert_eq!(stream.security, "none");

        let rendered = config.to_json().unwrap();
        assert!(!rendered.contains("tlsSettings"));
    }

    #[test]
    fn test_server_name_falls_back_to_address() {
        let config = translate(&profile(
            "vless://uuid@host.example:443?security=tls&alpn=h2,http/1.1&fp=chrome",
        ));
        let tls = config.outbounds[0]
            .stream_settings
            .tls_settings
            .as_ref()
            .unwrap();
        assert_eq!(tls.server_name, "host.example");
        assert_eq!(
            tls.alpn.as_deref(),
            Some(&["h2".to_string(), "http/1.1".to_string()][..])
        );
        assert_eq!(tls.fingerprint.as_deref(), Some("chrome"));
    }

    #[test]
    fn test_blank_transport_and_security_use_defaults() {
        let config = translate(&profile("vless://uuid@host.example?type=&security="));
        let stream = &config.outbounds[0].stream_settings;
        assert_eq!(stream.network, "tcp");
        assert_eq!(stream.security, "none");
        assert!(stream.tls_settings.is_none());
    }

    #[test]
    fn test_blank_fingerprint_omitted() {
        let config = translate(&profile("vless://uuid@host.example?security=tls&fp=%20"));
        let tls = config.outbounds[0]
            .stream_settings
            .tls_settings
            .as_ref()
            .unwrap();
        assert!(tls.fingerprint.is_none());
        assert!(tls.alpn.is_none());
    }

    #[test]
    fn test_http_header_requires_tcp_and_http() {
        let ws = translate(&profile("vless://uuid@host.example?type=ws&headerType=http"));
        assert!(ws.outbounds[0].stream_settings.tcp_settings.is_none());
        assert_eq!(ws.outbounds[0].stream_settings.network, "ws");

        let plain = translate(&profile("vless://uuid@host.example?type=tcp&headerType=none"));
        assert!(plain.outbounds[0].stream_settings.tcp_settings.is_none());

        // transport defaults to tcp
        let implicit = translate(&profile("vless://uuid@host.example?headerType=http"));
        let header = &implicit.outbounds[0]
            .stream_settings
            .tcp_settings
            .as_ref()
            .unwrap()
            .header;
        assert_eq!(header.request.path, vec!["/"]);
        assert!(header.request.headers.is_none());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = translate(&profile(SAMPLE));
        let parsed = EngineConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.server().unwrap().address, "example.com");
    }

    #[test]
    fn test_socks_endpoint() {
        assert_eq!(socks_endpoint(), "127.0.0.1:10808");
    }
}
