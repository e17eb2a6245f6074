//! Share-link parsing
//!
//! Turns a `vless://` share-link into a [`ConnectionProfile`].
//!
//! ```text
//! vless://<user-id>@<address>[:<port>][?type=&security=&headerType=&host=&path=&sni=&alpn=&fp=][#<label>]
//! ```
//!
//! Query values are percent-decoded; `host`, `sni` and `alpn` carry
//! comma-separated lists. The fragment is not part of the profile proper:
//! callers that want a display name take it with [`label_from_fragment`].

use crate::error::{Error, Result};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use url::{Host, Url};

/// URI scheme of the share-links this parser accepts
pub const SHARE_SCHEME: &str = "vless";

/// Port used when the link carries none
pub const DEFAULT_PORT: u16 = 443;

/// Transport used when the link carries no `type`
pub const DEFAULT_TRANSPORT: &str = "tcp";

/// Request path used when the link carries no `path`
pub const DEFAULT_PATH: &str = "/";

/// Connection profile parsed from a share-link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionProfile {
    /// Server host name or IP literal
    pub address: String,
    /// Server port
    pub port: u16,
    /// User identifier (usually a UUID)
    pub user_id: String,
    /// Network type (`tcp`, `ws`, ...)
    pub transport: Option<String>,
    /// Security layer (`tls` or none)
    pub security: Option<String>,
    /// Transport header type (`http`, ...)
    pub header_type: Option<String>,
    /// HTTP `Host` header values, in link order
    pub host_header_list: Vec<String>,
    /// Request path
    pub path: Option<String>,
    /// TLS server names, in link order
    pub sni_list: Vec<String>,
    /// TLS ALPN protocols, in link order
    pub alpn_list: Vec<String>,
    /// TLS client fingerprint
    pub fingerprint: Option<String>,
    /// Display name taken from the link fragment
    pub label: Option<String>,
}

impl ConnectionProfile {
    /// Transport, falling back to `tcp`
    pub fn transport(&self) -> &str {
        self.transport.as_deref().unwrap_or(DEFAULT_TRANSPORT)
    }

    /// Request path, falling back to `/`
    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or(DEFAULT_PATH)
    }

    /// Whether the profile asks for TLS
    pub fn is_tls(&self) -> bool {
        self.security.as_deref() == Some("tls")
    }

    /// Attach a display label
    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }
}

/// Parse a share-link into a profile.
///
/// Pure: the same input always yields the same profile. The `label`
/// field is left empty.
pub fn parse(link: &str) -> Result<ConnectionProfile> {
    let url = Url::parse(link.trim()).map_err(|e| Error::InvalidLink(e.to_string()))?;

    if url.scheme() != SHARE_SCHEME {
        return Err(Error::InvalidLink(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }

    let user_id = user_info(&url);
    if user_id.is_empty() {
        return Err(Error::InvalidLink("missing user id".into()));
    }

    let address = match url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        _ => return Err(Error::InvalidLink("missing host".into())),
    };

    let port = match url.port() {
        Some(port) if port > 0 => port,
        _ => DEFAULT_PORT,
    };

    let mut params = parse_query(url.query().unwrap_or_default());

    Ok(ConnectionProfile {
        address,
        port,
        user_id,
        transport: take(&mut params, "type"),
        security: take(&mut params, "security"),
        header_type: take(&mut params, "headerType"),
        host_header_list: params
            .remove("host")
            .map(|v| split_list(&v))
            .unwrap_or_default(),
        // Already form-decoded once; links in the wild often double-encode paths.
        path: take(&mut params, "path").map(|p| decode_percent(&p)),
        sni_list: params
            .remove("sni")
            .map(|v| split_list(&v))
            .unwrap_or_default(),
        alpn_list: params
            .remove("alpn")
            .map(|v| split_list(&v))
            .unwrap_or_default(),
        fingerprint: take(&mut params, "fp"),
        label: None,
    })
}

/// Decoded text after `#`, if any and non-blank
pub fn label_from_fragment(link: &str) -> Option<String> {
    let (_, fragment) = link.trim().split_once('#')?;
    let label = decode_percent(fragment);
    if label.trim().is_empty() {
        None
    } else {
        Some(label)
    }
}

/// Parse a link and attach the fragment label
pub fn parse_labeled(link: &str) -> Result<ConnectionProfile> {
    Ok(parse(link)?.with_label(label_from_fragment(link)))
}

fn user_info(url: &Url) -> String {
    let user = decode_percent(url.username());
    match url.password() {
        Some(password) => format!("{}:{}", user, decode_percent(password)),
        None => user,
    }
}

/// Remove a parameter, treating a blank value as absent
fn take(params: &mut HashMap<String, String>, key: &str) -> Option<String> {
    params.remove(key).filter(|v| !v.trim().is_empty())
}

/// Split `a=b&c=d`; pairs without `=` or with an empty key are skipped
fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for part in query.split('&') {
        let Some(idx) = part.find('=') else {
            continue;
        };
        if idx == 0 {
            continue;
        }
        let key = decode_form(&part[..idx]);
        let value = decode_form(&part[idx + 1..]);
        params.insert(key, value);
    }

    params
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .collect()
}

fn decode_form(s: &str) -> String {
    decode_percent(&s.replace('+', " "))
}

fn decode_percent(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}
