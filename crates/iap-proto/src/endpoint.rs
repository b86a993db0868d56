//! Relay connect and reconnect endpoints

use crate::target::Target;
use std::collections::HashMap;
use thiserror::Error;
use url::{form_urlencoded, Url};

/// WebSocket subprotocol spoken by the relay
pub const SUBPROTOCOL: &str = "relay.tunnel.cloudproxy.app";

/// Path for opening a new session
pub const CONNECT_PATH: &str = "/v4/connect";

/// Path for resuming an existing session on a new WebSocket
pub const RECONNECT_PATH: &str = "/v4/reconnect";

/// Endpoint errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Unsupported relay URL scheme '{0}' (expected ws or wss)")]
    UnsupportedScheme(String),

    #[error("Unknown relay path: {0}")]
    UnknownPath(String),

    #[error("Missing query parameter '{0}'")]
    MissingParameter(String),

    #[error("Invalid value for query parameter '{name}': {value}")]
    InvalidParameter { name: String, value: String },
}

fn endpoint(base: &Url, path: &str) -> Result<Url, EndpointError> {
    match base.scheme() {
        "ws" | "wss" => {}
        other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
    }

    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{}{}", prefix, path));
    url.set_query(None);
    Ok(url)
}

/// URL that opens a new relay session for `target`
pub fn connect_url(base: &Url, target: &Target) -> Result<Url, EndpointError> {
    let mut url = endpoint(base, CONNECT_PATH)?;
    url.query_pairs_mut()
        .append_pair("project", target.project())
        .append_pair("zone", target.zone())
        .append_pair("instance", target.instance())
        .append_pair("interface", target.interface())
        .append_pair("port", &target.port().to_string())
        .append_pair("newWebsocket", "true");
    Ok(url)
}

/// URL that resumes session `sid`, telling the relay we have received `ack` bytes
pub fn reconnect_url(
    base: &Url,
    sid: &str,
    ack: u64,
    target: &Target,
) -> Result<Url, EndpointError> {
    let mut url = endpoint(base, RECONNECT_PATH)?;
    url.query_pairs_mut()
        .append_pair("sid", sid)
        .append_pair("ack", &ack.to_string())
        .append_pair("zone", target.zone())
        .append_pair("newWebsocket", "true");
    Ok(url)
}

/// A parsed relay upgrade request, as seen by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayRequest {
    Connect(Target),
    Reconnect { sid: String, ack: u64 },
}

fn required<'a>(params: &'a HashMap<String, String>, name: &str) -> Result<&'a str, EndpointError> {
    params
        .get(name)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| EndpointError::MissingParameter(name.to_string()))
}

impl RelayRequest {
    /// Parse the path and query string of an upgrade request
    pub fn parse(path: &str, query: Option<&str>) -> Result<Self, EndpointError> {
        let params: HashMap<String, String> =
            form_urlencoded::parse(query.unwrap_or_default().as_bytes())
                .into_owned()
                .collect();

        let path = path.trim_end_matches('/');

        if path.ends_with(CONNECT_PATH) {
            let port_str = required(&params, "port")?;
            let port: u16 = port_str
                .parse()
                .map_err(|_| EndpointError::InvalidParameter {
                    name: "port".to_string(),
                    value: port_str.to_string(),
                })?;

            let mut target = Target::new(
                required(&params, "project")?,
                required(&params, "zone")?,
                required(&params, "instance")?,
                port,
            );
            if let Some(interface) = params.get("interface").filter(|i| !i.is_empty()) {
                target = target.with_interface(interface.as_str());
            }

            Ok(RelayRequest::Connect(target))
        } else if path.ends_with(RECONNECT_PATH) {
            let sid = required(&params, "sid")?.to_string();
            let ack_str = required(&params, "ack")?;
            let ack: u64 = ack_str
                .parse()
                .map_err(|_| EndpointError::InvalidParameter {
                    name: "ack".to_string(),
                    value: ack_str.to_string(),
                })?;

            Ok(RelayRequest::Reconnect { sid, ack })
        } else {
            Err(EndpointError::UnknownPath(path.to_string()))
        }
    }
}
