//! Captive provisioning portal.
//!
//! The portal owns the DNS responder socket for as long as it lives; dropping
//! it releases the port. HTTP transport belongs to the platform, which hands
//! each request to [`ProvisioningPortal::handle`] and writes back the
//! returned [`PortalResponse`].

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    time::Duration,
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    config::{ProvisioningConfig, MAX_SECRET_BYTES, MAX_SSID_BYTES},
    credentials::{Credential, CredentialStore, RecordStorage, StoreError},
};

/// Receive and reply buffer size for captive DNS traffic.
pub const DNS_PACKET_LEN: usize = 1500;

pub const ROOT_PATH: &str = "/";
pub const SAVE_CONFIG_PATH: &str = "/save-config";

pub const FORM_ASSET: &str = "wifi_config.html";
pub const SAVED_ASSET: &str = "wifi_saved.html";

const FALLBACK_FORM_HTML: &str = r#"<!DOCTYPE html>
<html><head><meta name="viewport" content="width=device-width, initial-scale=1"><title>WiFi Configuration</title></head>
<body><form action="/save-config" method="post">
<label>Network Name (SSID): <input name="network_identifier" required></label>
<label>Password: <input type="password" name="secret"></label>
<button type="submit">Connect</button>
</form></body></html>
"#;

const FALLBACK_SAVED_HTML: &str = r#"<!DOCTYPE html>
<html><head><title>Configuration Saved</title></head>
<body><p>WiFi settings saved. The device will restart and join your network.</p></body></html>
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other,
}

impl Method {
    pub fn parse(method: &str) -> Self {
        if method.eq_ignore_ascii_case("GET") {
            Self::Get
        } else if method.eq_ignore_ascii_case("POST") {
            Self::Post
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRequest {
    pub method: Method,
    pub path: String,
    pub body: Vec<u8>,
}

impl PortalRequest {
    /// Builds a request from a raw URI; any query string is dropped.
    pub fn new(method: Method, uri: &str, body: Vec<u8>) -> Self {
        let path = uri.split_once('?').map_or(uri, |(path, _)| path);
        let path = if path.is_empty() { ROOT_PATH } else { path };
        Self {
            method,
            path: path.to_string(),
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
    pub location: Option<String>,
}

impl PortalResponse {
    pub fn html(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/html; charset=utf-8",
            body: body.into(),
            location: None,
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
            location: None,
        }
    }

    pub fn csv(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "text/csv",
            body: body.into(),
            location: None,
        }
    }

    pub fn redirect(location: &str) -> Self {
        Self {
            status: 302,
            content_type: "text/plain; charset=utf-8",
            body: String::new(),
            location: Some(location.to_string()),
        }
    }
}

/// Read-only access to bundled static files.
pub trait AssetSource {
    fn load_asset(&self, name: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalPages {
    pub form: String,
    pub saved: String,
}

impl Default for PortalPages {
    fn default() -> Self {
        Self {
            form: FALLBACK_FORM_HTML.to_string(),
            saved: FALLBACK_SAVED_HTML.to_string(),
        }
    }
}

impl PortalPages {
    pub fn load(assets: &impl AssetSource) -> Self {
        let fallback = Self::default();
        Self {
            form: assets.load_asset(FORM_ASSET).unwrap_or_else(|| {
                warn!("portal asset `{FORM_ASSET}` missing; using built-in form");
                fallback.form
            }),
            saved: assets.load_asset(SAVED_ASSET).unwrap_or(fallback.saved),
        }
    }
}

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("failed to bind DNS responder on {addr}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("{0}")]
    ValidationFailed(&'static str),
    #[error("failed to persist credentials")]
    WriteRejected(#[source] StoreError),
}

impl SubmissionError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ValidationFailed(_) | Self::WriteRejected(StoreError::TooLarge { .. }) => 400,
            Self::WriteRejected(_) => 500,
        }
    }

    pub fn client_message(&self) -> &'static str {
        match self {
            Self::ValidationFailed(message) => *message,
            Self::WriteRejected(StoreError::TooLarge { .. }) => "Configuration is too large",
            Self::WriteRejected(_) => "Failed to save WiFi configuration",
        }
    }
}

/// Fields posted by the configuration form. `ssid` and `password` are
/// accepted as aliases.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SaveConfigForm {
    pub network_identifier: Option<String>,
    pub secret: Option<String>,
}

impl SaveConfigForm {
    pub fn parse(body: &[u8]) -> Self {
        let body = String::from_utf8_lossy(body);
        let mut form = Self::default();
        let mut ssid_alias = None;
        let mut password_alias = None;

        for pair in body.split('&').filter(|pair| !pair.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = decode_component(value);
            match decode_component(name).as_str() {
                "network_identifier" => form.network_identifier = Some(value),
                "secret" => form.secret = Some(value),
                "ssid" => ssid_alias = Some(value),
                "password" => password_alias = Some(value),
                _ => {}
            }
        }

        form.network_identifier = form.network_identifier.or(ssid_alias);
        form.secret = form.secret.or(password_alias);
        form
    }

    pub fn validate(self) -> Result<Credential, SubmissionError> {
        let network_identifier = self.network_identifier.unwrap_or_default();
        let secret = self.secret.unwrap_or_default();

        if network_identifier.trim().is_empty() {
            return Err(SubmissionError::ValidationFailed("SSID is required"));
        }
        if network_identifier.len() > MAX_SSID_BYTES {
            return Err(SubmissionError::ValidationFailed(
                "SSID must be at most 32 bytes",
            ));
        }
        if secret.len() > MAX_SECRET_BYTES {
            return Err(SubmissionError::ValidationFailed(
                "Password must be at most 64 bytes",
            ));
        }

        Ok(Credential::new(network_identifier, secret))
    }
}

/// Decodes one `application/x-www-form-urlencoded` component. Invalid escapes
/// are kept literally.
fn decode_component(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Non-blocking UDP responder answering every query with one address.
#[derive(Debug)]
pub struct DnsResponder {
    socket: UdpSocket,
    address: Ipv4Addr,
    ttl_secs: u32,
}

impl DnsResponder {
    pub fn bind(bind: SocketAddrV4, address: Ipv4Addr, ttl_secs: u32) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            address,
            ttl_secs,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Answers at most `budget` pending queries; returns how many were answered.
    pub fn service(&self, budget: usize) -> usize {
        let mut rx_buf = [0_u8; DNS_PACKET_LEN];
        let mut tx_buf = [0_u8; DNS_PACKET_LEN];
        let mut answered = 0;

        for _ in 0..budget {
            let (len, peer) = match self.socket.recv_from(&mut rx_buf) {
                Ok(received) => received,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!("dns receive failed: {err}");
                    break;
                }
            };

            let ttl = Duration::from_secs(u64::from(self.ttl_secs));
            match edge_captive::reply(&rx_buf[..len], &self.address.octets(), ttl, &mut tx_buf) {
                Ok(reply_len) => match self.socket.send_to(&tx_buf[..reply_len], peer) {
                    Ok(_) => answered += 1,
                    Err(err) => debug!("dns reply to {peer} failed: {err}"),
                },
                Err(err) => debug!("dropping dns packet from {peer}: {err}"),
            }
        }

        answered
    }
}

/// Outcome of one portal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalReply {
    pub response: PortalResponse,
    pub saved: Option<Credential>,
}

impl PortalReply {
    fn respond(response: PortalResponse) -> Self {
        Self {
            response,
            saved: None,
        }
    }
}

#[derive(Debug)]
pub struct ProvisioningPortal {
    dns: DnsResponder,
    pages: PortalPages,
}

impl ProvisioningPortal {
    pub fn start(
        config: &ProvisioningConfig,
        address: Ipv4Addr,
        pages: PortalPages,
    ) -> Result<Self, PortalError> {
        let addr = SocketAddrV4::new(config.dns_bind.unwrap_or(address), config.dns_port);
        let dns = DnsResponder::bind(addr, address, config.dns_ttl_secs)
            .map_err(|source| PortalError::Bind { addr, source })?;

        info!("captive portal up: dns on {addr} resolving to {address}");
        Ok(Self { dns, pages })
    }

    pub fn dns_local_addr(&self) -> io::Result<SocketAddr> {
        self.dns.local_addr()
    }

    pub fn service_dns(&self, budget: usize) -> usize {
        self.dns.service(budget)
    }

    pub fn handle<S: RecordStorage>(
        &self,
        request: &PortalRequest,
        store: &mut CredentialStore<S>,
    ) -> PortalReply {
        match (request.method, request.path.as_str()) {
            (Method::Get, ROOT_PATH) => {
                PortalReply::respond(PortalResponse::html(200, self.pages.form.clone()))
            }
            (Method::Post, SAVE_CONFIG_PATH) => self.handle_submission(request, store),
            _ => PortalReply::respond(PortalResponse::redirect(ROOT_PATH)),
        }
    }

    fn handle_submission<S: RecordStorage>(
        &self,
        request: &PortalRequest,
        store: &mut CredentialStore<S>,
    ) -> PortalReply {
        let result = SaveConfigForm::parse(&request.body)
            .validate()
            .and_then(|credential| {
                store
                    .save(&credential)
                    .map(|()| credential)
                    .map_err(SubmissionError::WriteRejected)
            });

        match result {
            Ok(credential) => PortalReply {
                response: PortalResponse::html(200, self.pages.saved.clone()),
                saved: Some(credential),
            },
            Err(err) => {
                warn!("wifi configuration rejected: {err}");
                PortalReply::respond(PortalResponse::text(
                    err.status_code(),
                    err.client_message(),
                ))
            }
        }
    }
}
