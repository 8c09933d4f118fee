//! Contract between the connection supervisor and the radio.
//!
//! Implementations must complete a personality switch before returning from
//! [`NetworkDriver::set_personality`]: the previous personality is fully torn
//! down before the new one is brought up. The supervisor relies on this to
//! guarantee client and access-point modes never overlap.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::credentials::Credential;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Personality {
    Client,
    AccessPoint(AccessPointSettings),
}

impl Personality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::AccessPoint(_) => "access-point",
        }
    }
}

/// Access-point parameters. The provisioning network is always open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointSettings {
    pub ssid: String,
    pub address: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("network identifier is not accepted by the radio")]
    InvalidSsid,
    #[error("secret is not accepted by the radio")]
    InvalidSecret,
    #[error("radio rejected the request: {0}")]
    Radio(String),
}

pub trait NetworkDriver {
    fn set_personality(&mut self, personality: &Personality) -> Result<(), DriverError>;

    /// Issues a join request and returns immediately; progress is observed
    /// through [`NetworkDriver::connection_status`].
    fn join(&mut self, credential: &Credential) -> Result<(), DriverError>;

    fn connection_status(&self) -> LinkStatus;

    fn local_address(&self) -> Option<Ipv4Addr>;

    fn access_point_address(&self) -> Ipv4Addr;
}
