use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisorState {
    Unprovisioned,
    Joining,
    Joined,
    Provisioning,
}

impl SupervisorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unprovisioned => "UNPROVISIONED",
            Self::Joining => "JOINING",
            Self::Joined => "JOINED",
            Self::Provisioning => "PROVISIONING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    CredentialsSaved,
    SettingsReset,
}

impl RestartReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CredentialsSaved => "credentials saved",
            Self::SettingsReset => "settings reset",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    Restart { reason: RestartReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkStatus {
    pub state: &'static str,
    pub ssid: String,
    #[serde(rename = "ipAddress")]
    pub ip_address: String,
    #[serde(rename = "joinAttempts")]
    pub join_attempts: u32,
}
