use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Hard ceiling for a persisted credential record, in bytes.
pub const MAX_RECORD_BYTES: usize = 1024;

/// 802.11 limit on network identifiers.
pub const MAX_SSID_BYTES: usize = 32;

/// WPA2 passphrase limit.
pub const MAX_SECRET_BYTES: usize = 64;

/// Upper bound for the temperature log; older rows are dropped past it.
pub const MAX_LOG_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisioningConfig {
    pub ap_ssid: String,
    pub ap_address: Ipv4Addr,
    pub join_timeout_ms: u64,
    pub restart_delay_ms: u64,
    pub retry_interval_ms: u64,
    /// DNS listen address; `None` binds the access-point address.
    pub dns_bind: Option<Ipv4Addr>,
    pub dns_port: u16,
    pub dns_ttl_secs: u32,
    pub dns_budget: usize,
    pub http_budget: usize,
    pub record_name: String,
    pub max_record_bytes: usize,
    /// NVS keys are limited to 15 characters.
    pub log_record_name: String,
    pub max_log_bytes: usize,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            ap_ssid: "ESP32-TempSensor".to_string(),
            ap_address: Ipv4Addr::new(192, 168, 4, 1),
            join_timeout_ms: 30_000,
            restart_delay_ms: 5_000,
            retry_interval_ms: 5_000,
            dns_bind: None,
            dns_port: 53,
            dns_ttl_secs: 60,
            dns_budget: 4,
            http_budget: 4,
            record_name: "wifi_config".to_string(),
            max_record_bytes: MAX_RECORD_BYTES,
            log_record_name: "temp_log.csv".to_string(),
            max_log_bytes: 8 * 1024,
        }
    }
}

impl ProvisioningConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        if self.ap_ssid.trim().is_empty() || self.ap_ssid.len() > MAX_SSID_BYTES {
            self.ap_ssid = defaults.ap_ssid;
        }
        if self.record_name.trim().is_empty() {
            self.record_name = defaults.record_name;
        }
        if self.log_record_name.trim().is_empty() || self.log_record_name == self.record_name {
            self.log_record_name = defaults.log_record_name;
        }

        self.join_timeout_ms = self.join_timeout_ms.clamp(1_000, 120_000);
        self.restart_delay_ms = self.restart_delay_ms.min(30_000);
        self.retry_interval_ms = self.retry_interval_ms.clamp(500, 60_000);
        self.dns_budget = self.dns_budget.clamp(1, 32);
        self.http_budget = self.http_budget.clamp(1, 32);
        self.max_record_bytes = self.max_record_bytes.clamp(64, MAX_RECORD_BYTES);
        self.max_log_bytes = self.max_log_bytes.clamp(256, MAX_LOG_BYTES);
    }
}
