//! Connection supervisor.
//!
//! Owns the radio, the credential store and, while provisioning, the captive
//! portal. Driven by the platform loop through [`ConnectionSupervisor::tick`];
//! nothing here sleeps except [`ConnectionSupervisor::settle`] at boot.

use std::{io, net::SocketAddr};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::{
    config::ProvisioningConfig,
    credentials::{Credential, CredentialStore, RecordStorage},
    datalog::{clock_is_synced, TemperatureLog},
    driver::{AccessPointSettings, DriverError, LinkStatus, NetworkDriver, Personality},
    portal::{Method, PortalPages, PortalRequest, PortalResponse, ProvisioningPortal},
    types::{NetworkStatus, RestartReason, SupervisorAction, SupervisorState},
};

pub const NETWORK_PATH: &str = "/network";
pub const RESET_PATH: &str = "/resetwifi";
pub const LOG_PATH: &str = "/data/csv";
pub const DELETE_LOG_PATH: &str = "/delete-file";

const RESET_MESSAGE: &str = "WiFi settings reset. Device will restart to configure a new network.";
const NOT_CONNECTED: &str = "Not connected";
const LOG_DELETED_MESSAGE: &str = "Csv file deleted";
const LOG_UNREADABLE_MESSAGE: &str = "Failed to read temperature log";

#[derive(Debug, Clone, Copy)]
struct ScheduledRestart {
    at_ms: u64,
    reason: RestartReason,
}

pub struct ConnectionSupervisor<D, S> {
    config: ProvisioningConfig,
    driver: D,
    store: CredentialStore<S>,
    log: TemperatureLog,
    pages: PortalPages,

    state: SupervisorState,
    credential: Option<Credential>,
    personality: Option<Personality>,
    portal: Option<ProvisioningPortal>,

    attempt_started_ms: Option<u64>,
    join_attempts: u32,
    next_portal_retry_ms: Option<u64>,
    restart: Option<ScheduledRestart>,
}

impl<D: NetworkDriver, S: RecordStorage> ConnectionSupervisor<D, S> {
    pub fn new(mut config: ProvisioningConfig, driver: D, storage: S, pages: PortalPages) -> Self {
        config.sanitize();
        let store = CredentialStore::with_limit(
            storage,
            config.record_name.clone(),
            config.max_record_bytes,
        );
        let log = TemperatureLog::new(config.log_record_name.clone(), config.max_log_bytes);
        Self {
            config,
            driver,
            store,
            log,
            pages,
            state: SupervisorState::Unprovisioned,
            credential: None,
            personality: None,
            portal: None,
            attempt_started_ms: None,
            join_attempts: 0,
            next_portal_retry_ms: None,
            restart: None,
        }
    }

    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn store(&self) -> &CredentialStore<S> {
        &self.store
    }

    pub fn join_attempts(&self) -> u32 {
        self.join_attempts
    }

    pub fn pending_restart(&self) -> Option<RestartReason> {
        self.restart.map(|restart| restart.reason)
    }

    pub fn portal_dns_addr(&self) -> Option<io::Result<SocketAddr>> {
        self.portal.as_ref().map(ProvisioningPortal::dns_local_addr)
    }

    /// Returns the radio and storage so the next boot can reuse them.
    pub fn into_parts(self) -> (D, S) {
        (self.driver, self.store.into_storage())
    }

    pub fn boot(&mut self, now_ms: u64) {
        if self.state != SupervisorState::Unprovisioned {
            return;
        }

        match self.store.load() {
            Some(credential) => {
                self.credential = Some(credential);
                self.begin_join(now_ms);
            }
            None => self.enter_provisioning(now_ms),
        }
    }

    /// Boots and blocks until the first join attempt resolves.
    pub fn settle(&mut self, mut now_ms: impl FnMut() -> u64, mut pause: impl FnMut()) {
        self.boot(now_ms());
        while self.state == SupervisorState::Joining {
            pause();
            // A restart can only be scheduled by a request or a reset, neither
            // of which happens before the loop starts.
            let _ = self.tick(now_ms());
        }
    }

    pub fn tick(&mut self, now_ms: u64) -> Option<SupervisorAction> {
        if let Some(restart) = self.restart {
            if now_ms >= restart.at_ms {
                return Some(SupervisorAction::Restart {
                    reason: restart.reason,
                });
            }
        }

        match self.state {
            SupervisorState::Unprovisioned => {}
            SupervisorState::Joining => self.poll_join(now_ms),
            SupervisorState::Joined => {
                if self.driver.connection_status() == LinkStatus::Disconnected {
                    warn!("wifi link lost; rejoining");
                    self.begin_join(now_ms);
                }
            }
            SupervisorState::Provisioning => {
                let retry_due = self
                    .next_portal_retry_ms
                    .is_some_and(|retry_at| now_ms >= retry_at);
                if self.portal.is_none() && retry_due {
                    self.start_portal(now_ms);
                }
            }
        }

        None
    }

    /// Answers pending captive DNS queries; a no-op outside provisioning.
    pub fn service_portal(&self) -> usize {
        self.portal
            .as_ref()
            .map_or(0, |portal| portal.service_dns(self.config.dns_budget))
    }

    /// Routes one HTTP request. `None` means the request is not ours and the
    /// platform should fall through to its static files.
    pub fn handle_request(
        &mut self,
        request: &PortalRequest,
        now_ms: u64,
    ) -> Option<PortalResponse> {
        if self.state == SupervisorState::Provisioning {
            let reply = self.portal.as_ref()?.handle(request, &mut self.store);
            if reply.saved.is_some() && self.restart.is_none() {
                self.schedule_restart(
                    now_ms + self.config.restart_delay_ms,
                    RestartReason::CredentialsSaved,
                );
            }
            return Some(reply.response);
        }

        if request.method != Method::Get {
            return None;
        }
        match request.path.as_str() {
            NETWORK_PATH => {
                let status = self.status();
                Some(PortalResponse::html(
                    200,
                    format!(
                        "SSID: {}<br>IP Address: {}<br>",
                        status.ssid, status.ip_address
                    ),
                ))
            }
            RESET_PATH => {
                self.reset_settings(now_ms);
                Some(PortalResponse::text(200, RESET_MESSAGE))
            }
            LOG_PATH => match self.log.contents(self.store.storage_mut()) {
                Ok(csv) => Some(PortalResponse::csv(csv)),
                Err(err) => {
                    warn!("failed to read temperature log: {err}");
                    Some(PortalResponse::text(500, LOG_UNREADABLE_MESSAGE))
                }
            },
            DELETE_LOG_PATH => {
                self.clear_log();
                Some(PortalResponse::text(200, LOG_DELETED_MESSAGE))
            }
            _ => None,
        }
    }

    /// Appends a reading to the temperature log. Readings taken before the
    /// wall clock is set are skipped; returns whether the row was stored.
    pub fn record_reading(&mut self, at: DateTime<Utc>, celsius: f32) -> bool {
        if !celsius.is_finite() {
            return false;
        }
        if !clock_is_synced(at) {
            debug!("clock not set yet; reading not logged");
            return false;
        }

        match self.log.append(self.store.storage_mut(), at, celsius) {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to append temperature log: {err}");
                false
            }
        }
    }

    /// Deletes the temperature log; returns whether one existed.
    pub fn clear_log(&mut self) -> bool {
        match self.log.remove(self.store.storage_mut()) {
            Ok(true) => {
                info!("temperature log deleted");
                true
            }
            Ok(false) => false,
            Err(err) => {
                warn!("failed to delete temperature log: {err}");
                false
            }
        }
    }

    /// Long-press reset: forgets the network and the temperature history.
    pub fn factory_reset(&mut self, now_ms: u64) {
        self.clear_log();
        self.reset_settings(now_ms);
    }

    /// Forgets the stored network and restarts as soon as the platform ticks.
    pub fn reset_settings(&mut self, now_ms: u64) {
        info!("resetting wifi settings");
        if let Err(err) = self.store.clear() {
            warn!("failed to clear wifi credentials: {err}");
        }
        self.credential = None;
        self.schedule_restart(now_ms, RestartReason::SettingsReset);
    }

    /// Drops the portal ahead of a restart.
    pub fn shutdown(&mut self) {
        self.transition(SupervisorState::Unprovisioned);
    }

    pub fn status(&self) -> NetworkStatus {
        let ip_address = match self.state {
            SupervisorState::Joined => self.driver.local_address().map(|ip| ip.to_string()),
            SupervisorState::Provisioning if self.portal.is_some() => {
                Some(self.driver.access_point_address().to_string())
            }
            _ => None,
        };

        NetworkStatus {
            state: self.state.as_str(),
            ssid: self
                .credential
                .as_ref()
                .filter(|_| self.state == SupervisorState::Joined)
                .map(|credential| credential.network_identifier.clone())
                .unwrap_or_default(),
            ip_address: ip_address.unwrap_or_else(|| NOT_CONNECTED.to_string()),
            join_attempts: self.join_attempts,
        }
    }

    fn begin_join(&mut self, now_ms: u64) {
        let Some(credential) = self.credential.clone() else {
            self.enter_provisioning(now_ms);
            return;
        };

        self.transition(SupervisorState::Joining);
        if let Err(err) = self.ensure_personality(Personality::Client) {
            warn!("failed to enter client mode: {err}");
            self.enter_provisioning(now_ms);
            return;
        }

        self.join_attempts += 1;
        info!(
            "joining `{}` (attempt {})",
            credential.network_identifier, self.join_attempts
        );
        match self.driver.join(&credential) {
            Ok(()) => self.attempt_started_ms = Some(now_ms),
            Err(err) => {
                warn!("join request rejected: {err}");
                self.enter_provisioning(now_ms);
            }
        }
    }

    fn poll_join(&mut self, now_ms: u64) {
        if self.driver.connection_status() == LinkStatus::Connected {
            self.attempt_started_ms = None;
            self.transition(SupervisorState::Joined);
            match self.driver.local_address() {
                Some(ip) => info!("wifi connected, ip {ip}"),
                None => info!("wifi connected"),
            }
            return;
        }

        let started_ms = self.attempt_started_ms.unwrap_or(now_ms);
        if now_ms.saturating_sub(started_ms) >= self.config.join_timeout_ms {
            warn!(
                "join timed out after {} ms",
                now_ms.saturating_sub(started_ms)
            );
            self.enter_provisioning(now_ms);
        }
    }

    fn enter_provisioning(&mut self, now_ms: u64) {
        self.attempt_started_ms = None;
        self.transition(SupervisorState::Provisioning);
        self.start_portal(now_ms);
    }

    fn start_portal(&mut self, now_ms: u64) {
        let personality = Personality::AccessPoint(AccessPointSettings {
            ssid: self.config.ap_ssid.clone(),
            address: self.config.ap_address,
        });
        if let Err(err) = self.ensure_personality(personality) {
            warn!("failed to start access point: {err}");
            self.next_portal_retry_ms = Some(now_ms + self.config.retry_interval_ms);
            return;
        }

        let address = self.driver.access_point_address();
        match ProvisioningPortal::start(&self.config, address, self.pages.clone()) {
            Ok(portal) => {
                info!(
                    "provisioning on `{}` at http://{address}/",
                    self.config.ap_ssid
                );
                self.portal = Some(portal);
                self.next_portal_retry_ms = None;
            }
            Err(err) => {
                warn!("failed to start captive portal: {err}");
                self.next_portal_retry_ms = Some(now_ms + self.config.retry_interval_ms);
            }
        }
    }

    fn ensure_personality(&mut self, personality: Personality) -> Result<(), DriverError> {
        if self.personality.as_ref() == Some(&personality) {
            return Ok(());
        }

        info!("switching radio to {} mode", personality.as_str());
        // Unknown until the switch succeeds.
        self.personality = None;
        self.driver.set_personality(&personality)?;
        self.personality = Some(personality);
        Ok(())
    }

    fn transition(&mut self, next: SupervisorState) {
        if self.state == next {
            return;
        }
        if self.state == SupervisorState::Provisioning && self.portal.take().is_some() {
            info!("captive portal stopped");
        }
        info!("wifi state {} -> {}", self.state.as_str(), next.as_str());
        self.state = next;
    }

    fn schedule_restart(&mut self, at_ms: u64, reason: RestartReason) {
        info!("restart scheduled ({})", reason.as_str());
        self.restart = Some(ScheduledRestart { at_ms, reason });
    }
}
