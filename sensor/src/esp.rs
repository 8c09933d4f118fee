use std::{
    io,
    net::Ipv4Addr,
    sync::{
        mpsc::{self, Receiver, SyncSender},
        OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::EspSntp,
    sys::EspError,
    wifi::EspWifi,
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};

use tempsensor_common::{
    ConnectionSupervisor, Credential, DriverError, LinkStatus, LongPress, NetworkDriver,
    Personality, PortalPages, PortalRequest, PortalResponse, ProvisioningConfig, RecordStorage,
    SupervisorAction, SupervisorState,
};

use crate::assets::EmbeddedAssets;

const NVS_NAMESPACE: &str = "tempsensor";

const DS18B20_PIN: i32 = 4;
const RESET_BUTTON_PIN: i32 = 35;

const MAX_HTTP_BODY: usize = 4096;
const HTTP_QUEUE_DEPTH: usize = 8;
const HTTP_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const LOOP_INTERVAL_MS: u64 = 20;
const SETTLE_POLL_MS: u64 = 500;
const SENSOR_INTERVAL_MS: u64 = 3_000;

struct HttpExchange {
    request: PortalRequest,
    reply: mpsc::Sender<Option<PortalResponse>>,
}

struct EspRadio {
    wifi: EspWifi<'static>,
    ap_address: Ipv4Addr,
}

impl EspRadio {
    fn new(wifi: EspWifi<'static>, ap_address: Ipv4Addr) -> Self {
        Self { wifi, ap_address }
    }
}

impl NetworkDriver for EspRadio {
    fn set_personality(&mut self, personality: &Personality) -> Result<(), DriverError> {
        if self.wifi.is_started().map_err(radio_error)? {
            let _ = self.wifi.disconnect();
            self.wifi.stop().map_err(radio_error)?;
        }

        let configuration = match personality {
            Personality::Client => Configuration::Client(ClientConfiguration::default()),
            Personality::AccessPoint(settings) => {
                Configuration::AccessPoint(AccessPointConfiguration {
                    ssid: settings
                        .ssid
                        .as_str()
                        .try_into()
                        .map_err(|_| DriverError::InvalidSsid)?,
                    auth_method: AuthMethod::None,
                    channel: 1,
                    ..Default::default()
                })
            }
        };

        self.wifi
            .set_configuration(&configuration)
            .map_err(radio_error)?;
        self.wifi.start().map_err(radio_error)
    }

    fn join(&mut self, credential: &Credential) -> Result<(), DriverError> {
        let auth_method = if credential.is_open() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        let configuration = Configuration::Client(ClientConfiguration {
            ssid: credential
                .network_identifier
                .as_str()
                .try_into()
                .map_err(|_| DriverError::InvalidSsid)?,
            password: credential
                .secret
                .as_str()
                .try_into()
                .map_err(|_| DriverError::InvalidSecret)?,
            auth_method,
            ..Default::default()
        });

        let _ = self.wifi.disconnect();
        self.wifi
            .set_configuration(&configuration)
            .map_err(radio_error)?;
        self.wifi.connect().map_err(radio_error)
    }

    fn connection_status(&self) -> LinkStatus {
        let associated = self.wifi.is_connected().unwrap_or(false);
        let netif_up = self.wifi.sta_netif().is_up().unwrap_or(false);
        if associated && netif_up {
            LinkStatus::Connected
        } else {
            LinkStatus::Disconnected
        }
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.wifi
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|ip_info| ip_info.ip)
            .filter(|ip| !ip.is_unspecified())
    }

    fn access_point_address(&self) -> Ipv4Addr {
        self.wifi
            .ap_netif()
            .get_ip_info()
            .map(|ip_info| ip_info.ip)
            .unwrap_or(self.ap_address)
    }
}

fn radio_error(err: EspError) -> DriverError {
    DriverError::Radio(err.to_string())
}

/// Records as NVS blobs. An unopenable namespace reads as unavailable storage.
struct NvsStorage {
    nvs: Option<EspNvs<NvsDefault>>,
}

impl NvsStorage {
    fn open(partition: EspDefaultNvsPartition) -> Self {
        match EspNvs::new(partition, NVS_NAMESPACE, true) {
            Ok(nvs) => Self { nvs: Some(nvs) },
            Err(err) => {
                warn!("failed to open NVS namespace `{NVS_NAMESPACE}`: {err:?}");
                Self { nvs: None }
            }
        }
    }

    fn nvs(&self) -> io::Result<&EspNvs<NvsDefault>> {
        self.nvs
            .as_ref()
            .ok_or_else(|| io::Error::other("NVS namespace unavailable"))
    }

    fn nvs_mut(&mut self) -> io::Result<&mut EspNvs<NvsDefault>> {
        self.nvs
            .as_mut()
            .ok_or_else(|| io::Error::other("NVS namespace unavailable"))
    }
}

fn nvs_error(err: EspError) -> io::Error {
    io::Error::other(err.to_string())
}

impl RecordStorage for NvsStorage {
    fn exists(&self, name: &str) -> io::Result<bool> {
        self.nvs()?.contains(name).map_err(nvs_error)
    }

    fn size(&self, name: &str) -> io::Result<u64> {
        match self.nvs()?.blob_len(name).map_err(nvs_error)? {
            Some(len) => Ok(len as u64),
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }

    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        let len = self.size(name)? as usize;
        let mut buffer = vec![0_u8; len];
        match self.nvs()?.get_blob(name, &mut buffer).map_err(nvs_error)? {
            Some(data) => Ok(data.to_vec()),
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }

    fn write(&mut self, name: &str, bytes: &[u8]) -> io::Result<()> {
        self.nvs_mut()?.set_blob(name, bytes).map_err(nvs_error)
    }

    fn remove(&mut self, name: &str) -> io::Result<()> {
        if self.nvs_mut()?.remove(name).map_err(nvs_error)? {
            Ok(())
        } else {
            Err(io::ErrorKind::NotFound.into())
        }
    }
}

struct SensorSuite {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    ds18_address: Option<Address>,
    delay: Ets,
}

impl SensorSuite {
    fn new(ds18_pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut one_wire_pin = PinDriver::input_output_od(ds18_pin)?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut suite = Self {
            one_wire,
            ds18_address: None,
            delay: Ets,
        };

        suite.refresh_ds18_address();
        Ok(suite)
    }

    fn refresh_ds18_address(&mut self) {
        let mut first_ds18: Option<Address> = None;
        let mut device_count = 0_u32;

        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) => {
                    device_count = device_count.saturating_add(1);
                    if first_ds18.is_none() && address.family_code() == ds18b20::FAMILY_CODE {
                        first_ds18 = Some(address);
                    }
                }
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        self.ds18_address = first_ds18;

        match self.ds18_address {
            Some(address) => info!(
                "DS18B20 ready on GPIO{} ({} one-wire device(s), using {:?})",
                DS18B20_PIN, device_count, address
            ),
            None => warn!(
                "no DS18B20 found on GPIO{} ({} one-wire device(s) detected)",
                DS18B20_PIN, device_count
            ),
        }
    }

    fn read_temperature_c(&mut self) -> Option<f32> {
        if self.ds18_address.is_none() {
            self.refresh_ds18_address();
        }

        let address = self.ds18_address?;
        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {:?}: {err:?}", address);
                self.ds18_address = None;
                return None;
            }
        };

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            self.ds18_address = None;
            return None;
        }

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => Some(data.temperature),
            Err(err) => {
                warn!("failed to read DS18B20 data: {err:?}");
                self.ds18_address = None;
                None
            }
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let mut sensors =
        SensorSuite::new(pins.gpio4.downgrade()).context("failed to initialize DS18B20 bus")?;
    let reset_button = PinDriver::input(pins.gpio35).context("failed to configure reset button")?;
    let mut reset_press = LongPress::new(reset_button.is_high());

    let config = ProvisioningConfig::default();
    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition.clone()))
        .context("failed to initialize wifi driver")?;
    let radio = EspRadio::new(wifi, config.ap_address);
    let storage = NvsStorage::open(nvs_partition);

    let mut supervisor = ConnectionSupervisor::new(
        config,
        radio,
        storage,
        PortalPages::load(&EmbeddedAssets),
    );
    supervisor.settle(monotonic_ms, || {
        thread::sleep(Duration::from_millis(SETTLE_POLL_MS))
    });
    let _sntp = if supervisor.state() == SupervisorState::Joined {
        disable_wifi_power_save();
        match EspSntp::new_default() {
            Ok(sntp) => {
                info!("SNTP initialized");
                Some(sntp)
            }
            Err(err) => {
                warn!("failed to start SNTP: {err:?}");
                None
            }
        }
    } else {
        None
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let (exchange_tx, exchange_rx) = mpsc::sync_channel(HTTP_QUEUE_DEPTH);
    // Keep the server alive for the program lifetime.
    let _server = create_http_server(exchange_tx)?;
    info!(
        "temperature sensor running (reset button on GPIO{RESET_BUTTON_PIN}, state {})",
        supervisor.state().as_str()
    );

    let mut next_reading_ms = 0_u64;
    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();

        if let Some(SupervisorAction::Restart { reason }) = supervisor.tick(now_ms) {
            warn!("restarting device: {}", reason.as_str());
            supervisor.shutdown();
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }

        serve_http(&mut supervisor, &exchange_rx, now_ms);
        supervisor.service_portal();

        if reset_press.update(reset_button.is_high(), now_ms) {
            warn!("reset button held; clearing wifi settings and temperature log");
            supervisor.factory_reset(now_ms);
        }

        if now_ms >= next_reading_ms {
            next_reading_ms = now_ms + SENSOR_INTERVAL_MS;
            match sensors.read_temperature_c() {
                Some(temp_c) => {
                    info!("[DS18B20] Temperature: {temp_c:.2}°C");
                    supervisor.record_reading(Utc::now(), temp_c);
                }
                None => warn!("temperature reading unavailable"),
            }
        }

        thread::sleep(Duration::from_millis(LOOP_INTERVAL_MS));
    }
}

fn serve_http<D: NetworkDriver, S: RecordStorage>(
    supervisor: &mut ConnectionSupervisor<D, S>,
    exchanges: &Receiver<HttpExchange>,
    now_ms: u64,
) {
    let budget = supervisor.config().http_budget;
    for exchange in exchanges.try_iter().take(budget) {
        let response = supervisor.handle_request(&exchange.request, now_ms);
        // The handler may have timed out and dropped its end.
        let _ = exchange.reply.send(response);
    }
}

fn create_http_server(
    exchanges: SyncSender<HttpExchange>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for (method, portal_method) in [
        (Method::Get, tempsensor_common::Method::Get),
        (Method::Post, tempsensor_common::Method::Post),
    ] {
        let exchanges = exchanges.clone();
        server.fn_handler::<anyhow::Error, _>("/*", method, move |mut req| {
            let uri = req.uri().to_string();
            let body = if portal_method == tempsensor_common::Method::Post {
                read_request_body(&mut req)?
            } else {
                Vec::new()
            };

            let (reply_tx, reply_rx) = mpsc::channel();
            let exchange = HttpExchange {
                request: PortalRequest::new(portal_method, &uri, body),
                reply: reply_tx,
            };
            if exchanges.try_send(exchange).is_err() {
                return write_text(req, 503, "Device busy");
            }

            match reply_rx.recv_timeout(HTTP_REPLY_TIMEOUT) {
                Ok(Some(response)) => write_response(req, &response),
                Ok(None) => write_text(req, 404, "Not found"),
                Err(_) => write_text(req, 503, "Device busy"),
            }
        })?;
    }

    Ok(server)
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_response(
    req: Request<&mut EspHttpConnection<'_>>,
    response: &PortalResponse,
) -> anyhow::Result<()> {
    let mut headers = vec![("Content-Type", response.content_type)];
    if let Some(location) = response.location.as_deref() {
        headers.push(("Location", location));
    }

    req.into_response(response.status, None, &headers)?
        .write_all(response.body.as_bytes())?;
    Ok(())
}

fn write_text(
    req: Request<&mut EspHttpConnection<'_>>,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "text/plain; charset=utf-8")],
    )?
    .write_all(message.as_bytes())?;
    Ok(())
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}
