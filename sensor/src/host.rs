use std::{
    future::Future,
    io,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderValue, Method as HttpMethod, Request, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use tempsensor_common::{
    AccessPointSettings, AssetSource, ConnectionSupervisor, Credential, DirStorage, DriverError,
    LinkStatus, Method, NetworkDriver, Personality, PortalPages, PortalRequest, PortalResponse,
    ProvisioningConfig, RecordStorage, RestartReason, SupervisorAction,
};

use crate::assets::EmbeddedAssets;

const MAX_HTTP_BODY: usize = 4096;
const HTTP_QUEUE_DEPTH: usize = 8;
const LOOP_INTERVAL_MS: u64 = 50;
const SENSOR_INTERVAL_MS: u64 = 3_000;

struct PortalExchange {
    request: PortalRequest,
    reply: oneshot::Sender<Option<PortalResponse>>,
}

#[derive(Clone)]
struct AppState {
    exchanges: mpsc::Sender<PortalExchange>,
    web_root: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// The network the simulated radio can see. Without `SIM_WIFI_SSID` every
/// join succeeds.
#[derive(Debug, Clone)]
struct SimulatedNetwork {
    ssid: Option<String>,
    password: String,
    join_delay_ms: u64,
}

impl SimulatedNetwork {
    fn from_env() -> Self {
        Self {
            ssid: std::env::var("SIM_WIFI_SSID")
                .ok()
                .filter(|ssid| !ssid.is_empty()),
            password: std::env::var("SIM_WIFI_PASS").unwrap_or_default(),
            join_delay_ms: env_parse("SIM_JOIN_DELAY_MS", 1_500),
        }
    }

    fn accepts(&self, credential: &Credential) -> bool {
        match &self.ssid {
            Some(ssid) => {
                *ssid == credential.network_identifier && self.password == credential.secret
            }
            None => true,
        }
    }
}

struct SimulatedRadio {
    network: SimulatedNetwork,
    personality: Option<Personality>,
    join: Option<(Credential, u64)>,
    fallback_ap_address: Ipv4Addr,
}

impl SimulatedRadio {
    fn new(network: SimulatedNetwork, fallback_ap_address: Ipv4Addr) -> Self {
        Self {
            network,
            personality: None,
            join: None,
            fallback_ap_address,
        }
    }
}

impl NetworkDriver for SimulatedRadio {
    fn set_personality(&mut self, personality: &Personality) -> Result<(), DriverError> {
        debug!(mode = personality.as_str(), "simulated radio switching mode");
        self.join = None;
        self.personality = Some(personality.clone());
        Ok(())
    }

    fn join(&mut self, credential: &Credential) -> Result<(), DriverError> {
        if credential.network_identifier.len() > 32 {
            return Err(DriverError::InvalidSsid);
        }
        if credential.secret.len() > 64 {
            return Err(DriverError::InvalidSecret);
        }
        self.join = Some((credential.clone(), monotonic_ms()));
        Ok(())
    }

    fn connection_status(&self) -> LinkStatus {
        match &self.join {
            Some((credential, started_ms))
                if self.network.accepts(credential)
                    && monotonic_ms().saturating_sub(*started_ms) >= self.network.join_delay_ms =>
            {
                LinkStatus::Connected
            }
            _ => LinkStatus::Disconnected,
        }
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        (self.connection_status() == LinkStatus::Connected).then_some(Ipv4Addr::LOCALHOST)
    }

    fn access_point_address(&self) -> Ipv4Addr {
        match &self.personality {
            Some(Personality::AccessPoint(AccessPointSettings { address, .. })) => *address,
            _ => self.fallback_ap_address,
        }
    }
}

/// Portal pages from `sensor/web`, falling back to the compiled-in copies.
struct HostAssets {
    web: DirStorage,
}

impl AssetSource for HostAssets {
    fn load_asset(&self, name: &str) -> Option<String> {
        self.web
            .load_asset(name)
            .or_else(|| EmbeddedAssets.load_asset(name))
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("TEMPSENSOR_DATA_DIR").unwrap_or_else(|_| ".tempsensor".into());
    let http_port = env_parse("TEMPSENSOR_HTTP_PORT", 8080_u16);
    let config = ProvisioningConfig {
        ap_address: Ipv4Addr::LOCALHOST,
        dns_port: env_parse("TEMPSENSOR_DNS_PORT", 5353_u16),
        ..ProvisioningConfig::default()
    };

    let web_root = PathBuf::from(format!("{}/web", env!("CARGO_MANIFEST_DIR")));
    let pages = PortalPages::load(&HostAssets {
        web: DirStorage::new(&web_root),
    });

    let (exchange_tx, mut exchange_rx) = mpsc::channel(HTTP_QUEUE_DEPTH);
    let app = Router::new()
        .fallback(handle_request)
        .layer(DefaultBodyLimit::max(MAX_HTTP_BODY))
        .with_state(AppState {
            exchanges: exchange_tx,
            web_root: Arc::new(web_root),
        });

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind sensor server at {addr}"))?;
    info!("sensor listening on http://{addr}");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("sensor http server stopped: {err}");
        }
    });

    let network = SimulatedNetwork::from_env();
    let mut storage = DirStorage::new(&data_dir);
    let mut shutdown = Box::pin(tokio::signal::ctrl_c());

    loop {
        let radio = SimulatedRadio::new(network.clone(), config.ap_address);
        let mut supervisor =
            ConnectionSupervisor::new(config.clone(), radio, storage, pages.clone());
        supervisor.boot(monotonic_ms());

        let outcome = drive(&mut supervisor, &mut exchange_rx, &mut shutdown).await;
        supervisor.shutdown();

        let Some(reason) = outcome else {
            info!("sensor shutting down");
            return Ok(());
        };
        info!(reason = reason.as_str(), "simulated restart");
        let (_, next_storage) = supervisor.into_parts();
        storage = next_storage;
    }
}

/// Runs one boot of the device; returns the restart reason, or `None` on
/// shutdown.
async fn drive<D, S, F>(
    supervisor: &mut ConnectionSupervisor<D, S>,
    exchanges: &mut mpsc::Receiver<PortalExchange>,
    shutdown: &mut F,
) -> Option<RestartReason>
where
    D: NetworkDriver,
    S: RecordStorage,
    F: Future<Output = io::Result<()>> + Unpin,
{
    let mut interval = tokio::time::interval(Duration::from_millis(LOOP_INTERVAL_MS));
    let mut next_reading_ms = 0_u64;
    let mut reading: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut *shutdown => return None,
        }

        let now_ms = monotonic_ms();
        if let Some(SupervisorAction::Restart { reason }) = supervisor.tick(now_ms) {
            return Some(reason);
        }

        for _ in 0..supervisor.config().http_budget {
            let Ok(exchange) = exchanges.try_recv() else {
                break;
            };
            let response = supervisor.handle_request(&exchange.request, now_ms);
            let _ = exchange.reply.send(response);
        }

        supervisor.service_portal();

        if now_ms >= next_reading_ms {
            next_reading_ms = now_ms + SENSOR_INTERVAL_MS;
            reading = reading.saturating_add(1);

            // Stands in for the DS18B20 on the device.
            let temperature_c = 21.0 + ((reading % 8) as f32 * 0.1);
            let status = supervisor.status();
            info!(
                temperature_c = %format!("{temperature_c:.2}"),
                state = status.state,
                ip = %status.ip_address,
                "temperature reading"
            );
            supervisor.record_reading(Utc::now(), temperature_c);
        }
    }
}

async fn handle_request(
    State(state): State<AppState>,
    method: HttpMethod,
    uri: Uri,
    body: Bytes,
) -> Response {
    let portal_method = Method::parse(method.as_str());
    let target = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());

    let (reply_tx, reply_rx) = oneshot::channel();
    let exchange = PortalExchange {
        request: PortalRequest::new(portal_method, &target, body.to_vec()),
        reply: reply_tx,
    };
    if state.exchanges.send(exchange).await.is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Device is restarting");
    }

    match reply_rx.await {
        Ok(Some(response)) => portal_response(response),
        Ok(None) if method == HttpMethod::GET => serve_static(&state.web_root, uri).await,
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "Device is restarting"),
    }
}

async fn serve_static(web_root: &Path, uri: Uri) -> Response {
    let request = match Request::builder().uri(uri).body(Body::empty()) {
        Ok(request) => request,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    match ServeDir::new(web_root).try_call(request).await {
        Ok(response) => response.map(Body::new),
        Err(err) => {
            warn!("failed to serve static file: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read file")
        }
    }
}

fn portal_response(response: PortalResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut reply = (
        status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body,
    )
        .into_response();

    if let Some(location) = response.location {
        match HeaderValue::from_str(&location) {
            Ok(value) => {
                reply.headers_mut().insert(header::LOCATION, value);
            }
            Err(err) => warn!("dropping invalid redirect target `{location}`: {err}"),
        }
    }
    reply
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
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
