use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use alarmctl_core::{AlarmEvent, Command, DeviceId, Observer};
use alarmctl_mqtt::{AlarmService, BrokerConfig, ServiceError};
use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dotenvy::dotenv;
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, TextEncoder};
use tokio::signal;
use tokio::sync::{mpsc, RwLock};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod models;

use models::*;

// Matches the panel's "reconnect" button: drop the link, wait, dial again
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct AppState {
    alarms: AlarmService,
    broker: Arc<RwLock<BrokerConfig>>,
    metrics: Arc<Metrics>,
}

struct Metrics {
    mqtt_connected: IntGauge,
    status_rx_total: IntCounter,
    unparsed_rx_total: IntCounter,
    connection_errors_total: IntCounter,
    commands_tx_total: IntCounter,
    alarms_active: IntGauge,
    alarm_state: IntGaugeVec, // label: device
    ws_clients: IntGauge,
}

impl Metrics {
    fn new() -> prometheus::Result<Arc<Self>> {
        let mqtt_connected = IntGauge::new("alarmctl_mqtt_connected", "MQTT connection status (1 connected, 0 otherwise)")?;
        let status_rx_total = IntCounter::new("alarmctl_status_messages_total", "Total siren status reports received")?;
        let unparsed_rx_total = IntCounter::new("alarmctl_unparsed_messages_total", "Total MQTT messages on unknown topics")?;
        let connection_errors_total = IntCounter::new("alarmctl_connection_errors_total", "Total broker connection and publish errors")?;
        let commands_tx_total = IntCounter::new("alarmctl_commands_published_total", "Total siren commands submitted to the broker")?;
        let alarms_active = IntGauge::new("alarmctl_alarms_active", "Number of sirens currently active")?;
        let alarm_state = IntGaugeVec::new(
            prometheus::Opts::new("alarmctl_alarm_active", "Siren state (1 active, 0 otherwise)"),
            &["device"],
        )?;
        let ws_clients = IntGauge::new("alarmctl_ws_clients", "Number of connected WebSocket clients")?;

        let registry = prometheus::default_registry();
        registry.register(Box::new(mqtt_connected.clone()))?;
        registry.register(Box::new(status_rx_total.clone()))?;
        registry.register(Box::new(unparsed_rx_total.clone()))?;
        registry.register(Box::new(connection_errors_total.clone()))?;
        registry.register(Box::new(commands_tx_total.clone()))?;
        registry.register(Box::new(alarms_active.clone()))?;
        registry.register(Box::new(alarm_state.clone()))?;
        registry.register(Box::new(ws_clients.clone()))?;

        Ok(Arc::new(Self {
            mqtt_connected,
            status_rx_total,
            unparsed_rx_total,
            connection_errors_total,
            commands_tx_total,
            alarms_active,
            alarm_state,
            ws_clients,
        }))
    }

    fn record(&self, event: &AlarmEvent, alarms: &AlarmService) {
        match event {
            AlarmEvent::ConnectionChanged(up) => self.mqtt_connected.set(i64::from(*up)),
            AlarmEvent::ConnectionError(_) => self.connection_errors_total.inc(),
            AlarmEvent::StatusReceived { device, active } => {
                self.status_rx_total.inc();
                self.alarm_state.with_label_values(&[&device.to_string()]).set(i64::from(*active));
            }
            AlarmEvent::UnparsedMessage { .. } => self.unparsed_rx_total.inc(),
        }
        self.sync_active(alarms);
    }

    fn sync_active(&self, alarms: &AlarmService) {
        for (device, state) in alarms.get_all() {
            self.alarm_state.with_label_values(&[&device.to_string()]).set(i64::from(state.active));
        }
        self.alarms_active.set(alarms.active_count() as i64);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing()?;

    let broker_cfg = BrokerConfig::from_env();
    let alarms = AlarmService::new();
    let metrics = Metrics::new().context("failed to register metrics")?;
    alarms.register(metrics_observer(metrics.clone(), alarms.clone()));
    alarms.register(Arc::new(log_event));

    if autoconnect_enabled() {
        info!(url = %broker_cfg.url, "Configuring MQTT client");
        if let Err(e) = alarms.connect(broker_cfg.clone()) {
            tracing::warn!(error = %e, "Initial broker connect failed");
        }
    }

    let state = AppState {
        alarms: alarms.clone(),
        broker: Arc::new(RwLock::new(broker_cfg)),
        metrics,
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/version", get(version))
        .route("/metrics", get(metrics_handler))
        // Alarm API
        .route("/api/alarms", get(api_get_alarms).post(api_set_all))
        .route("/api/alarms/:device_id", post(api_set_alarm))
        .route("/api/commands", post(api_command))
        // Broker connection
        .route("/api/connection", get(api_get_connection))
        .route("/api/connection/connect", post(api_connect))
        .route("/api/connection/disconnect", post(api_disconnect))
        .route("/api/connection/reconnect", post(api_reconnect))
        // Live feed
        .route("/ws/events", get(ws_events))
        .with_state(state);

    let addr: SocketAddr = std::env::var("ALARMCTL_HTTP_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .context("Invalid ALARMCTL_HTTP_ADDR")?;

    info!(%addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    alarms.disconnect();
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,alarmctl_mqtt=info,rumqttc=warn"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

fn autoconnect_enabled() -> bool {
    !matches!(
        std::env::var("ALARMCTL_AUTOCONNECT").as_deref(),
        Ok("0") | Ok("false") | Ok("no") | Ok("off")
    )
}

fn metrics_observer(metrics: Arc<Metrics>, alarms: AlarmService) -> Arc<dyn Observer> {
    Arc::new(move |event: &AlarmEvent| metrics.record(event, &alarms))
}

fn log_event(event: &AlarmEvent) {
    match event {
        AlarmEvent::ConnectionChanged(true) => info!("Connected to MQTT broker"),
        AlarmEvent::ConnectionChanged(false) => info!("Disconnected from MQTT broker"),
        AlarmEvent::ConnectionError(message) => tracing::warn!(%message, "Broker connection error"),
        AlarmEvent::StatusReceived { device, active } => info!(%device, active, "Siren status"),
        AlarmEvent::UnparsedMessage { topic, payload } => tracing::debug!(%topic, %payload, "Unhandled MQTT message"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn healthz() -> &'static str { "ok" }

async fn readyz(State(state): State<AppState>) -> StatusCode {
    if state.alarms.is_connected() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE }
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buf) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([(CONTENT_TYPE, encoder.format_type().to_string())], buf).into_response()
}

// ----- Alarm API -----

async fn api_get_alarms(State(state): State<AppState>) -> Json<AlarmsResponse> {
    Json(AlarmsResponse::from_service(&state.alarms))
}

async fn api_set_alarm(Path(device_id): Path<u64>, State(state): State<AppState>, Json(body): Json<SetAlarmRequest>) -> Response {
    match siren(device_id) {
        Ok(device) => run_command(&state, Command::Set { device, active: body.active }),
        Err(resp) => resp,
    }
}

fn siren(device_id: u64) -> Result<DeviceId, Response> {
    DeviceId::try_from(device_id)
        .map_err(|e| error_response(StatusCode::NOT_FOUND, e.to_string()))
}

async fn api_set_all(State(state): State<AppState>, Json(body): Json<SetAlarmRequest>) -> Response {
    run_command(&state, Command::SetAll(body.active))
}

async fn api_command(State(state): State<AppState>, Json(command): Json<Command>) -> Response {
    run_command(&state, command)
}

fn run_command(state: &AppState, command: Command) -> Response {
    match state.alarms.execute(command) {
        Ok(submitted) => {
            state.metrics.commands_tx_total.inc_by(submitted as u64);
            state.metrics.sync_active(&state.alarms);
            let body = CommandResponse { submitted, alarms: state.alarms.get_all() };
            (StatusCode::ACCEPTED, Json(body)).into_response()
        }
        Err(e) => error_response(error_status(&e), e.to_string()),
    }
}

// ----- Broker connection -----

async fn api_get_connection(State(state): State<AppState>) -> Json<ConnectionResponse> {
    let connection = state.alarms.connection_state();
    Json(ConnectionResponse {
        state: connection,
        connected: connection.is_connected(),
        broker_url: state.broker.read().await.url.clone(),
    })
}

async fn api_connect(State(state): State<AppState>, maybe_body: Option<Json<ConnectRequest>>) -> Response {
    let config = {
        let mut broker = state.broker.write().await;
        if let Some(url) = maybe_body.and_then(|Json(req)| req.url).filter(|u| !u.is_empty()) {
            broker.url = url;
        }
        broker.clone()
    };
    connect_response(&state, config)
}

async fn api_disconnect(State(state): State<AppState>) -> StatusCode {
    tracing::info!("Broker disconnect requested via API");
    state.alarms.disconnect();
    StatusCode::NO_CONTENT
}

async fn api_reconnect(State(state): State<AppState>) -> Response {
    tracing::info!("Broker reconnect requested via API");
    state.alarms.disconnect();
    tokio::time::sleep(RECONNECT_DELAY).await;
    let config = state.broker.read().await.clone();
    connect_response(&state, config)
}

fn connect_response(state: &AppState, config: BrokerConfig) -> Response {
    match state.alarms.connect(config) {
        Ok(()) => (StatusCode::ACCEPTED, Json(AlarmsResponse::from_service(&state.alarms))).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Broker connect rejected");
            error_response(error_status(&e), e.to_string())
        }
    }
}

fn error_status(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::NotConnected | ServiceError::AlreadyActive(_) => StatusCode::CONFLICT,
        ServiceError::InvalidUrl { .. } | ServiceError::UnsupportedScheme(_) | ServiceError::InvalidClientId => {
            StatusCode::BAD_REQUEST
        }
        ServiceError::NoRuntime => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

// ----- WebSocket events -----

async fn ws_events(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| events_ws_loop(state, socket))
}

async fn events_ws_loop(state: AppState, mut socket: WebSocket) {
    state.metrics.ws_clients.inc();
    tracing::info!("Event WebSocket client connected");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let observer = state.alarms.register(frame_forwarder(state.alarms.clone(), tx));

    if send_frame(&mut socket, &EventFrame::greeting(&state.alarms)).await {
        loop {
            tokio::select! {
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("Event WebSocket client disconnected gracefully");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(?e, "Event WebSocket error reading message");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if !send_frame(&mut socket, &frame).await {
                        tracing::info!("Event WebSocket client disconnected during send");
                        break;
                    }
                }
            }
        }
    }

    state.alarms.unregister(observer);
    state.metrics.ws_clients.dec();
    tracing::info!("Event WebSocket connection closed");
}

// Snapshot is taken while the event is delivered, not when the frame goes out.
fn frame_forwarder(alarms: AlarmService, tx: mpsc::UnboundedSender<EventFrame>) -> Arc<dyn Observer> {
    Arc::new(move |event: &AlarmEvent| {
        let _ = tx.send(EventFrame::event(event.clone(), &alarms));
    })
}

async fn send_frame(socket: &mut WebSocket, frame: &EventFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode event frame");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alarmctl_mqtt::ConnectionState;

    #[test]
    fn rejected_commands_map_to_conflict() {
        assert_eq!(error_status(&ServiceError::NotConnected), StatusCode::CONFLICT);
        assert_eq!(
            error_status(&ServiceError::AlreadyActive(ConnectionState::Connected)),
            StatusCode::CONFLICT
        );
    }

    #[tokio::test]
    async fn event_frames_carry_the_state_at_delivery() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let alarms = AlarmService::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        alarms.register(frame_forwarder(alarms.clone(), tx));

        let config = BrokerConfig {
            url: format!("mqtt://127.0.0.1:{port}"),
            client_id: "alarmctl-server-test".into(),
            reconnect_backoff_ms: 10,
            max_retries: 1,
            ..BrokerConfig::default()
        };
        alarms.connect(config).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while alarms.connection_state() != ConnectionState::GivenUp {
            assert!(std::time::Instant::now() < deadline, "still {}", alarms.connection_state());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.event, Some(AlarmEvent::ConnectionError(_))));
        assert_eq!(first.alarms.connection, ConnectionState::Retrying { attempt: 1 });

        let mut last = first;
        while let Ok(frame) = rx.try_recv() {
            last = frame;
        }
        assert_eq!(last.event, Some(AlarmEvent::ConnectionChanged(false)));
        assert_eq!(last.alarms.connection, ConnectionState::GivenUp);
    }

    #[test]
    fn siren_ids_outside_the_panel_are_not_found() {
        assert!(matches!(siren(4), Ok(d) if d.get() == 4));
        for raw in [0, 5, 255, 300, u64::MAX] {
            let Err(resp) = siren(raw) else { panic!("id {raw} accepted") };
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "id {raw}");
        }
    }

    #[test]
    fn bad_broker_settings_map_to_bad_request() {
        let invalid = ServiceError::InvalidUrl { url: "x".into(), reason: "relative".into() };
        assert_eq!(error_status(&invalid), StatusCode::BAD_REQUEST);
        assert_eq!(error_status(&ServiceError::UnsupportedScheme("http".into())), StatusCode::BAD_REQUEST);
        assert_eq!(error_status(&ServiceError::InvalidClientId), StatusCode::BAD_REQUEST);
    }
}
