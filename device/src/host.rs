use std::{
    io::{BufRead, ErrorKind},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, MutexGuard,
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use serde::de::DeserializeOwned;
use tokio::{net::TcpListener, runtime::Handle, task::JoinHandle};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use connectivity_common::{
    classifier::{LONG_PRESS_MS, TRIPLE_CLICK_COUNT},
    provisioning::{http_status, SETUP_PAGE},
    sim::{SimulatedNetwork, SimulatedRadio},
    store::upsert_into,
    ButtonClassifier, ButtonFlags, ButtonLine, Collaborators, CredentialList, CredentialStore,
    DevicePlatform, DisplaySurface, Error, Led, MqttTransport, NetworkSubmission, Orchestrator,
    Provisioner, Qos, RuntimeConfig, SessionConfig, SessionEvent, SessionEventSink, SetupPortal,
    TransportError,
};

const DEFAULT_BROKER_PORT: u16 = 1883;
const DEFAULT_HTTP_PORT: u16 = 8080;
const CLIENT_CHANNEL_CAPACITY: usize = 64;
const CLICK_HOLD_MS: u64 = 120;
const CLICK_GAP_MS: u64 = 250;
const GESTURE_SPACING_MS: u64 = 4_000;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data = DataDir::from_env();
    let mut runtime = data.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });
    apply_session_overrides(&mut runtime.session, |name| std::env::var(name).ok());
    runtime.sanitize();

    let networks = data
        .load_radio()
        .await
        .context("failed to load simulated radio environment")?;
    if networks.is_empty() {
        warn!(
            "no simulated networks in {}, the device will stay offline",
            data.radio_path().display()
        );
    }

    let flags = Arc::new(ButtonFlags::new());
    spawn_button_reader(flags.clone())?;

    let restart = Arc::new(AtomicBool::new(false));
    let collaborators = Collaborators {
        store: Arc::new(data.credential_store()),
        display: Arc::new(ConsoleDisplay),
        platform: Arc::new(HostPlatform {
            restart: restart.clone(),
        }),
        portal: Arc::new(HttpSetupPortal::new(Handle::current(), portal_addr())),
    };
    let radio = SimulatedRadio::new(networks);
    let transport = RumqttTransport::new(Handle::current());

    let keep_running = Arc::new(AtomicBool::new(true));
    let mut worker: JoinHandle<anyhow::Result<()>> = {
        let keep_running = keep_running.clone();
        tokio::task::spawn_blocking(move || {
            let orchestrator = Orchestrator::boot(
                runtime,
                Box::new(radio),
                Box::new(transport),
                collaborators,
                flags,
            )
            .context("device boot failed")?;
            info!("device up: {:?}", orchestrator.outcome());

            orchestrator.run(|| {
                keep_running.load(Ordering::Acquire) && !restart.load(Ordering::Acquire)
            });
            if restart.load(Ordering::Acquire) {
                info!("restart requested, exiting so the supervisor can start a fresh process");
            }
            orchestrator.shutdown();
            Ok(())
        })
    };

    let joined = tokio::select! {
        joined = &mut worker => joined,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("ctrl-c received, shutting down");
            keep_running.store(false, Ordering::Release);
            worker.await
        }
    };
    joined.context("device task panicked")?
}

fn apply_session_overrides(session: &mut SessionConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(uri) = lookup("MQTT_URI") {
        session.broker_uri = uri;
    }
    if let Some(user) = lookup("MQTT_USER") {
        session.username = user;
    }
    if let Some(pass) = lookup("MQTT_PASS") {
        session.password = pass;
    }
    if let Some(client_id) = lookup("MQTT_CLIENT_ID") {
        session.client_id = client_id;
    }
}

#[derive(Debug, Clone)]
struct DataDir {
    root: PathBuf,
}

impl DataDir {
    fn from_env() -> Self {
        let root = std::env::var("CONNECTIVITY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.connectivity"));
        Self { root }
    }

    fn radio_path(&self) -> PathBuf {
        self.root.join("radio.json")
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        read_json_or_default(&self.root.join("runtime.json")).await
    }

    async fn load_radio(&self) -> anyhow::Result<Vec<SimulatedNetwork>> {
        read_json_or_default(&self.radio_path()).await
    }

    fn credential_store(&self) -> FileCredentialStore {
        FileCredentialStore::new(self.root.join("credentials.json"))
    }
}

async fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> anyhow::Result<T> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice::<T>(&raw)
            .with_context(|| format!("failed to parse {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Saved networks as a pretty-printed JSON array.
#[derive(Debug)]
struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> connectivity_common::Result<CredentialList> {
        match std::fs::read(&self.path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|err| self.storage_error(err)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(CredentialList::default()),
            Err(err) => Err(self.storage_error(err)),
        }
    }

    fn write(&self, list: &CredentialList) -> connectivity_common::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| self.storage_error(err))?;
        }
        let payload = serde_json::to_vec_pretty(list).map_err(|err| self.storage_error(err))?;
        std::fs::write(&self.path, payload).map_err(|err| self.storage_error(err))
    }

    fn storage_error(&self, err: impl std::fmt::Display) -> Error {
        Error::Storage(format!("{}: {err}", self.path.display()))
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> connectivity_common::Result<CredentialList> {
        let _guard = self.lock();
        self.read()
    }

    fn upsert(&self, ssid: &str, pass: &str) -> connectivity_common::Result<bool> {
        let _guard = self.lock();
        let mut list = self.read()?;
        let stored = upsert_into(&mut list, ssid, pass)?;
        if stored {
            self.write(&list)?;
        }
        Ok(stored)
    }

    fn remove(&self, ssid: &str) -> connectivity_common::Result<bool> {
        let _guard = self.lock();
        let mut list = self.read()?;
        let removed = list.remove(ssid);
        if removed {
            self.write(&list)?;
        }
        Ok(removed)
    }

    fn clear(&self) -> connectivity_common::Result<()> {
        let _guard = self.lock();
        self.write(&CredentialList::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BrokerAddress {
    host: String,
    port: u16,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
enum BrokerUriError {
    #[error("broker uri has no host")]
    MissingHost,
    #[error("unsupported broker scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("invalid broker port `{0}`")]
    InvalidPort(String),
}

/// Accepts `mqtt://host[:port]`, `tcp://host[:port]` or a bare `host[:port]`.
fn parse_broker_uri(uri: &str) -> Result<BrokerAddress, BrokerUriError> {
    let uri = uri.trim();
    let authority = match uri.split_once("://") {
        Some(("mqtt" | "tcp", rest)) => rest,
        Some((scheme, _)) => return Err(BrokerUriError::UnsupportedScheme(scheme.to_string())),
        None => uri,
    };
    let authority = authority.trim_end_matches('/');

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| BrokerUriError::InvalidPort(port.to_string()))?;
            (host, port)
        }
        None => (authority, DEFAULT_BROKER_PORT),
    };

    if host.is_empty() {
        return Err(BrokerUriError::MissingHost);
    }
    Ok(BrokerAddress {
        host: host.to_string(),
        port,
    })
}

fn mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn mqtt_options(config: &SessionConfig) -> Result<MqttOptions, BrokerUriError> {
    let address = parse_broker_uri(&config.broker_uri)?;
    let mut options = MqttOptions::new(config.client_id.clone(), address.host, address.port);

    let keep_alive = if config.keep_alive.enabled {
        Duration::from_secs(u64::from(config.keep_alive.keepalive_sec))
    } else {
        Duration::ZERO
    };
    options.set_keep_alive(keep_alive);
    options.set_clean_session(config.clean_session);
    if !config.username.is_empty() {
        options.set_credentials(config.username.clone(), config.password.clone());
    }
    if let Some(will) = &config.last_will {
        options.set_last_will(LastWill::new(
            will.topic.clone(),
            will.message.clone(),
            mqtt_qos(will.qos),
            will.retain,
        ));
    }
    Ok(options)
}

/// Broker transport over rumqttc. The event loop runs on the tokio runtime;
/// its events are handed to a plain thread because session handlers block.
struct RumqttTransport {
    runtime: Handle,
    options: Option<MqttOptions>,
    retry_delay: Option<Duration>,
    events: Option<mpsc::Sender<SessionEvent>>,
    client: Option<AsyncClient>,
    poller: Option<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
}

impl RumqttTransport {
    fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            options: None,
            retry_delay: None,
            events: None,
            client: None,
            poller: None,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client
            .as_ref()
            .ok_or_else(|| TransportError::new("mqtt client not started"))
    }

    fn abort_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

impl MqttTransport for RumqttTransport {
    fn open(&mut self, config: &SessionConfig, sink: SessionEventSink) -> Result<(), TransportError> {
        let options = mqtt_options(config).map_err(|err| TransportError::new(err.to_string()))?;

        let (events, inbox) = mpsc::channel::<SessionEvent>();
        thread::Builder::new()
            .name("mqtt-events".to_string())
            .spawn(move || {
                for event in inbox {
                    sink.dispatch(event);
                }
                debug!("mqtt event thread finished");
            })
            .map_err(|err| TransportError::new(format!("mqtt event thread: {err}")))?;

        self.options = Some(options);
        self.retry_delay = (!config.disable_auto_reconnect)
            .then(|| Duration::from_millis(config.reconnect_timeout_ms));
        self.events = Some(events);
        Ok(())
    }

    fn start(&mut self) -> Result<(), TransportError> {
        let options = self
            .options
            .clone()
            .ok_or_else(|| TransportError::new("mqtt transport not opened"))?;
        let events = self
            .events
            .clone()
            .ok_or_else(|| TransportError::new("mqtt transport not opened"))?;

        self.abort_poller();
        self.stopping.store(false, Ordering::Release);

        let (client, eventloop) = AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY);
        self.poller = Some(self.runtime.spawn(poll_broker(
            eventloop,
            events,
            self.stopping.clone(),
            self.retry_delay,
        )));
        self.client = Some(client);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        self.stopping.store(true, Ordering::Release);
        self.client()?
            .try_disconnect()
            .map_err(|err| TransportError::new(format!("mqtt disconnect: {err}")))
    }

    fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        self.client()?
            .try_subscribe(topic, mqtt_qos(qos))
            .map_err(|err| TransportError::new(format!("mqtt subscribe `{topic}`: {err}")))
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retain: bool,
    ) -> Result<Option<u32>, TransportError> {
        self.client()?
            .try_publish(topic, mqtt_qos(qos), retain, payload.to_vec())
            .map_err(|err| TransportError::new(format!("mqtt publish `{topic}`: {err}")))?;
        // rumqttc assigns packet ids inside the event loop.
        Ok(None)
    }

    fn close(&mut self) {
        self.stopping.store(true, Ordering::Release);
        self.abort_poller();
        self.client = None;
        self.events = None;
        self.options = None;
    }
}

async fn poll_broker(
    mut eventloop: EventLoop,
    events: mpsc::Sender<SessionEvent>,
    stopping: Arc<AtomicBool>,
    retry_delay: Option<Duration>,
) {
    let forward = |event: SessionEvent| {
        if events.send(event).is_err() {
            debug!("mqtt event dropped: transport closed");
        }
    };
    let mut connected = false;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if stopping.load(Ordering::Acquire) {
                    continue;
                }
                debug!("mqtt connack: {:?}", ack.code);
                connected = true;
                forward(SessionEvent::Connected);
            }
            Ok(Event::Incoming(Incoming::Publish(message))) => {
                forward(SessionEvent::Message {
                    topic: message.topic,
                    payload: message.payload.to_vec(),
                });
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                if connected {
                    forward(SessionEvent::Disconnected);
                }
                break;
            }
            Ok(_) => {}
            Err(err) => {
                if connected {
                    connected = false;
                    forward(SessionEvent::Disconnected);
                }
                if stopping.load(Ordering::Acquire) {
                    break;
                }
                warn!("mqtt poll error: {err}");
                match retry_delay {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => break,
                }
            }
        }
    }
    debug!("mqtt event loop finished");
}

struct ConsoleDisplay;

impl DisplaySurface for ConsoleDisplay {
    fn show_text(&self, text: &str) {
        info!(target: "display", "{text}");
    }

    fn set_indicator(&self, led: Led) {
        info!(target: "display", "indicator {led:?}");
    }

    fn set_led(&self, led: Led, on: bool) {
        info!(target: "display", "led {led:?} {}", if on { "on" } else { "off" });
    }
}

struct HostPlatform {
    restart: Arc<AtomicBool>,
}

impl DevicePlatform for HostPlatform {
    fn restart(&self) {
        self.restart.store(true, Ordering::Release);
    }
}

fn portal_addr() -> SocketAddr {
    let port = std::env::var("CONNECTIVITY_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_HTTP_PORT);
    SocketAddr::from(([0, 0, 0, 0], port))
}

/// Setup page and credential endpoints, served on the tokio runtime once the
/// setup access point is up.
struct HttpSetupPortal {
    runtime: Handle,
    addr: SocketAddr,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl HttpSetupPortal {
    fn new(runtime: Handle, addr: SocketAddr) -> Self {
        Self {
            runtime,
            addr,
            server: Mutex::new(None),
        }
    }

    fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = std::net::TcpListener::bind(self.addr)?;
        listener.set_nonblocking(true)?;
        let _entered = self.runtime.enter();
        TcpListener::from_std(listener)
    }
}

impl SetupPortal for HttpSetupPortal {
    fn start(&self, provisioner: Provisioner) -> connectivity_common::Result<()> {
        let mut server = self
            .server
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if server.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("setup portal already running");
            return Ok(());
        }

        let listener = self
            .bind()
            .map_err(|err| Error::Transport(format!("setup portal on {}: {err}", self.addr)))?;
        let app = portal_router(provisioner);
        let addr = self.addr;
        *server = Some(self.runtime.spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!("setup portal on {addr} stopped: {err}");
            }
        }));
        info!("setup portal listening on http://{addr}");
        Ok(())
    }
}

fn portal_router(provisioner: Provisioner) -> Router {
    Router::new()
        .route("/", get(handle_setup_page))
        .route("/set", post(handle_set_form))
        .route(
            "/api/network",
            get(handle_get_network).put(handle_put_network),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(provisioner)
}

fn rejection_status(err: &Error) -> StatusCode {
    StatusCode::from_u16(http_status(err)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Saves the submission off the async workers, then schedules the restart.
async fn provision(
    provisioner: Provisioner,
    submission: NetworkSubmission,
) -> Result<(), (StatusCode, String)> {
    let worker = provisioner.clone();
    match tokio::task::spawn_blocking(move || worker.submit(&submission)).await {
        Ok(Ok(())) => {
            let _restart = tokio::task::spawn_blocking(move || provisioner.restart());
            Ok(())
        }
        Ok(Err(err)) => {
            warn!("provisioning rejected: {err}");
            Err((rejection_status(&err), err.to_string()))
        }
        Err(err) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("provisioning task failed: {err}"),
        )),
    }
}

async fn handle_setup_page() -> Html<&'static str> {
    Html(SETUP_PAGE)
}

async fn handle_set_form(
    State(provisioner): State<Provisioner>,
    Form(submission): Form<NetworkSubmission>,
) -> Response {
    match provision(provisioner, submission).await {
        Ok(()) => "Saved! Rebooting...".into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_get_network(State(provisioner): State<Provisioner>) -> Response {
    match tokio::task::spawn_blocking(move || provisioner.view()).await {
        Ok(Ok(view)) => Json(view).into_response(),
        Ok(Err(err)) => (
            rejection_status(&err),
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn handle_put_network(
    State(provisioner): State<Provisioner>,
    Json(submission): Json<NetworkSubmission>,
) -> Response {
    let ssid = submission.ssid.clone();
    match provision(provisioner, submission).await {
        Ok(()) => Json(serde_json::json!({ "saved": ssid, "restarting": true })).into_response(),
        Err((status, message)) => {
            (status, Json(serde_json::json!({ "error": message }))).into_response()
        }
    }
}

/// Line state replayed into the classifier, one edge per interrupt.
#[derive(Debug, Default)]
struct ScriptedLine {
    pending: bool,
    high: bool,
}

impl ButtonLine for ScriptedLine {
    fn take_pending(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }

    fn is_high(&self) -> bool {
        self.high
    }
}

/// Turns console commands into button edges on a synthetic clock.
struct SimulatedButton {
    classifier: ButtonClassifier,
    line: ScriptedLine,
    clock_us: u64,
    flags: Arc<ButtonFlags>,
}

impl SimulatedButton {
    fn new(flags: Arc<ButtonFlags>) -> Self {
        Self {
            classifier: ButtonClassifier::new(),
            line: ScriptedLine {
                pending: false,
                high: true,
            },
            clock_us: 0,
            flags,
        }
    }

    /// Returns false for commands it does not know.
    fn play(&mut self, command: &str) -> bool {
        match command {
            "long" => {
                self.advance(GESTURE_SPACING_MS);
                self.press(LONG_PRESS_MS);
            }
            "triple" => {
                self.advance(GESTURE_SPACING_MS);
                for _ in 0..TRIPLE_CLICK_COUNT {
                    self.press(CLICK_HOLD_MS);
                    self.advance(CLICK_GAP_MS);
                }
            }
            _ => return false,
        }
        true
    }

    fn press(&mut self, hold_ms: u64) {
        self.edge(false);
        self.advance(hold_ms);
        self.edge(true);
    }

    fn advance(&mut self, ms: u64) {
        self.clock_us = self.clock_us.saturating_add(ms * 1_000);
    }

    fn edge(&mut self, high: bool) {
        self.line.pending = true;
        self.line.high = high;
        self.classifier
            .service(&mut self.line, self.clock_us, &self.flags);
    }
}

fn spawn_button_reader(flags: Arc<ButtonFlags>) -> anyhow::Result<()> {
    let mut button = SimulatedButton::new(flags);
    thread::Builder::new()
        .name("button-stdin".to_string())
        .spawn(move || {
            info!("button: type `long` or `triple` and press enter");
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                let command = line.trim();
                if command.is_empty() {
                    continue;
                }
                if !button.play(command) {
                    warn!("unknown button command `{command}`");
                }
            }
        })
        .context("failed to spawn button reader")?;
    Ok(())
}
