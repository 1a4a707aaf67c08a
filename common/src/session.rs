use std::{
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    config::SessionConfig,
    error::{Error, Result, TransportError},
    event_bits::EventBits,
    types::{Qos, SessionStatus},
};

pub const BIT_CONNECTED: u32 = 1 << 0;
pub const BIT_FAIL: u32 = 1 << 1;

pub const MAX_TOPIC_BYTES: usize = 127;
pub const MAX_PAYLOAD_BYTES: usize = 255;

const DEINIT_STOP_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
}

/// Broker client seam. Events go through the `SessionEventSink` handed to
/// `open`, from the transport's own context.
pub trait MqttTransport: Send {
    fn open(
        &mut self,
        config: &SessionConfig,
        sink: SessionEventSink,
    ) -> core::result::Result<(), TransportError>;
    fn start(&mut self) -> core::result::Result<(), TransportError>;
    fn stop(&mut self) -> core::result::Result<(), TransportError>;
    fn subscribe(&mut self, topic: &str, qos: Qos) -> core::result::Result<(), TransportError>;
    /// Returns the message id when the transport assigns one up front.
    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retain: bool,
    ) -> core::result::Result<Option<u32>, TransportError>;
    fn close(&mut self);
}

pub trait SessionObserver: Send + Sync {
    fn on_status(&self, text: &str, status: SessionStatus);

    fn on_message(&self, _topic: &str, _payload: &str) {}

    /// Runs after the topic table is subscribed on every (re)connect.
    fn on_connected(&self, _session: &SessionManager) {}
}

pub trait TopicHandler: Send + Sync {
    fn handle(&self, session: &SessionManager, payload: &str);
}

impl<F> TopicHandler for F
where
    F: Fn(&SessionManager, &str) + Send + Sync,
{
    fn handle(&self, session: &SessionManager, payload: &str) {
        self(session, payload)
    }
}

/// Ordered (topic, handler) routes. Exact, case-sensitive, first match wins.
#[derive(Default)]
pub struct TopicTable {
    routes: Vec<(String, Box<dyn TopicHandler>)>,
}

impl TopicTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, topic: impl Into<String>, handler: impl TopicHandler + 'static) -> Self {
        self.routes.push((topic.into(), Box::new(handler)));
        self
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|(topic, _)| topic.as_str())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn dispatch(&self, session: &SessionManager, topic: &str, payload: &str) -> bool {
        match self.routes.iter().find(|(route, _)| route == topic) {
            Some((_, handler)) => {
                handler.handle(session, payload);
                true
            }
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct SessionEventSink {
    inner: Weak<SessionInner>,
}

impl SessionEventSink {
    pub fn dispatch(&self, event: SessionEvent) {
        match self.inner.upgrade() {
            Some(inner) => SessionManager { inner }.handle_event(event),
            None => debug!("dropping session event: manager released"),
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    connected: bool,
    started: bool,
    initialized: bool,
}

struct SessionInner {
    config: SessionConfig,
    transport: Mutex<Option<Box<dyn MqttTransport>>>,
    state: Mutex<SessionState>,
    bits: EventBits,
    observer: Arc<dyn SessionObserver>,
    topics: TopicTable,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn init(
        config: SessionConfig,
        mut transport: Box<dyn MqttTransport>,
        observer: Arc<dyn SessionObserver>,
        topics: TopicTable,
    ) -> Result<Self> {
        if config.broker_uri.trim().is_empty() {
            return Err(Error::InvalidArgument("broker address is empty"));
        }

        let manager = Self {
            inner: Arc::new(SessionInner {
                config,
                transport: Mutex::new(None),
                state: Mutex::new(SessionState::default()),
                bits: EventBits::new(),
                observer,
                topics,
            }),
        };

        let sink = SessionEventSink {
            inner: Arc::downgrade(&manager.inner),
        };
        transport
            .open(&manager.inner.config, sink)
            .map_err(|err| Error::ResourceExhausted(format!("broker client: {err}")))?;

        *manager.transport() = Some(transport);
        manager.state().initialized = true;
        manager.report("MQTT manager initialized", SessionStatus::None, false);
        Ok(manager)
    }

    pub fn start(&self, timeout_ms: Option<u64>) -> Result<()> {
        if !self.state().initialized {
            return Err(Error::InvalidState("session not initialized"));
        }

        let timeout_ms = timeout_ms.unwrap_or(self.inner.config.connect_timeout_ms);
        self.inner.bits.clear(BIT_CONNECTED | BIT_FAIL);
        self.with_transport(|transport| transport.start())?;
        self.state().started = true;

        let bits = self.inner.bits.wait_any(
            BIT_CONNECTED | BIT_FAIL,
            false,
            Duration::from_millis(timeout_ms),
        );
        if bits & BIT_CONNECTED != 0 {
            return Ok(());
        }

        self.report("MQTT connect timeout/fail", SessionStatus::Error, true);
        Err(Error::ConnectTimeout(timeout_ms))
    }

    pub fn stop(&self, timeout_ms: Option<u64>) -> Result<()> {
        let was_connected = {
            let state = self.state();
            if !state.started {
                return Ok(());
            }
            state.connected
        };

        let timeout_ms = timeout_ms.unwrap_or(self.inner.config.stop_timeout_ms);
        self.report("Stopping MQTT...", SessionStatus::Disconnecting, true);

        if was_connected {
            self.inner.bits.clear(BIT_FAIL);
        }
        if let Err(err) = self.with_transport(|transport| transport.stop()) {
            self.report("MQTT stop error", SessionStatus::Error, true);
            return Err(err);
        }

        if was_connected {
            let bits = self
                .inner
                .bits
                .wait_any(BIT_FAIL, false, Duration::from_millis(timeout_ms));
            if bits & BIT_FAIL == 0 {
                self.report("MQTT stop error", SessionStatus::Error, true);
                return Err(Error::StopTimeout(timeout_ms));
            }
        }

        {
            let mut state = self.state();
            state.connected = false;
            state.started = false;
        }
        self.report("MQTT stopped", SessionStatus::Disconnected, true);
        Ok(())
    }

    pub fn publish(&self, topic: &str, payload: &[u8], qos: Qos, retain: bool) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::InvalidState("session not connected"));
        }
        if topic.is_empty() {
            return Err(Error::InvalidArgument("topic is empty"));
        }

        let mid =
            self.with_transport(|transport| transport.publish(topic, payload, qos, retain))?;
        match mid {
            Some(mid) => info!("PUBLISH mid={mid} topic={topic} qos={}", qos.level()),
            None => info!("PUBLISH topic={topic} qos={}", qos.level()),
        }
        Ok(())
    }

    pub fn deinit(&self) {
        if self.state().started {
            if let Err(err) = self.stop(Some(DEINIT_STOP_TIMEOUT_MS)) {
                warn!("stop during deinit: {err}");
            }
        }

        if let Some(mut transport) = self.transport().take() {
            transport.close();
        }

        *self.state() = SessionState::default();
        self.inner.bits.clear(u32::MAX);
        self.report("MQTT uninitialized", SessionStatus::Disconnected, true);
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn is_started(&self) -> bool {
        self.state().started
    }

    fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                self.state().connected = true;
                self.report("MQTT connected", SessionStatus::Connected, true);
                self.inner.bits.set(BIT_CONNECTED);

                let mut failed = false;
                for topic in self.inner.topics.topics() {
                    let subscribed = self
                        .with_transport(|transport| transport.subscribe(topic, Qos::AtLeastOnce));
                    if let Err(err) = subscribed {
                        warn!("subscribe to `{topic}` failed: {err}");
                        failed = true;
                    }
                }
                if failed {
                    self.report("Subscription failed", SessionStatus::Error, true);
                }

                self.inner.observer.on_connected(self);
            }
            SessionEvent::Disconnected => {
                self.state().connected = false;
                self.report("MQTT DISCONNECTED", SessionStatus::Disconnected, true);
                self.inner.bits.set(BIT_FAIL);
            }
            SessionEvent::Message { topic, payload } => {
                let topic = bounded_text(topic.as_bytes(), MAX_TOPIC_BYTES);
                let payload = bounded_text(&payload, MAX_PAYLOAD_BYTES);
                debug!("message on `{topic}` ({} bytes)", payload.len());

                self.inner.observer.on_message(&topic, &payload);
                if !self.inner.topics.dispatch(self, &topic, &payload) {
                    debug!("no handler for `{topic}`");
                }
            }
        }
    }

    fn with_transport<T>(
        &self,
        op: impl FnOnce(&mut dyn MqttTransport) -> core::result::Result<T, TransportError>,
    ) -> Result<T> {
        let mut transport = self.transport();
        let transport = transport
            .as_deref_mut()
            .ok_or(Error::InvalidState("session transport released"))?;
        op(transport).map_err(Error::from)
    }

    fn report(&self, text: &str, status: SessionStatus, notify: bool) {
        info!("[session {}] {text}", status.as_str());
        if notify {
            self.inner.observer.on_status(text, status);
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transport(&self) -> MutexGuard<'_, Option<Box<dyn MqttTransport>>> {
        self.inner
            .transport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn bounded_text(raw: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(raw);
    if text.len() <= max {
        return text.into_owned();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
