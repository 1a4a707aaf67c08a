use std::{
    net::Ipv4Addr,
    sync::{mpsc, Arc, Mutex, MutexGuard},
    thread,
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    config::{ScanConfig, SessionConfig},
    error::{DriverError, TransportError},
    link::{AccessPointSettings, LinkEvent, LinkEventSink, WifiDriver},
    session::{MqttTransport, SessionEvent, SessionEventSink},
    types::{reason_code, Credential, Qos, ScanEntry},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedNetwork {
    pub ssid: String,
    #[serde(default, alias = "secret")]
    pub pass: String,
    pub rssi: i8,
}

impl SimulatedNetwork {
    pub fn new(ssid: &str, pass: &str, rssi: i8) -> Self {
        Self {
            ssid: ssid.to_string(),
            pass: pass.to_string(),
            rssi,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum RadioMode {
    #[default]
    Idle,
    Station,
    AccessPoint,
}

#[derive(Debug)]
struct RadioState {
    networks: Vec<SimulatedNetwork>,
    mode: RadioMode,
    started: bool,
    station: Option<Credential>,
    associated: Option<String>,
    access_point: Option<AccessPointSettings>,
    events: Option<mpsc::Sender<LinkEvent>>,
    hw_id: [u8; 6],
    report_signal: bool,
    fail_scans: bool,
    scan_count: u32,
    connect_attempts: Vec<String>,
}

impl RadioState {
    fn emit(&self, event: LinkEvent) {
        match &self.events {
            Some(events) => {
                if events.send(event).is_err() {
                    warn!("simulated radio event dispatcher is gone");
                }
            }
            None => debug!("simulated radio has no event sink"),
        }
    }

    fn network(&self, ssid: &str) -> Option<(usize, &SimulatedNetwork)> {
        self.networks
            .iter()
            .enumerate()
            .find(|(_, network)| network.ssid == ssid)
    }
}

/// In-process radio used by host builds and tests. Clones observe and steer
/// the same simulated environment.
#[derive(Debug, Clone)]
pub struct SimulatedRadio {
    state: Arc<Mutex<RadioState>>,
}

impl SimulatedRadio {
    pub fn new(networks: Vec<SimulatedNetwork>) -> Self {
        Self {
            state: Arc::new(Mutex::new(RadioState {
                networks,
                mode: RadioMode::Idle,
                started: false,
                station: None,
                associated: None,
                access_point: None,
                events: None,
                hw_id: [0x02, 0x00, 0x5e, 0x10, 0x20, 0x30],
                report_signal: true,
                fail_scans: false,
                scan_count: 0,
                connect_attempts: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RadioState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_network(&self, network: SimulatedNetwork) {
        let mut state = self.lock();
        state.networks.retain(|existing| existing.ssid != network.ssid);
        state.networks.push(network);
    }

    /// Takes `ssid` off the air, dropping the link if it is associated.
    pub fn remove_network(&self, ssid: &str) {
        let mut state = self.lock();
        state.networks.retain(|network| network.ssid != ssid);
        if state.associated.as_deref() == Some(ssid) {
            state.associated = None;
            state.emit(LinkEvent::Disconnected {
                reason_code: reason_code::BEACON_TIMEOUT,
            });
        }
    }

    /// Drops the current association while leaving the network on the air.
    pub fn drop_link(&self) {
        let mut state = self.lock();
        if state.associated.take().is_some() {
            state.emit(LinkEvent::Disconnected {
                reason_code: reason_code::BEACON_TIMEOUT,
            });
        }
    }

    pub fn set_signal_report(&self, enabled: bool) {
        self.lock().report_signal = enabled;
    }

    pub fn set_scan_failure(&self, fail: bool) {
        self.lock().fail_scans = fail;
    }

    pub fn scan_count(&self) -> u32 {
        self.lock().scan_count
    }

    pub fn connect_attempts(&self) -> Vec<String> {
        self.lock().connect_attempts.clone()
    }

    pub fn associated(&self) -> Option<String> {
        self.lock().associated.clone()
    }

    pub fn access_point(&self) -> Option<AccessPointSettings> {
        self.lock().access_point.clone()
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }
}

impl WifiDriver for SimulatedRadio {
    fn register(&mut self, sink: LinkEventSink) -> Result<(), DriverError> {
        let (tx, rx) = mpsc::channel::<LinkEvent>();
        thread::Builder::new()
            .name("sim-radio-events".to_string())
            .spawn(move || {
                for event in rx {
                    sink.dispatch(event);
                }
            })
            .map_err(|err| DriverError::new(format!("event dispatcher: {err}")))?;

        self.lock().events = Some(tx);
        Ok(())
    }

    fn unregister(&mut self) {
        self.lock().events = None;
    }

    fn enter_station_mode(&mut self) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.mode = RadioMode::Station;
        state.access_point = None;
        Ok(())
    }

    fn set_station_config(
        &mut self,
        credential: &Credential,
        _listen_interval: u16,
    ) -> Result<(), DriverError> {
        let mut state = self.lock();
        if state.mode == RadioMode::AccessPoint {
            return Err(DriverError::new("radio is in access point mode"));
        }
        state.mode = RadioMode::Station;
        state.station = Some(credential.clone());
        Ok(())
    }

    fn enter_access_point_mode(
        &mut self,
        settings: &AccessPointSettings,
    ) -> Result<(), DriverError> {
        let mut state = self.lock();
        if state.started {
            return Err(DriverError::new("radio must be stopped before mode change"));
        }
        state.mode = RadioMode::AccessPoint;
        state.access_point = Some(settings.clone());
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        let mut state = self.lock();
        if state.mode == RadioMode::Idle {
            return Err(DriverError::new("radio mode not set"));
        }
        if !state.started {
            state.started = true;
            state.emit(LinkEvent::Started);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        let mut state = self.lock();
        if !state.started {
            return Ok(());
        }
        if state.associated.take().is_some() {
            state.emit(LinkEvent::Disconnected {
                reason_code: reason_code::ASSOC_LEAVE,
            });
        }
        state.started = false;
        state.emit(LinkEvent::Stopped);
        Ok(())
    }

    fn connect(&mut self) -> Result<(), DriverError> {
        let mut state = self.lock();
        if !state.started || state.mode != RadioMode::Station {
            return Err(DriverError::new("station not started"));
        }
        let Some(station) = state.station.clone() else {
            return Err(DriverError::new("station not configured"));
        };

        state.connect_attempts.push(station.ssid.clone());

        let outcome = state
            .network(&station.ssid)
            .map(|(index, network)| (index, network.pass == station.pass));

        match outcome {
            None => {
                state.associated = None;
                state.emit(LinkEvent::Disconnected {
                    reason_code: reason_code::NO_AP_FOUND,
                });
            }
            Some((_, false)) => {
                state.associated = None;
                state.emit(LinkEvent::Disconnected {
                    reason_code: reason_code::AUTH_FAIL,
                });
            }
            Some((index, true)) => {
                state.associated = Some(station.ssid.clone());
                let host = 10_u8.saturating_add(index as u8);
                state.emit(LinkEvent::GotAddress {
                    address: Ipv4Addr::new(192, 168, 1, host),
                });
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), DriverError> {
        let mut state = self.lock();
        if state.associated.take().is_some() {
            state.emit(LinkEvent::Disconnected {
                reason_code: reason_code::ASSOC_LEAVE,
            });
        }
        Ok(())
    }

    fn scan(&mut self, _config: &ScanConfig) -> Result<Vec<ScanEntry>, DriverError> {
        let mut state = self.lock();
        if !state.started || state.mode != RadioMode::Station {
            return Err(DriverError::new("scan requires a started station"));
        }
        state.scan_count += 1;
        if state.fail_scans {
            return Err(DriverError::new("scan start refused"));
        }

        let records = state
            .networks
            .iter()
            .map(|network| ScanEntry {
                ssid: network.ssid.clone(),
                rssi: network.rssi,
            })
            .collect();
        state.emit(LinkEvent::ScanDone);
        Ok(records)
    }

    fn release(&mut self) -> Result<(), DriverError> {
        let mut state = self.lock();
        if state.started {
            return Err(DriverError::new("radio still running"));
        }
        state.mode = RadioMode::Idle;
        state.access_point = None;
        Ok(())
    }

    fn hw_id(&self) -> Option<[u8; 6]> {
        Some(self.lock().hw_id)
    }

    fn rssi(&self) -> Option<i8> {
        let state = self.lock();
        if !state.report_signal {
            return None;
        }
        let ssid = state.associated.as_deref()?;
        state.network(ssid).map(|(_, network)| network.rssi)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Default)]
struct BrokerState {
    sink: Option<SessionEventSink>,
    config: Option<SessionConfig>,
    answer_connect: bool,
    confirm_stop: bool,
    fail_subscribe: bool,
    running: bool,
    subscriptions: Vec<(String, Qos)>,
    published: Vec<PublishedMessage>,
}

/// In-process broker transport. Connect and stop confirmations arrive from a
/// helper thread, the way a networked client reports them.
#[derive(Clone)]
pub struct SimulatedBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for SimulatedBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                answer_connect: true,
                confirm_stop: true,
                ..BrokerState::default()
            })),
        }
    }

    /// A broker that never acknowledges a connect.
    pub fn unresponsive() -> Self {
        let broker = Self::new();
        broker.lock().answer_connect = false;
        broker
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_stop_confirmation(&self, confirm: bool) {
        self.lock().confirm_stop = confirm;
    }

    pub fn set_subscribe_failure(&self, fail: bool) {
        self.lock().fail_subscribe = fail;
    }

    pub fn subscriptions(&self) -> Vec<(String, Qos)> {
        self.lock().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.lock()
            .published
            .iter()
            .filter(|message| message.topic == topic)
            .map(PublishedMessage::text)
            .collect()
    }

    /// The configuration the session opened this transport with.
    pub fn config(&self) -> Option<SessionConfig> {
        self.lock().config.clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Delivers `event` on the calling thread.
    pub fn deliver(&self, event: SessionEvent) {
        let sink = self.lock().sink.clone();
        match sink {
            Some(sink) => sink.dispatch(event),
            None => warn!("simulated broker is not open"),
        }
    }

    pub fn inject(&self, topic: &str, payload: &str) {
        self.deliver(SessionEvent::Message {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        });
    }

    fn deliver_later(&self, event: SessionEvent) -> Result<(), TransportError> {
        let Some(sink) = self.lock().sink.clone() else {
            return Err(TransportError::new("simulated broker is not open"));
        };
        thread::Builder::new()
            .name("sim-broker-events".to_string())
            .spawn(move || sink.dispatch(event))
            .map(|_| ())
            .map_err(|err| TransportError::new(format!("event thread: {err}")))
    }
}

impl MqttTransport for SimulatedBroker {
    fn open(&mut self, config: &SessionConfig, sink: SessionEventSink) -> Result<(), TransportError> {
        debug!("simulated broker opened for `{}`", config.client_id);
        let mut state = self.lock();
        state.sink = Some(sink);
        state.config = Some(config.clone());
        Ok(())
    }

    fn start(&mut self) -> Result<(), TransportError> {
        let answer = {
            let mut state = self.lock();
            state.running = true;
            state.answer_connect
        };
        if answer {
            self.deliver_later(SessionEvent::Connected)?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        let confirm = {
            let mut state = self.lock();
            state.running = false;
            state.confirm_stop
        };
        if confirm {
            self.deliver_later(SessionEvent::Disconnected)?;
        }
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.fail_subscribe {
            return Err(TransportError::new("subscribe refused"));
        }
        state.subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retain: bool,
    ) -> Result<Option<u32>, TransportError> {
        let mut state = self.lock();
        if !state.running {
            return Err(TransportError::new("client not running"));
        }
        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        Ok(Some(state.published.len() as u32))
    }

    fn close(&mut self) {
        let mut state = self.lock();
        state.sink = None;
        state.running = false;
    }
}
