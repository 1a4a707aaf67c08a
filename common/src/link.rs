use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard, Weak},
    thread,
    time::Duration,
};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    config::{LinkConfig, ScanConfig},
    error::{DriverError, Error, Result},
    event_bits::EventBits,
    types::{
        Credential, CredentialList, DisconnectReason, LinkInfo, LinkMode, LinkStatus, ScanEntry,
        ScanList,
    },
};

pub const BIT_STARTED: u32 = 1 << 0;
pub const BIT_CONNECTED: u32 = 1 << 1;
pub const BIT_FAIL: u32 = 1 << 2;
pub const BIT_STOPPED: u32 = 1 << 3;
pub const BIT_SCAN_DONE: u32 = 1 << 4;

const STOP_SETTLE: Duration = Duration::from_millis(3_000);
const AP_STOP_SETTLE: Duration = Duration::from_millis(2_000);
const DEINIT_SETTLE: Duration = Duration::from_millis(1_000);

/// Asynchronous notifications a radio driver delivers to the link manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Started,
    Stopped,
    Disconnected { reason_code: u16 },
    ScanDone,
    GotAddress { address: Ipv4Addr },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointSettings {
    pub ssid: String,
    pub pass: String,
    pub channel: u8,
    pub max_connections: u8,
}

impl AccessPointSettings {
    pub fn is_open(&self) -> bool {
        self.pass.is_empty()
    }
}

/// Radio driver seam. Implementations must deliver `LinkEvent`s from their
/// own context, never from inside one of these calls.
pub trait WifiDriver: Send {
    fn register(&mut self, sink: LinkEventSink) -> core::result::Result<(), DriverError>;
    fn unregister(&mut self);
    fn enter_station_mode(&mut self) -> core::result::Result<(), DriverError>;
    fn set_station_config(
        &mut self,
        credential: &Credential,
        listen_interval: u16,
    ) -> core::result::Result<(), DriverError>;
    fn enter_access_point_mode(
        &mut self,
        settings: &AccessPointSettings,
    ) -> core::result::Result<(), DriverError>;
    fn start(&mut self) -> core::result::Result<(), DriverError>;
    fn stop(&mut self) -> core::result::Result<(), DriverError>;
    fn connect(&mut self) -> core::result::Result<(), DriverError>;
    fn disconnect(&mut self) -> core::result::Result<(), DriverError>;
    /// Blocking scan.
    fn scan(&mut self, config: &ScanConfig) -> core::result::Result<Vec<ScanEntry>, DriverError>;
    /// Releases driver resources after a stop.
    fn release(&mut self) -> core::result::Result<(), DriverError>;
    fn hw_id(&self) -> Option<[u8; 6]>;
    fn rssi(&self) -> Option<i8>;
}

pub trait LinkObserver: Send + Sync {
    fn on_status(&self, text: &str, status: LinkStatus);

    fn on_scan_result(&self, _scan: &ScanList) {}
}

/// Handle a driver uses to push events into its link manager.
#[derive(Clone)]
pub struct LinkEventSink {
    inner: Weak<LinkInner>,
}

impl LinkEventSink {
    pub fn dispatch(&self, event: LinkEvent) {
        match self.inner.upgrade() {
            Some(inner) => LinkManager { inner }.handle_event(event),
            None => debug!("dropping link event {event:?}: manager released"),
        }
    }
}

#[derive(Debug, Error)]
#[error("network switch failed ({}): {source}", reason.as_str())]
pub struct SwitchError {
    pub reason: DisconnectReason,
    #[source]
    pub source: Error,
}

#[derive(Debug, Default)]
struct LinkState {
    mode: LinkMode,
    connected: bool,
    started: bool,
    connect_on_start: bool,
    auto_reconnect: bool,
    manual_stop: bool,
    last_disconnect: DisconnectReason,
    credentials: CredentialList,
    scan: ScanList,
    info: LinkInfo,
    applied: Option<Credential>,
}

struct LinkInner {
    config: LinkConfig,
    driver: Mutex<Box<dyn WifiDriver>>,
    state: Mutex<LinkState>,
    bits: EventBits,
    observer: Arc<dyn LinkObserver>,
}

/// Network link manager. Clones share the same link.
#[derive(Clone)]
pub struct LinkManager {
    inner: Arc<LinkInner>,
}

impl LinkManager {
    pub fn init(
        config: LinkConfig,
        credentials: CredentialList,
        driver: Box<dyn WifiDriver>,
        observer: Arc<dyn LinkObserver>,
    ) -> Result<Self> {
        let inner = Arc::new(LinkInner {
            config,
            driver: Mutex::new(driver),
            state: Mutex::new(LinkState {
                credentials,
                ..LinkState::default()
            }),
            bits: EventBits::new(),
            observer,
        });

        let manager = Self { inner };
        let sink = LinkEventSink {
            inner: Arc::downgrade(&manager.inner),
        };
        manager
            .driver()
            .register(sink)
            .map_err(|err| Error::ResourceExhausted(format!("link event registration: {err}")))?;

        manager.report("Wi-Fi manager initialized", LinkStatus::None, true);
        Ok(manager)
    }

    pub fn deinit(&self) {
        {
            let mut state = self.state();
            state.auto_reconnect = false;
            state.manual_stop = true;
        }
        if let Err(err) = self.driver().stop() {
            debug!("driver stop during deinit: {err}");
        }
        self.inner
            .bits
            .wait_any(BIT_STOPPED, true, DEINIT_SETTLE);

        {
            let mut driver = self.driver();
            driver.unregister();
            if let Err(err) = driver.release() {
                warn!("driver release during deinit failed: {err}");
            }
        }

        *self.state() = LinkState::default();
        self.inner.bits.clear(u32::MAX);
        info!("link manager deinitialized");
    }

    pub fn scan_sync(&self) -> Result<ScanList> {
        if !self.state().started {
            self.state().connect_on_start = false;
            {
                let mut driver = self.driver();
                driver.enter_station_mode()?;
                driver.start()?;
            }
            self.inner
                .bits
                .wait_any(BIT_STARTED, true, self.timeout(self.inner.config.start_timeout_ms));
        }

        let records = self.driver().scan(&self.inner.config.scan)?;
        let scan = ScanList::from_records(records);
        info!("scan found {} networks", scan.len());

        self.state().scan = scan.clone();
        self.inner.observer.on_scan_result(&scan);
        Ok(scan)
    }

    pub fn first_connect(&self) -> Result<()> {
        let candidates: Vec<Credential> = {
            let state = self.state();
            if state.credentials.is_empty() {
                return Err(Error::InvalidState("no saved credentials"));
            }
            state.credentials.iter().cloned().collect()
        };

        self.scan_sync()?;
        self.stop_station()?;

        let connect_timeout = self.timeout(self.inner.config.connect_timeout_ms);
        for candidate in candidates {
            if !self.is_name_available(&candidate.ssid) {
                debug!("skipping `{}`: not in range", candidate.ssid);
                continue;
            }

            info!("trying saved network `{}`", candidate.ssid);
            self.driver()
                .set_station_config(&candidate, self.inner.config.listen_interval)?;
            {
                let mut state = self.state();
                state.applied = Some(candidate.clone());
                state.connect_on_start = true;
                state.auto_reconnect = false;
            }
            self.inner.bits.clear(BIT_CONNECTED | BIT_FAIL);
            self.driver().start()?;

            let bits = self
                .inner
                .bits
                .wait_any(BIT_CONNECTED | BIT_FAIL, true, connect_timeout);
            if bits & BIT_CONNECTED != 0 {
                let mut state = self.state();
                state.auto_reconnect = true;
                state.mode = LinkMode::Station;
                return Ok(());
            }

            warn!("could not join `{}`", candidate.ssid);
            self.driver().stop()?;
            self.inner.bits.wait_any(BIT_STOPPED, true, STOP_SETTLE);
        }

        Err(Error::NoUsableNetwork)
    }

    pub fn start_access_point(&self, ssid: &str, pass: &str) -> Result<()> {
        let credential = Credential::new(ssid, pass)?;
        let settings = AccessPointSettings {
            ssid: credential.ssid,
            pass: credential.pass,
            channel: self.inner.config.access_point.channel,
            max_connections: self.inner.config.access_point.max_connections,
        };

        {
            let mut state = self.state();
            state.auto_reconnect = false;
            state.connect_on_start = false;
        }

        if let Err(err) = self.driver().stop() {
            debug!("driver stop before access point: {err}");
        }
        self.inner.bits.wait_any(BIT_STOPPED, true, DEINIT_SETTLE);
        if let Err(err) = self.driver().release() {
            debug!("driver release before access point: {err}");
        }

        {
            let mut driver = self.driver();
            driver.enter_access_point_mode(&settings)?;
            driver.start()?;
        }

        {
            let mut state = self.state();
            state.mode = LinkMode::AccessPoint;
            state.connected = false;
            state.started = true;
        }
        info!(
            "access point `{}` up ({})",
            settings.ssid,
            if settings.is_open() { "open" } else { "wpa/wpa2" }
        );
        self.report("Wi-Fi setup server started", LinkStatus::None, true);
        Ok(())
    }

    pub fn stop_access_point(&self) -> Result<()> {
        {
            let state = self.state();
            if !state.started || state.mode != LinkMode::AccessPoint {
                return Ok(());
            }
        }

        self.driver().stop()?;
        self.inner.bits.wait_any(BIT_STOPPED, true, AP_STOP_SETTLE);
        self.driver().release()?;

        {
            let mut state = self.state();
            state.mode = LinkMode::None;
            state.started = false;
        }
        self.report("Wi-Fi setup server stopped", LinkStatus::None, true);
        Ok(())
    }

    /// Switches to `ssid`; on failure the previously linked network is
    /// re-applied and, if that does not come back, a full reconnect runs.
    pub fn change_network(
        &self,
        ssid: &str,
        pass: &str,
    ) -> core::result::Result<(), SwitchError> {
        let target = Credential::new(ssid, pass).map_err(|source| SwitchError {
            reason: DisconnectReason::None,
            source,
        })?;

        let (previous, was_connected) = {
            let mut state = self.state();
            state.auto_reconnect = false;
            (
                Credential {
                    ssid: state.info.ssid.clone(),
                    pass: state.info.pass.clone(),
                },
                state.connected,
            )
        };

        if was_connected {
            if let Err(err) = self.disconnect_station() {
                warn!("disconnect before switch: {err}");
            }
        }

        let attempt = self.join(&target);
        if attempt.is_ok() {
            self.state().last_disconnect = DisconnectReason::None;
            self.report("Switched to new Wi-Fi successfully", LinkStatus::None, false);
            self.state().auto_reconnect = true;
            return Ok(());
        }

        let reason = match &attempt {
            Err(Error::ConnectTimeout(_)) => DisconnectReason::Other,
            _ => self.state().last_disconnect,
        };
        warn!("switch to `{}` failed ({})", target.ssid, reason.as_str());

        if !previous.ssid.is_empty() {
            if let Err(err) = self.driver().disconnect() {
                debug!("disconnect after failed switch: {err}");
            }
            if let Err(err) = self.join(&previous) {
                warn!("rollback to `{}` failed: {err}", previous.ssid);
            }
        }

        if !self.is_connected() {
            if let Err(err) = self.reconnect() {
                warn!("reconnect after failed switch: {err}");
            }
        }

        self.state().auto_reconnect = true;
        Err(SwitchError {
            reason,
            source: attempt
                .err()
                .unwrap_or(Error::Transport("network switch failed".to_string())),
        })
    }

    pub fn full_driver_stop(&self) -> Result<()> {
        self.state().manual_stop = true;

        let result = self.stop_and_release();

        {
            let mut state = self.state();
            state.manual_stop = false;
            state.mode = LinkMode::None;
            state.connected = false;
            state.started = false;
        }
        self.inner
            .bits
            .clear(BIT_CONNECTED | BIT_FAIL | BIT_STARTED);

        result?;
        self.report("Wi-Fi full driver stopped", LinkStatus::Disconnected, true);
        Ok(())
    }

    pub fn reconnect(&self) -> Result<()> {
        self.state().auto_reconnect = false;
        self.report("Auto-reconnect in progress", LinkStatus::None, true);

        let result = self.reconnect_passes();
        self.state().auto_reconnect = true;
        result
    }

    fn reconnect_passes(&self) -> Result<()> {
        let attempts = self.inner.config.max_reconnect_attempts;
        let connect_timeout = self.timeout(self.inner.config.connect_timeout_ms);

        for pass in 1..=attempts {
            self.report("Attempting to reconnect...", LinkStatus::None, true);
            debug!("reconnect pass {pass}/{attempts}");

            if let Err(err) = self.scan_sync() {
                self.report("Wi-Fi scan failed during reconnect", LinkStatus::None, true);
                return Err(err);
            }

            for candidate in self.reconnect_candidates() {
                if !self.is_name_available(&candidate.ssid) {
                    continue;
                }

                self.driver()
                    .set_station_config(&candidate, self.inner.config.listen_interval)?;
                self.state().applied = Some(candidate.clone());
                self.inner.bits.clear(BIT_CONNECTED | BIT_FAIL);
                self.driver().connect()?;

                let bits = self
                    .inner
                    .bits
                    .wait_any(BIT_CONNECTED | BIT_FAIL, true, connect_timeout);
                if bits & BIT_CONNECTED != 0 {
                    self.state().mode = LinkMode::Station;
                    self.report("Auto-reconnect succeeded", LinkStatus::None, false);
                    return Ok(());
                }

                self.report("Failed to reconnect", LinkStatus::None, false);
            }
        }

        self.report(
            "Auto-reconnect failed after all attempts",
            LinkStatus::None,
            true,
        );
        Err(Error::Exhausted(attempts))
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn is_name_available(&self, ssid: &str) -> bool {
        self.state().scan.contains(ssid)
    }

    pub fn mode(&self) -> LinkMode {
        self.state().mode
    }

    pub fn info(&self) -> LinkInfo {
        self.state().info.clone()
    }

    pub fn last_disconnect(&self) -> DisconnectReason {
        self.state().last_disconnect
    }

    pub fn scan_list(&self) -> ScanList {
        self.state().scan.clone()
    }

    pub fn credentials(&self) -> CredentialList {
        self.state().credentials.clone()
    }

    /// Keeps the in-memory candidate list in step with the credential store.
    pub fn remember(&self, credential: Credential) -> bool {
        self.state().credentials.upsert(credential)
    }

    pub fn forget(&self, ssid: &str) -> bool {
        self.state().credentials.remove(ssid)
    }

    fn handle_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Started => {
                let connect = {
                    let mut state = self.state();
                    state.started = true;
                    state.connect_on_start
                };
                self.inner.bits.set(BIT_STARTED);

                if connect {
                    self.report("Wi-Fi started, connecting...", LinkStatus::Connecting, true);
                    if let Err(err) = self.driver().connect() {
                        error!("connect on start failed: {err}");
                    }
                }
            }
            LinkEvent::Disconnected { reason_code } => {
                let reason = DisconnectReason::from_reason_code(reason_code);
                let respawn = {
                    let mut state = self.state();
                    state.connected = false;
                    state.last_disconnect = reason;
                    state.auto_reconnect && !state.manual_stop
                };
                self.inner.bits.clear(BIT_CONNECTED);
                self.inner.bits.set(BIT_FAIL);
                debug!("disconnect reason {reason_code} -> {}", reason.as_str());
                self.report("Wi-Fi disconnected", LinkStatus::Disconnected, true);

                if respawn {
                    self.report(
                        "Auto-reconnect enabled, creating task...",
                        LinkStatus::None,
                        false,
                    );
                    self.spawn_reconnect();
                }
            }
            LinkEvent::Stopped => {
                self.state().started = false;
                self.inner.bits.set(BIT_STOPPED);
            }
            LinkEvent::ScanDone => self.inner.bits.set(BIT_SCAN_DONE),
            LinkEvent::GotAddress { address } => {
                let (hw_id, rssi) = {
                    let driver = self.driver();
                    (driver.hw_id(), driver.rssi())
                };

                {
                    let mut state = self.state();
                    let applied = state.applied.clone().unwrap_or(Credential {
                        ssid: String::new(),
                        pass: String::new(),
                    });
                    state.info = LinkInfo {
                        ssid: applied.ssid,
                        pass: applied.pass,
                        address: Some(address),
                        hw_id,
                        rssi,
                    };
                    state.connected = true;
                }

                if rssi.is_none() {
                    self.report("Wi-Fi unstable connection", LinkStatus::Connected, true);
                }

                self.inner.bits.set(BIT_CONNECTED);
                self.inner.bits.clear(BIT_FAIL);
                self.report("Wi-Fi connected", LinkStatus::Connected, true);
            }
        }
    }

    fn spawn_reconnect(&self) {
        let manager = self.clone();
        let delay = Duration::from_millis(self.inner.config.reconnect_delay_ms);

        let spawned = thread::Builder::new()
            .name("link-reconnect".to_string())
            .spawn(move || {
                thread::sleep(delay);
                manager.report("Auto-reconnect task started", LinkStatus::None, false);
                match manager.reconnect() {
                    Ok(()) => manager.report("Auto-reconnect success", LinkStatus::None, false),
                    Err(_) => manager.report("Auto-reconnect failed", LinkStatus::None, false),
                }
            });

        if let Err(err) = spawned {
            error!("failed to spawn reconnect task: {err}");
        }
    }

    fn reconnect_candidates(&self) -> Vec<Credential> {
        let state = self.state();
        let mut candidates = Vec::with_capacity(state.credentials.len() + 1);
        if !state.info.ssid.is_empty() {
            candidates.push(Credential {
                ssid: state.info.ssid.clone(),
                pass: state.info.pass.clone(),
            });
        }
        candidates.extend(
            state
                .credentials
                .iter()
                .filter(|credential| credential.ssid != state.info.ssid)
                .cloned(),
        );
        candidates
    }

    /// Applies `credential` to a started station and waits for the outcome.
    fn join(&self, credential: &Credential) -> Result<()> {
        self.driver()
            .set_station_config(credential, self.inner.config.listen_interval)?;
        self.state().applied = Some(credential.clone());
        self.inner.bits.clear(BIT_CONNECTED | BIT_FAIL);
        self.driver().connect()?;

        let timeout_ms = self.inner.config.connect_timeout_ms;
        let bits = self
            .inner
            .bits
            .wait_any(BIT_CONNECTED | BIT_FAIL, true, self.timeout(timeout_ms));

        if bits & BIT_CONNECTED != 0 {
            self.state().mode = LinkMode::Station;
            Ok(())
        } else if bits & BIT_FAIL != 0 {
            Err(Error::Transport(format!(
                "association with `{}` failed",
                credential.ssid
            )))
        } else {
            Err(Error::ConnectTimeout(timeout_ms))
        }
    }

    fn disconnect_station(&self) -> Result<()> {
        if self.state().mode != LinkMode::Station {
            return Err(Error::InvalidState("station is not active"));
        }

        self.driver().disconnect()?;
        let timeout_ms = self.inner.config.disconnect_timeout_ms;
        let bits = self.inner.bits.wait_any(
            BIT_FAIL | BIT_STOPPED,
            true,
            self.timeout(timeout_ms),
        );
        if bits & (BIT_FAIL | BIT_STOPPED) == 0 {
            return Err(Error::StopTimeout(timeout_ms));
        }
        Ok(())
    }

    fn stop_station(&self) -> Result<()> {
        if let Err(err) = self.disconnect_station() {
            debug!("station disconnect skipped: {err}");
        }

        self.driver().stop()?;
        let timeout_ms = self.inner.config.stop_timeout_ms;
        let bits = self
            .inner
            .bits
            .wait_any(BIT_STOPPED, true, self.timeout(timeout_ms));
        if bits & BIT_STOPPED == 0 {
            return Err(Error::StopTimeout(timeout_ms));
        }
        Ok(())
    }

    fn stop_and_release(&self) -> Result<()> {
        if let Err(err) = self.driver().disconnect() {
            debug!("disconnect during full stop: {err}");
        }
        self.driver().stop()?;
        self.inner.bits.wait_any(BIT_STOPPED, true, STOP_SETTLE);
        self.driver().release()?;
        Ok(())
    }

    fn report(&self, text: &str, status: LinkStatus, notify: bool) {
        info!("[link {}] {text}", status.as_str());
        if notify {
            self.inner.observer.on_status(text, status);
        }
    }

    fn timeout(&self, ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn driver(&self) -> MutexGuard<'_, Box<dyn WifiDriver>> {
        self.inner
            .driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedNetwork, SimulatedRadio};
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingObserver {
        statuses: Mutex<Vec<(String, LinkStatus)>>,
        scans: Mutex<Vec<usize>>,
    }

    impl RecordingObserver {
        fn texts(&self) -> Vec<String> {
            self.statuses
                .lock()
                .unwrap()
                .iter()
                .map(|(text, _)| text.clone())
                .collect()
        }
    }

    impl LinkObserver for RecordingObserver {
        fn on_status(&self, text: &str, status: LinkStatus) {
            self.statuses.lock().unwrap().push((text.to_string(), status));
        }

        fn on_scan_result(&self, scan: &ScanList) {
            self.scans.lock().unwrap().push(scan.len());
        }
    }

    fn test_config() -> LinkConfig {
        LinkConfig {
            connect_timeout_ms: 2_000,
            stop_timeout_ms: 1_000,
            disconnect_timeout_ms: 500,
            start_timeout_ms: 500,
            max_reconnect_attempts: 2,
            reconnect_delay_ms: 10,
            ..LinkConfig::default()
        }
    }

    fn saved(entries: &[(&str, &str)]) -> CredentialList {
        let mut list = CredentialList::new();
        for (ssid, pass) in entries {
            list.upsert(Credential::new(*ssid, *pass).unwrap());
        }
        list
    }

    fn setup(
        networks: Vec<SimulatedNetwork>,
        credentials: CredentialList,
    ) -> (LinkManager, SimulatedRadio, Arc<RecordingObserver>) {
        let radio = SimulatedRadio::new(networks);
        let observer = Arc::new(RecordingObserver::default());
        let manager = LinkManager::init(
            test_config(),
            credentials,
            Box::new(radio.clone()),
            observer.clone(),
        )
        .unwrap();
        (manager, radio, observer)
    }

    fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    #[test]
    fn init_reports_initialized_status() {
        let (_manager, _radio, observer) = setup(vec![], CredentialList::new());
        assert_eq!(observer.texts(), vec!["Wi-Fi manager initialized"]);
    }

    #[test]
    fn first_connect_skips_networks_missing_from_scan() {
        let (manager, radio, _observer) = setup(
            vec![SimulatedNetwork::new("Y", "pw-y", -60)],
            saved(&[("X", "pw-x"), ("Y", "pw-y")]),
        );

        manager.first_connect().unwrap();

        assert_eq!(radio.connect_attempts(), vec!["Y".to_string()]);
        assert!(manager.is_connected());
        assert_eq!(manager.mode(), LinkMode::Station);
        assert_eq!(manager.info().ssid, "Y");
        assert_eq!(manager.info().rssi, Some(-60));
    }

    #[test]
    fn first_connect_moves_on_after_wrong_secret() {
        let (manager, radio, _observer) = setup(
            vec![
                SimulatedNetwork::new("X", "right", -50),
                SimulatedNetwork::new("Y", "pw-y", -70),
            ],
            saved(&[("X", "wrong"), ("Y", "pw-y")]),
        );

        manager.first_connect().unwrap();

        assert_eq!(
            radio.connect_attempts(),
            vec!["X".to_string(), "Y".to_string()]
        );
        assert_eq!(manager.info().ssid, "Y");
    }

    #[test]
    fn first_connect_requires_saved_credentials() {
        let (manager, radio, _observer) = setup(vec![], CredentialList::new());

        assert_eq!(
            manager.first_connect(),
            Err(Error::InvalidState("no saved credentials"))
        );
        assert_eq!(radio.scan_count(), 0);
    }

    #[test]
    fn first_connect_reports_no_usable_network() {
        let (manager, _radio, _observer) = setup(
            vec![SimulatedNetwork::new("X", "right", -50)],
            saved(&[("X", "wrong"), ("Z", "pw")]),
        );

        assert_eq!(manager.first_connect(), Err(Error::NoUsableNetwork));
        assert!(!manager.is_connected());
    }

    #[test]
    fn scan_sync_dedups_and_notifies_observer() {
        let (manager, _radio, observer) = setup(
            vec![
                SimulatedNetwork::new("home", "", -70),
                SimulatedNetwork::new("cafe", "", -40),
            ],
            CredentialList::new(),
        );

        let scan = manager.scan_sync().unwrap();

        assert_eq!(scan.len(), 2);
        assert!(manager.is_name_available("cafe"));
        assert!(!manager.is_name_available("office"));
        assert_eq!(*observer.scans.lock().unwrap(), vec![2]);
    }

    #[test]
    fn scan_failure_is_a_transport_error() {
        let (manager, radio, _observer) = setup(vec![], CredentialList::new());
        radio.set_scan_failure(true);

        assert!(matches!(manager.scan_sync(), Err(Error::Transport(_))));
    }

    #[test]
    fn change_network_switches_and_keeps_new_info() {
        let (manager, _radio, _observer) = setup(
            vec![
                SimulatedNetwork::new("A", "pw-a", -50),
                SimulatedNetwork::new("B", "pw-b", -55),
            ],
            saved(&[("A", "pw-a")]),
        );
        manager.first_connect().unwrap();

        manager.change_network("B", "pw-b").unwrap();

        assert!(manager.is_connected());
        assert_eq!(manager.info().ssid, "B");
        assert_eq!(manager.info().pass, "pw-b");
        assert_eq!(manager.last_disconnect(), DisconnectReason::None);
    }

    #[test]
    fn change_network_with_wrong_secret_rolls_back() {
        let (manager, radio, _observer) = setup(
            vec![
                SimulatedNetwork::new("A", "pw-a", -50),
                SimulatedNetwork::new("B", "pw-b", -55),
            ],
            saved(&[("A", "pw-a")]),
        );
        manager.first_connect().unwrap();
        let before = manager.info();

        let err = manager.change_network("B", "not-it").unwrap_err();

        assert_eq!(err.reason, DisconnectReason::WrongSecret);
        let after = manager.info();
        assert_eq!((after.ssid, after.pass), (before.ssid, before.pass));
        assert!(manager.is_connected());
        assert_eq!(
            radio.connect_attempts(),
            vec!["A".to_string(), "B".to_string(), "A".to_string()]
        );
    }

    #[test]
    fn change_network_falls_back_to_reconnect_when_rollback_fails() {
        let (manager, radio, _observer) = setup(
            vec![
                SimulatedNetwork::new("A", "pw-a", -50),
                SimulatedNetwork::new("B", "pw-b", -55),
                SimulatedNetwork::new("C", "pw-c", -60),
            ],
            saved(&[("A", "pw-a"), ("C", "pw-c")]),
        );
        manager.first_connect().unwrap();
        radio.add_network(SimulatedNetwork::new("A", "rotated", -50));

        let err = manager.change_network("B", "not-it").unwrap_err();

        assert_eq!(err.reason, DisconnectReason::WrongSecret);
        assert!(manager.is_connected());
        assert_eq!(radio.associated().as_deref(), Some("C"));
        assert_eq!(manager.info().ssid, "C");
        assert_eq!(
            radio.connect_attempts(),
            vec!["A", "B", "A", "A", "C"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn change_network_with_nothing_to_fall_back_on_stays_offline() {
        let (manager, radio, _observer) = setup(
            vec![
                SimulatedNetwork::new("A", "pw-a", -50),
                SimulatedNetwork::new("B", "pw-b", -55),
            ],
            saved(&[("A", "pw-a")]),
        );
        manager.first_connect().unwrap();
        radio.add_network(SimulatedNetwork::new("A", "rotated", -50));

        let err = manager.change_network("B", "not-it").unwrap_err();

        assert_eq!(err.reason, DisconnectReason::WrongSecret);
        assert!(!manager.is_connected());
        assert_eq!(radio.associated(), None);
        assert_eq!(manager.info().ssid, "A");
    }

    #[test]
    fn change_network_to_absent_target_reports_no_target() {
        let (manager, _radio, _observer) = setup(
            vec![SimulatedNetwork::new("A", "pw-a", -50)],
            saved(&[("A", "pw-a")]),
        );
        manager.first_connect().unwrap();

        let err = manager.change_network("ghost", "pw").unwrap_err();

        assert_eq!(err.reason, DisconnectReason::NoTarget);
        assert_eq!(manager.info().ssid, "A");
    }

    #[test]
    fn change_network_rejects_empty_name() {
        let (manager, radio, _observer) = setup(vec![], CredentialList::new());

        let err = manager.change_network("", "pw").unwrap_err();

        assert!(matches!(err.source, Error::InvalidArgument(_)));
        assert!(radio.connect_attempts().is_empty());
    }

    #[test]
    fn reconnect_stops_after_configured_passes() {
        let (manager, radio, observer) = setup(
            vec![SimulatedNetwork::new("other", "", -50)],
            saved(&[("A", "pw-a")]),
        );

        assert_eq!(manager.reconnect(), Err(Error::Exhausted(2)));
        assert_eq!(radio.scan_count(), 2);
        assert!(radio.connect_attempts().is_empty());

        let texts = observer.texts();
        assert_eq!(
            texts.iter().filter(|t| *t == "Attempting to reconnect...").count(),
            2
        );
        assert_eq!(
            texts.last().map(String::as_str),
            Some("Auto-reconnect failed after all attempts")
        );
    }

    #[test]
    fn reconnect_tries_previous_network_first() {
        let (manager, radio, _observer) = setup(
            vec![
                SimulatedNetwork::new("A", "pw-a", -50),
                SimulatedNetwork::new("B", "pw-b", -55),
            ],
            saved(&[("A", "pw-a"), ("B", "pw-b")]),
        );
        manager.first_connect().unwrap();
        manager.change_network("B", "pw-b").unwrap();
        let attempts = radio.connect_attempts().len();

        radio.drop_link();

        assert!(wait_until(Duration::from_secs(5), || {
            radio.connect_attempts().len() > attempts && manager.is_connected()
        }));

        assert_eq!(radio.connect_attempts().last().map(String::as_str), Some("B"));
        assert_eq!(manager.info().ssid, "B");
    }

    #[test]
    fn lost_link_recovers_in_background() {
        let (manager, radio, observer) = setup(
            vec![SimulatedNetwork::new("A", "pw-a", -50)],
            saved(&[("A", "pw-a")]),
        );
        manager.first_connect().unwrap();

        radio.drop_link();

        assert!(wait_until(Duration::from_secs(5), || {
            observer
                .texts()
                .iter()
                .any(|t| t == "Auto-reconnect in progress")
                && manager.is_connected()
        }));
        assert_eq!(radio.associated().as_deref(), Some("A"));
    }

    #[test]
    fn full_driver_stop_suppresses_auto_reconnect() {
        let (manager, radio, observer) = setup(
            vec![SimulatedNetwork::new("A", "pw-a", -50)],
            saved(&[("A", "pw-a")]),
        );
        manager.first_connect().unwrap();
        let attempts = radio.connect_attempts().len();

        manager.full_driver_stop().unwrap();
        thread::sleep(Duration::from_millis(100));

        assert!(!manager.is_connected());
        assert_eq!(manager.mode(), LinkMode::None);
        assert_eq!(radio.connect_attempts().len(), attempts);
        assert!(!observer
            .texts()
            .iter()
            .any(|t| t == "Auto-reconnect in progress"));
        assert_eq!(
            observer.statuses.lock().unwrap().last().cloned(),
            Some((
                "Wi-Fi full driver stopped".to_string(),
                LinkStatus::Disconnected
            ))
        );
    }

    #[test]
    fn access_point_start_and_stop() {
        let (manager, radio, _observer) = setup(vec![], CredentialList::new());

        manager.start_access_point("esp32_setup", "").unwrap();

        assert_eq!(manager.mode(), LinkMode::AccessPoint);
        let ap = radio.access_point().unwrap();
        assert!(ap.is_open());
        assert_eq!(ap.channel, 6);
        assert_eq!(ap.max_connections, 4);

        manager.stop_access_point().unwrap();
        assert_eq!(manager.mode(), LinkMode::None);
        assert!(!radio.is_started());

        manager.stop_access_point().unwrap();
    }

    #[test]
    fn missing_signal_reports_unstable_before_connected() {
        let (manager, radio, observer) = setup(
            vec![SimulatedNetwork::new("A", "pw-a", -50)],
            saved(&[("A", "pw-a")]),
        );
        radio.set_signal_report(false);

        manager.first_connect().unwrap();

        assert_eq!(manager.info().rssi_text(), "N/A");
        let texts = observer.texts();
        let unstable = texts.iter().position(|t| t == "Wi-Fi unstable connection");
        let connected = texts.iter().position(|t| t == "Wi-Fi connected");
        assert!(unstable.is_some() && unstable < connected);
        assert_eq!(
            texts.iter().filter(|t| *t == "Wi-Fi connected").count(),
            1
        );
    }

    #[test]
    fn deinit_releases_the_driver() {
        let (manager, radio, _observer) = setup(
            vec![SimulatedNetwork::new("A", "pw-a", -50)],
            saved(&[("A", "pw-a")]),
        );
        manager.first_connect().unwrap();

        manager.deinit();

        assert!(!radio.is_started());
        assert!(!manager.is_connected());
        assert!(manager.credentials().is_empty());
    }
}
