//! Composition of the link manager, the broker session and the button
//! classifier into one device.
//!
//! The orchestrator owns both managers. Command handlers receive the session
//! handle from the dispatch call and a shared `Commands` context for the rest,
//! so nothing here is process-global.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    thread,
};

use log::{debug, error, info, warn};

use crate::{
    classifier::ButtonFlags,
    config::{DeviceConfig, LastWill, RuntimeConfig, SessionConfig},
    error::{Error, Result},
    link::{LinkManager, LinkObserver, WifiDriver},
    provisioning::{Provisioner, SetupPortal},
    session::{MqttTransport, SessionManager, SessionObserver, TopicTable},
    store::CredentialStore,
    topics::*,
    types::{Credential, DisconnectReason, LinkStatus, Qos, ScanList, SessionStatus},
};

const SETUP_SETTLE_MS: u64 = 1_000;
const SESSION_POLL_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Led {
    Green,
    Yellow,
    Red,
}

impl Led {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "green" => Some(Self::Green),
            "yellow" => Some(Self::Yellow),
            "red" => Some(Self::Red),
            _ => None,
        }
    }
}

/// Character display plus status LEDs.
pub trait DisplaySurface: Send + Sync {
    fn show_text(&self, text: &str);

    /// Shows `led` as the single status color.
    fn set_indicator(&self, led: Led);

    fn set_led(&self, led: Led, on: bool);
}

pub trait DevicePlatform: Send + Sync {
    fn restart(&self);

    fn sleep_ms(&self, ms: u64) {
        thread::sleep(std::time::Duration::from_millis(ms));
    }
}

pub struct Collaborators {
    pub store: Arc<dyn CredentialStore>,
    pub display: Arc<dyn DisplaySurface>,
    pub platform: Arc<dyn DevicePlatform>,
    pub portal: Arc<dyn SetupPortal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// Linked and the broker session is up.
    Online,
    /// No saved networks; the setup access point is running.
    SetupMode,
    /// No saved network could be joined.
    Offline,
    /// Linked, but the broker session did not come up.
    SessionUnavailable,
}

fn link_led(status: LinkStatus) -> Led {
    match status {
        LinkStatus::Connected => Led::Green,
        LinkStatus::Connecting | LinkStatus::Disconnecting | LinkStatus::None => Led::Yellow,
        LinkStatus::Disconnected | LinkStatus::Error => Led::Red,
    }
}

fn session_led(status: SessionStatus) -> Led {
    match status {
        SessionStatus::Connected => Led::Green,
        SessionStatus::Connecting | SessionStatus::Disconnecting | SessionStatus::None => {
            Led::Yellow
        }
        SessionStatus::Disconnected | SessionStatus::Error => Led::Red,
    }
}

/// Mirrors every link and session status onto the display.
struct StatusMirror {
    display: Arc<dyn DisplaySurface>,
}

impl LinkObserver for StatusMirror {
    fn on_status(&self, text: &str, status: LinkStatus) {
        self.display.show_text(text);
        self.display.set_indicator(link_led(status));
    }

    fn on_scan_result(&self, scan: &ScanList) {
        debug!("scan results: {}", scan.to_json());
    }
}

impl SessionObserver for StatusMirror {
    fn on_status(&self, text: &str, status: SessionStatus) {
        self.display.show_text(text);
        self.display.set_indicator(session_led(status));
    }

    fn on_message(&self, topic: &str, payload: &str) {
        info!("topic='{topic}' payload='{payload}'");
    }

    fn on_connected(&self, session: &SessionManager) {
        if let Err(err) = session.publish(
            TOPIC_DEVICE_CONNECTION_STATUS,
            b"device connected",
            Qos::AtLeastOnce,
            false,
        ) {
            warn!("presence announcement failed: {err}");
        }
    }
}

/// Splits a `SSID|SECRET` payload at the first separator.
pub fn parse_switch_payload(payload: &str) -> Option<(&str, &str)> {
    let (ssid, pass) = payload.split_once('|')?;
    if ssid.is_empty() {
        return None;
    }
    Some((ssid, pass))
}

fn switch_failure_message(reason: DisconnectReason) -> &'static str {
    match reason {
        DisconnectReason::WrongSecret => "new wifi not connected - wrong password",
        DisconnectReason::NoTarget => "new wifi not connected - ssid not found",
        DisconnectReason::None | DisconnectReason::Other => "new wifi not connected - other reason",
    }
}

/// State shared by the inbound command handlers.
struct Commands {
    device: DeviceConfig,
    link: LinkManager,
    store: Arc<dyn CredentialStore>,
    display: Arc<dyn DisplaySurface>,
    platform: Arc<dyn DevicePlatform>,
}

impl Commands {
    fn table(self: &Arc<Self>) -> TopicTable {
        let display = self.clone();
        let scan = self.clone();
        let report = self.clone();
        let leds = self.clone();
        let switch = self.clone();

        TopicTable::new()
            .route(TOPIC_LCD_DISPLAY, move |_: &SessionManager, payload: &str| {
                display.display.show_text(payload)
            })
            .route(TOPIC_SCAN_WIFI_NETS, move |session: &SessionManager, _: &str| {
                scan.scan_networks(session)
            })
            .route(
                TOPIC_GET_DEVICE_CONNECTION_STATUS,
                move |session: &SessionManager, _: &str| report.connection_report(session),
            )
            .route(TOPIC_LEDS_TOGGLE, move |_: &SessionManager, payload: &str| {
                leds.toggle_led(payload)
            })
            .route(TOPIC_CONNECT_NEW_WIFI, move |session: &SessionManager, payload: &str| {
                switch.spawn_network_switch(session, payload)
            })
    }

    fn publish(&self, session: &SessionManager, topic: &str, text: &str) {
        if let Err(err) = session.publish(topic, text.as_bytes(), Qos::AtLeastOnce, false) {
            warn!("publish to `{topic}` failed: {err}");
        }
    }

    fn toggle_led(&self, command: &str) {
        let parsed = command
            .strip_suffix(" led on")
            .map(|color| (color, true))
            .or_else(|| command.strip_suffix(" led off").map(|color| (color, false)))
            .and_then(|(color, on)| Led::parse(color).map(|led| (led, on)));

        match parsed {
            Some((led, on)) => self.display.set_led(led, on),
            None => warn!("unknown LED command: {command}"),
        }
    }

    fn scan_networks(&self, session: &SessionManager) {
        match self.link.scan_sync() {
            Ok(scan) => {
                self.publish(session, TOPIC_SCAN_WIFI_RESULT, &scan.to_json());
                self.display.show_text("Wi-Fi scan done");
            }
            Err(err) => {
                error!("Wi-Fi scan failed: {err}");
                self.publish(session, TOPIC_SCAN_WIFI_RESULT, "[]");
            }
        }
    }

    fn connection_report(&self, session: &SessionManager) {
        let info = self.link.info();
        let lines = [
            format!("Device Name: {}", self.device.device_name),
            format!("Firmware: {}", self.device.firmware_version),
            format!("WiFi SSID: {}", info.ssid),
            format!("IP Address: {}", info.address_text()),
            format!("MAC Address: {}", info.hw_id_text()),
            format!("RSSI: {}", info.rssi_text()),
        ];
        for line in &lines {
            self.publish(session, TOPIC_DEVICE_CONNECTION_STATUS, line);
        }

        match self.store.get() {
            Ok(saved) => {
                for credential in saved.iter() {
                    let line = format!("ssid:{} pass:{}", credential.ssid, credential.pass);
                    self.publish(session, TOPIC_WIFI_CRED_LIST, &line);
                }
            }
            Err(err) => warn!("reading saved networks failed: {err}"),
        }
    }

    /// The switch blocks for tens of seconds, so it leaves the dispatch path.
    fn spawn_network_switch(self: &Arc<Self>, session: &SessionManager, payload: &str) {
        let commands = self.clone();
        let session = session.clone();
        let payload = payload.to_string();
        let spawned = thread::Builder::new()
            .name("change-network".to_string())
            .spawn(move || commands.switch_network(&session, &payload));
        if let Err(err) = spawned {
            error!("failed to spawn network switch: {err}");
        }
    }

    fn switch_network(&self, session: &SessionManager, payload: &str) {
        let Some((ssid, pass)) = parse_switch_payload(payload) else {
            error!("invalid change network payload");
            self.publish(session, TOPIC_WIFI_CONNECTION_STATUS, "invalid payload");
            return;
        };

        self.display.show_text("Switching Wi-Fi...");
        let switched = self.link.change_network(ssid, pass);

        match switched {
            Ok(()) if self.link.is_connected() => {
                if !self.wait_for_session(session) {
                    warn!("Wi-Fi switched but the session did not come back");
                    return;
                }
                self.publish(session, TOPIC_WIFI_CONNECTION_STATUS, "new wifi connected");
                self.save(ssid, pass);
                self.display.show_text("Wi-Fi switched OK");
                self.display.set_indicator(Led::Green);
            }
            outcome => {
                if !self.link.is_connected() {
                    self.display.show_text("Wi-Fi reconnection failed");
                    self.display.set_indicator(Led::Red);
                    return;
                }

                let reason = match outcome {
                    Err(err) => {
                        warn!("network switch failed: {err}");
                        err.reason
                    }
                    Ok(()) => DisconnectReason::Other,
                };

                if self.wait_for_session(session) {
                    warn!("session restored, new network rejected");
                    self.display.set_indicator(Led::Yellow);
                } else {
                    warn!("network rolled back, session not restored");
                }

                self.publish(
                    session,
                    TOPIC_WIFI_CONNECTION_STATUS,
                    switch_failure_message(reason),
                );
                if reason == DisconnectReason::WrongSecret {
                    self.evict(ssid);
                }
            }
        }
    }

    fn wait_for_session(&self, session: &SessionManager) -> bool {
        let mut waited = 0;
        while waited < self.device.session_wait_ms && !session.is_connected() {
            self.platform.sleep_ms(SESSION_POLL_MS);
            waited += SESSION_POLL_MS;
        }
        session.is_connected()
    }

    fn save(&self, ssid: &str, pass: &str) {
        match self.store.upsert(ssid, pass) {
            Ok(_) => {
                if let Ok(credential) = Credential::new(ssid, pass) {
                    self.link.remember(credential);
                }
            }
            Err(err) => warn!("saving `{ssid}` failed: {err}"),
        }
    }

    fn evict(&self, ssid: &str) {
        if let Err(err) = self.store.remove(ssid) {
            warn!("removing `{ssid}` failed: {err}");
        }
        self.link.forget(ssid);
    }
}

pub struct Orchestrator {
    config: RuntimeConfig,
    commands: Arc<Commands>,
    mirror: Arc<StatusMirror>,
    flags: Arc<ButtonFlags>,
    portal: Arc<dyn SetupPortal>,
    session: Mutex<Option<SessionManager>>,
    transport: Mutex<Option<Box<dyn MqttTransport>>>,
    outcome: BootOutcome,
}

impl Orchestrator {
    /// Brings the device up. Only a link manager failure aborts boot; every
    /// later failure leaves a running orchestrator with a degraded outcome.
    pub fn boot(
        config: RuntimeConfig,
        driver: Box<dyn WifiDriver>,
        transport: Box<dyn MqttTransport>,
        collaborators: Collaborators,
        flags: Arc<ButtonFlags>,
    ) -> Result<Self> {
        let Collaborators {
            store,
            display,
            platform,
            portal,
        } = collaborators;

        display.show_text(&format!("Program version {}", config.device.firmware_version));

        let saved = store.get()?;
        let mirror = Arc::new(StatusMirror {
            display: display.clone(),
        });
        let link = LinkManager::init(config.link.clone(), saved.clone(), driver, mirror.clone())
            .inspect_err(|_| display.show_text("Wi-Fi init failed!"))?;

        let mut orchestrator = Self {
            commands: Arc::new(Commands {
                device: config.device.clone(),
                link,
                store,
                display,
                platform,
            }),
            config,
            mirror,
            flags,
            portal,
            session: Mutex::new(None),
            transport: Mutex::new(Some(transport)),
            outcome: BootOutcome::Offline,
        };

        orchestrator.outcome = if saved.is_empty() {
            orchestrator.display().show_text("No Wi-Fi credentials");
            orchestrator.start_setup_access_point()?;
            BootOutcome::SetupMode
        } else {
            orchestrator.connect_saved()
        };

        info!("boot finished: {:?}", orchestrator.outcome);
        Ok(orchestrator)
    }

    fn connect_saved(&self) -> BootOutcome {
        if let Err(err) = self.link().first_connect() {
            warn!("no saved network joined: {err}");
            if self.link().scan_list().is_empty() {
                self.display().show_text("no available Wi-Fi found");
            } else {
                self.display().show_text("Wi-Fi connection error");
            }
            return BootOutcome::Offline;
        }

        match self.start_session() {
            Ok(()) => {
                self.display().show_text("Online");
                BootOutcome::Online
            }
            Err(err) => {
                error!("session start failed: {err}");
                self.display().show_text("MQTT connect failed!");
                self.display().set_indicator(Led::Red);
                BootOutcome::SessionUnavailable
            }
        }
    }

    fn session_config(&self) -> SessionConfig {
        let mut config = self.config.session.clone();
        if config.last_will.is_none() {
            config.last_will = Some(LastWill {
                topic: TOPIC_DEVICE_CONNECTION_STATUS.to_string(),
                message: "status changed".to_string(),
                qos: Qos::AtLeastOnce,
                retain: true,
            });
        }
        config
    }

    fn start_session(&self) -> Result<()> {
        let transport = self
            .transport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(Error::InvalidState("broker transport already used"))?;

        let session = SessionManager::init(
            self.session_config(),
            transport,
            self.mirror.clone(),
            self.commands.table(),
        )?;
        *self.session_slot() = Some(session.clone());
        session.start(None)
    }

    /// Consumes at most one pending gesture.
    pub fn tick(&self) {
        if self.flags.take_long_press() {
            self.factory_reset();
        } else if self.flags.take_triple_click() {
            if let Err(err) = self.enter_setup_mode() {
                error!("setup mode failed: {err}");
                self.display().show_text("Setup mode failed");
                self.display().set_indicator(Led::Red);
            }
        }
    }

    /// Ticks until `keep_running` returns false.
    pub fn run(&self, keep_running: impl Fn() -> bool) {
        while keep_running() {
            self.tick();
            self.commands
                .platform
                .sleep_ms(self.config.device.tick_interval_ms);
        }
    }

    pub fn factory_reset(&self) {
        self.display().show_text("Reset button pressed!");
        self.display().show_text("Erasing saved networks...");
        if let Err(err) = self.commands.store.clear() {
            error!("clearing saved networks failed: {err}");
        }
        self.display().show_text("Restarting...");
        self.commands.platform.restart();
    }

    pub fn enter_setup_mode(&self) -> Result<()> {
        self.display().show_text("Switching to AP mode...");

        let session = self.session_slot().clone();
        if let Some(session) = session {
            if let Err(err) = session.stop(None) {
                warn!("session stop before setup mode: {err}");
            }
        }

        self.link().full_driver_stop()?;
        self.commands.platform.sleep_ms(SETUP_SETTLE_MS);
        self.start_setup_access_point()
    }

    /// Releases the session and the link. The orchestrator stays usable only
    /// for queries afterwards.
    pub fn shutdown(&self) {
        if let Some(session) = self.session_slot().take() {
            session.deinit();
        }
        self.link().deinit();
        info!("orchestrator shut down");
    }

    fn start_setup_access_point(&self) -> Result<()> {
        let device = &self.config.device;
        self.link()
            .start_access_point(&device.setup_ap_ssid, &device.setup_ap_pass)?;
        self.display().show_text("Starting HTTP server...");
        self.portal.start(self.provisioner())?;
        self.display().show_text("connect to AP, insert wifi info");
        Ok(())
    }

    /// Credential intake bound to this device's link and store.
    pub fn provisioner(&self) -> Provisioner {
        Provisioner::new(
            self.config.device.device_name.clone(),
            self.link().clone(),
            self.commands.store.clone(),
            self.commands.display.clone(),
            self.commands.platform.clone(),
        )
    }

    pub fn outcome(&self) -> BootOutcome {
        self.outcome
    }

    pub fn link(&self) -> &LinkManager {
        &self.commands.link
    }

    pub fn session(&self) -> Option<SessionManager> {
        self.session_slot().clone()
    }

    fn display(&self) -> &dyn DisplaySurface {
        self.commands.display.as_ref()
    }

    fn session_slot(&self) -> MutexGuard<'_, Option<SessionManager>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        classifier::ButtonGesture,
        config::LinkConfig,
        provisioning::NetworkSubmission,
        sim::{SimulatedBroker, SimulatedNetwork, SimulatedRadio},
        store::MemoryCredentialStore,
        types::{CredentialList, LinkMode},
    };

    #[derive(Default)]
    struct RecordingDisplay {
        texts: Mutex<Vec<String>>,
        indicators: Mutex<Vec<Led>>,
        leds: Mutex<Vec<(Led, bool)>>,
    }

    impl RecordingDisplay {
        fn shown(&self, text: &str) -> bool {
            self.texts.lock().unwrap().iter().any(|shown| shown == text)
        }
    }

    impl DisplaySurface for RecordingDisplay {
        fn show_text(&self, text: &str) {
            self.texts.lock().unwrap().push(text.to_string());
        }

        fn set_indicator(&self, led: Led) {
            self.indicators.lock().unwrap().push(led);
        }

        fn set_led(&self, led: Led, on: bool) {
            self.leds.lock().unwrap().push((led, on));
        }
    }

    #[derive(Default)]
    struct TestPlatform {
        restarts: AtomicUsize,
        sleeps: Mutex<Vec<u64>>,
    }

    impl DevicePlatform for TestPlatform {
        fn restart(&self) {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }

        fn sleep_ms(&self, ms: u64) {
            self.sleeps.lock().unwrap().push(ms);
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[derive(Default)]
    struct RecordingPortal {
        provisioners: Mutex<Vec<Provisioner>>,
    }

    impl RecordingPortal {
        fn starts(&self) -> usize {
            self.provisioners.lock().unwrap().len()
        }

        fn last(&self) -> Provisioner {
            self.provisioners.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl SetupPortal for RecordingPortal {
        fn start(&self, provisioner: Provisioner) -> Result<()> {
            self.provisioners.lock().unwrap().push(provisioner);
            Ok(())
        }
    }

    struct Rig {
        orchestrator: Orchestrator,
        radio: SimulatedRadio,
        broker: SimulatedBroker,
        store: Arc<MemoryCredentialStore>,
        display: Arc<RecordingDisplay>,
        platform: Arc<TestPlatform>,
        portal: Arc<RecordingPortal>,
        flags: Arc<ButtonFlags>,
    }

    fn test_config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.link = LinkConfig {
            connect_timeout_ms: 2_000,
            stop_timeout_ms: 1_000,
            disconnect_timeout_ms: 500,
            start_timeout_ms: 500,
            max_reconnect_attempts: 2,
            reconnect_delay_ms: 10,
            ..LinkConfig::default()
        };
        config.session.connect_timeout_ms = 1_000;
        config.session.stop_timeout_ms = 500;
        config.device.session_wait_ms = 3_000;
        config
    }

    fn boot(saved: &[(&str, &str)], networks: Vec<SimulatedNetwork>) -> Rig {
        let mut list = CredentialList::new();
        for (ssid, pass) in saved {
            list.upsert(Credential::new(*ssid, *pass).unwrap());
        }

        let radio = SimulatedRadio::new(networks);
        let broker = SimulatedBroker::new();
        let store = Arc::new(MemoryCredentialStore::new(list));
        let display = Arc::new(RecordingDisplay::default());
        let platform = Arc::new(TestPlatform::default());
        let portal = Arc::new(RecordingPortal::default());
        let flags = Arc::new(ButtonFlags::new());

        let orchestrator = Orchestrator::boot(
            test_config(),
            Box::new(radio.clone()),
            Box::new(broker.clone()),
            Collaborators {
                store: store.clone(),
                display: display.clone(),
                platform: platform.clone(),
                portal: portal.clone(),
            },
            flags.clone(),
        )
        .unwrap();

        Rig {
            orchestrator,
            radio,
            broker,
            store,
            display,
            platform,
            portal,
            flags,
        }
    }

    fn home_and_office() -> Vec<SimulatedNetwork> {
        vec![
            SimulatedNetwork::new("home", "pw1", -40),
            SimulatedNetwork::new("office", "pw2", -60),
        ]
    }

    fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    fn saved_names(store: &MemoryCredentialStore) -> Vec<String> {
        store
            .get()
            .unwrap()
            .iter()
            .map(|credential| credential.ssid.clone())
            .collect()
    }

    #[test]
    fn switch_payload_splits_at_first_separator() {
        assert_eq!(parse_switch_payload("home|pw"), Some(("home", "pw")));
        assert_eq!(parse_switch_payload("home|p|w"), Some(("home", "p|w")));
        assert_eq!(parse_switch_payload("open|"), Some(("open", "")));
        assert_eq!(parse_switch_payload("|pw"), None);
        assert_eq!(parse_switch_payload("no separator"), None);
    }

    #[test]
    fn boot_without_credentials_starts_setup_access_point() {
        let rig = boot(&[], home_and_office());

        assert_eq!(rig.orchestrator.outcome(), BootOutcome::SetupMode);
        assert_eq!(rig.orchestrator.link().mode(), LinkMode::AccessPoint);
        let access_point = rig.radio.access_point().unwrap();
        assert_eq!(access_point.ssid, "esp32_setup");
        assert_eq!(access_point.pass, "setup1234");
        assert!(rig.orchestrator.session().is_none());
        assert!(rig.display.shown("No Wi-Fi credentials"));
        assert_eq!(rig.portal.starts(), 1);
        assert!(rig.display.shown("connect to AP, insert wifi info"));
    }

    #[test]
    fn setup_portal_saves_network_and_restarts() {
        let rig = boot(&[], home_and_office());
        let provisioner = rig.portal.last();

        provisioner
            .submit(&NetworkSubmission {
                ssid: "home".to_string(),
                pass: "pw1".to_string(),
            })
            .unwrap();
        provisioner.restart();

        assert_eq!(saved_names(&rig.store), vec!["home"]);
        assert_eq!(rig.platform.restarts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_portal_aborts_setup_boot() {
        struct BrokenPortal;

        impl SetupPortal for BrokenPortal {
            fn start(&self, _provisioner: Provisioner) -> Result<()> {
                Err(Error::Transport("port in use".to_string()))
            }
        }

        let result = Orchestrator::boot(
            test_config(),
            Box::new(SimulatedRadio::new(home_and_office())),
            Box::new(SimulatedBroker::new()),
            Collaborators {
                store: Arc::new(MemoryCredentialStore::default()),
                display: Arc::new(RecordingDisplay::default()),
                platform: Arc::new(TestPlatform::default()),
                portal: Arc::new(BrokenPortal),
            },
            Arc::new(ButtonFlags::new()),
        );

        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[test]
    fn boot_joins_saved_network_and_announces_presence() {
        let rig = boot(&[("home", "pw1")], home_and_office());

        assert_eq!(rig.orchestrator.outcome(), BootOutcome::Online);
        assert_eq!(rig.radio.associated().as_deref(), Some("home"));
        assert!(wait_until(Duration::from_secs(1), || {
            rig.broker
                .published_on(TOPIC_DEVICE_CONNECTION_STATUS)
                .contains(&"device connected".to_string())
        }));

        let topics: Vec<String> = rig
            .broker
            .subscriptions()
            .into_iter()
            .map(|(topic, qos)| {
                assert_eq!(qos, Qos::AtLeastOnce);
                topic
            })
            .collect();
        assert_eq!(
            topics,
            vec![
                TOPIC_LCD_DISPLAY,
                TOPIC_SCAN_WIFI_NETS,
                TOPIC_GET_DEVICE_CONNECTION_STATUS,
                TOPIC_LEDS_TOGGLE,
                TOPIC_CONNECT_NEW_WIFI,
            ]
        );

        let will = rig.broker.config().unwrap().last_will.unwrap();
        assert_eq!(will.topic, TOPIC_DEVICE_CONNECTION_STATUS);
        assert_eq!(will.message, "status changed");
        assert!(will.retain);
    }

    #[test]
    fn boot_with_nothing_in_range_reports_empty_scan() {
        let rig = boot(&[("home", "pw1")], Vec::new());

        assert_eq!(rig.orchestrator.outcome(), BootOutcome::Offline);
        assert!(rig.display.shown("no available Wi-Fi found"));
        assert!(rig.orchestrator.session().is_none());
    }

    #[test]
    fn boot_with_rejected_networks_reports_connection_error() {
        let rig = boot(&[("home", "stale")], home_and_office());

        assert_eq!(rig.orchestrator.outcome(), BootOutcome::Offline);
        assert!(rig.display.shown("Wi-Fi connection error"));
    }

    #[test]
    fn statuses_are_mirrored_with_indicator_colors() {
        let rig = boot(&[("home", "pw1")], home_and_office());

        assert!(rig.display.shown("Wi-Fi connected"));
        assert!(rig.display.shown("MQTT connected"));
        let indicators = rig.display.indicators.lock().unwrap().clone();
        assert!(indicators.contains(&Led::Green));
        assert!(indicators.contains(&Led::Yellow));
    }

    #[test]
    fn long_press_clears_store_and_restarts() {
        let rig = boot(&[("home", "pw1")], home_and_office());
        rig.flags.raise(ButtonGesture::LongPress);

        rig.orchestrator.tick();

        assert!(rig.store.get().unwrap().is_empty());
        assert_eq!(rig.platform.restarts.load(Ordering::SeqCst), 1);

        rig.orchestrator.tick();
        assert_eq!(rig.platform.restarts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn triple_click_switches_to_setup_mode() {
        let rig = boot(&[("home", "pw1")], home_and_office());
        rig.flags.raise(ButtonGesture::TripleClick);

        rig.orchestrator.tick();

        assert_eq!(rig.orchestrator.link().mode(), LinkMode::AccessPoint);
        assert!(rig.radio.access_point().is_some());
        assert!(!rig.orchestrator.link().is_connected());
        let session = rig.orchestrator.session().unwrap();
        assert!(!session.is_started());
        assert!(rig.platform.sleeps.lock().unwrap().contains(&SETUP_SETTLE_MS));
        assert_eq!(rig.platform.restarts.load(Ordering::SeqCst), 0);
        assert_eq!(rig.portal.starts(), 1);
        assert!(rig.portal.last().is_setup_mode());
    }

    #[test]
    fn display_and_led_commands_drive_the_surface() {
        let rig = boot(&[("home", "pw1")], home_and_office());

        rig.broker.inject(TOPIC_LCD_DISPLAY, "hello");
        rig.broker.inject(TOPIC_LEDS_TOGGLE, "red led on");
        rig.broker.inject(TOPIC_LEDS_TOGGLE, "yellow led off");
        rig.broker.inject(TOPIC_LEDS_TOGGLE, "purple led on");

        assert!(rig.display.shown("hello"));
        assert_eq!(
            rig.display.leds.lock().unwrap().clone(),
            vec![(Led::Red, true), (Led::Yellow, false)]
        );
    }

    #[test]
    fn scan_command_publishes_json_list() {
        let rig = boot(&[("home", "pw1")], home_and_office());

        rig.broker.inject(TOPIC_SCAN_WIFI_NETS, "");

        let results = rig.broker.published_on(TOPIC_SCAN_WIFI_RESULT);
        assert_eq!(results.len(), 1);
        assert!(results[0].contains(r#""ssid":"home""#));
        assert!(results[0].contains(r#""ssid":"office""#));
    }

    #[test]
    fn scan_command_publishes_empty_list_on_failure() {
        let rig = boot(&[("home", "pw1")], home_and_office());
        rig.radio.set_scan_failure(true);

        rig.broker.inject(TOPIC_SCAN_WIFI_NETS, "");

        assert_eq!(
            rig.broker.published_on(TOPIC_SCAN_WIFI_RESULT),
            vec!["[]".to_string()]
        );
    }

    #[test]
    fn connection_report_lists_link_and_saved_networks() {
        let rig = boot(&[("home", "pw1"), ("office", "pw2")], home_and_office());

        rig.broker.inject(TOPIC_GET_DEVICE_CONNECTION_STATUS, "");

        let report = rig.broker.published_on(TOPIC_DEVICE_CONNECTION_STATUS);
        for line in [
            "Device Name: connectivity-devkit",
            "WiFi SSID: home",
            "IP Address: 192.168.1.10",
            "MAC Address: 02:00:5E:10:20:30",
            "RSSI: -40",
        ] {
            assert!(report.contains(&line.to_string()), "missing `{line}`");
        }
        assert_eq!(
            rig.broker.published_on(TOPIC_WIFI_CRED_LIST),
            vec!["ssid:home pass:pw1".to_string(), "ssid:office pass:pw2".to_string()]
        );
    }

    #[test]
    fn switch_command_saves_new_network() {
        let rig = boot(&[("home", "pw1")], home_and_office());

        rig.broker.inject(TOPIC_CONNECT_NEW_WIFI, "office|pw2");

        assert!(wait_until(Duration::from_secs(5), || {
            !rig.broker.published_on(TOPIC_WIFI_CONNECTION_STATUS).is_empty()
        }));
        assert_eq!(
            rig.broker.published_on(TOPIC_WIFI_CONNECTION_STATUS),
            vec!["new wifi connected".to_string()]
        );
        assert_eq!(saved_names(&rig.store), vec!["home", "office"]);
        assert_eq!(rig.orchestrator.link().info().ssid, "office");
    }

    #[test]
    fn switch_command_with_wrong_secret_evicts_the_network() {
        let rig = boot(&[("home", "pw1"), ("office", "old")], home_and_office());

        rig.broker.inject(TOPIC_CONNECT_NEW_WIFI, "office|bad");

        assert!(wait_until(Duration::from_secs(5), || {
            !rig.broker.published_on(TOPIC_WIFI_CONNECTION_STATUS).is_empty()
        }));
        assert_eq!(
            rig.broker.published_on(TOPIC_WIFI_CONNECTION_STATUS),
            vec!["new wifi not connected - wrong password".to_string()]
        );
        assert_eq!(saved_names(&rig.store), vec!["home"]);
        assert_eq!(rig.orchestrator.link().info().ssid, "home");
        assert!(rig.orchestrator.link().credentials().get("office").is_none());
    }

    #[test]
    fn switch_command_to_absent_network_keeps_store() {
        let rig = boot(&[("home", "pw1")], home_and_office());

        rig.broker.inject(TOPIC_CONNECT_NEW_WIFI, "cafe|pw");

        assert!(wait_until(Duration::from_secs(5), || {
            !rig.broker.published_on(TOPIC_WIFI_CONNECTION_STATUS).is_empty()
        }));
        assert_eq!(
            rig.broker.published_on(TOPIC_WIFI_CONNECTION_STATUS),
            vec!["new wifi not connected - ssid not found".to_string()]
        );
        assert_eq!(saved_names(&rig.store), vec!["home"]);
    }

    #[test]
    fn switch_command_rejects_malformed_payload() {
        let rig = boot(&[("home", "pw1")], home_and_office());

        rig.broker.inject(TOPIC_CONNECT_NEW_WIFI, "missing separator");

        assert!(wait_until(Duration::from_secs(1), || {
            !rig.broker.published_on(TOPIC_WIFI_CONNECTION_STATUS).is_empty()
        }));
        assert_eq!(
            rig.broker.published_on(TOPIC_WIFI_CONNECTION_STATUS),
            vec!["invalid payload".to_string()]
        );
        assert_eq!(rig.radio.connect_attempts(), vec!["home".to_string()]);
    }

    #[test]
    fn run_stops_when_told() {
        let rig = boot(&[("home", "pw1")], home_and_office());
        let ticks = AtomicUsize::new(0);

        rig.orchestrator
            .run(|| ticks.fetch_add(1, Ordering::SeqCst) < 3);

        assert_eq!(ticks.load(Ordering::SeqCst), 4);
        let sleeps = rig.platform.sleeps.lock().unwrap().clone();
        assert_eq!(sleeps.iter().filter(|&&ms| ms == 200).count(), 3);
    }

    #[test]
    fn shutdown_releases_session_and_link() {
        let rig = boot(&[("home", "pw1")], home_and_office());
        assert_eq!(rig.orchestrator.outcome(), BootOutcome::Online);

        rig.orchestrator.shutdown();

        assert!(rig.orchestrator.session().is_none());
        assert!(!rig.broker.is_running());
        assert!(!rig.radio.is_started());
        assert!(!rig.orchestrator.link().is_connected());
    }
}
