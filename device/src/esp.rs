use core::{cell::UnsafeCell, convert::TryInto, ffi::c_void};
use std::{
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};
use esp_idf_svc::{
    eventloop::{EspSubscription, EspSystemEventLoop, System},
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    netif::IpEvent,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::{
        config::{ScanConfig as EspScanConfig, ScanType},
        EspWifi, WifiEvent,
    },
};
use log::{debug, info, warn};

use connectivity_common::{
    config::ScanConfig,
    link::AccessPointSettings,
    provisioning::{http_status, parse_form, MAX_FORM_BYTES, SETUP_PAGE},
    store::upsert_into,
    types::ScanEntry,
    ButtonClassifier, ButtonFlags, ButtonLine, Collaborators, Credential, CredentialList,
    CredentialStore, DevicePlatform, DisplaySurface, DriverError, Error, Led, LinkEvent,
    LinkEventSink, MqttTransport, NetworkSubmission, Orchestrator, Provisioner, Qos,
    RuntimeConfig, SessionConfig, SessionEvent, SessionEventSink, SetupPortal, TransportError,
    WifiDriver,
};

const NVS_NAMESPACE: &str = "connectivity";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_CREDENTIALS_KEY: &str = "wifi_creds";
const NVS_BUFFER_BYTES: usize = 4096;

const GREEN_LED_PIN: i32 = 1;
const YELLOW_LED_PIN: i32 = 3;
const RED_LED_PIN: i32 = 5;
const BUTTON_PIN: i32 = 0;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    info!(
        "NVS config loaded: broker=`{}`, client=`{}`",
        runtime.session.broker_uri, runtime.session.client_id
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))
        .context("wifi driver init failed")?;
    let driver = EspWifiDriver {
        wifi,
        sys_loop,
        subscriptions: Vec::new(),
    };

    let flags = Arc::new(ButtonFlags::new());
    install_button_isr(BUTTON_PIN, flags.clone()).context("button interrupt setup failed")?;

    let collaborators = Collaborators {
        store: Arc::new(NvsCredentialStore { nvs }),
        display: Arc::new(LedDisplay::new()),
        platform: Arc::new(EspPlatform),
        portal: Arc::new(EspSetupPortal::default()),
    };

    let orchestrator = Orchestrator::boot(
        runtime,
        Box::new(driver),
        Box::new(EspMqttTransport::default()),
        collaborators,
        flags,
    )
    .context("device boot failed")?;
    info!("device up: {:?}", orchestrator.outcome());

    orchestrator.run(|| true);
    Ok(())
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStore {
    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self) -> anyhow::Result<EspNvs<NvsDefault>> {
        Ok(EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?)
    }

    fn read_str(&self, key: &str) -> anyhow::Result<Option<String>> {
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; NVS_BUFFER_BYTES];
        Ok(nvs.get_str(key, &mut buffer)?.map(str::to_string))
    }

    fn write_str(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut nvs = self.open()?;
        nvs.set_str(key, value)?;
        Ok(())
    }

    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.guard();
        match self.read_str(NVS_RUNTIME_KEY)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(&value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

/// Saved networks as one JSON string in NVS.
struct NvsCredentialStore {
    nvs: NvsStore,
}

impl NvsCredentialStore {
    fn read(&self) -> connectivity_common::Result<CredentialList> {
        let raw = self.nvs.read_str(NVS_CREDENTIALS_KEY).map_err(storage_error)?;
        match raw {
            Some(value) => serde_json::from_str(&value).map_err(storage_error),
            None => Ok(CredentialList::default()),
        }
    }

    fn write(&self, list: &CredentialList) -> connectivity_common::Result<()> {
        let payload = serde_json::to_string(list).map_err(storage_error)?;
        self.nvs
            .write_str(NVS_CREDENTIALS_KEY, &payload)
            .map_err(storage_error)
    }
}

fn storage_error(err: impl core::fmt::Display) -> Error {
    Error::Storage(format!("nvs: {err:#}"))
}

impl CredentialStore for NvsCredentialStore {
    fn get(&self) -> connectivity_common::Result<CredentialList> {
        let _guard = self.nvs.guard();
        self.read()
    }

    fn upsert(&self, ssid: &str, pass: &str) -> connectivity_common::Result<bool> {
        let _guard = self.nvs.guard();
        let mut list = self.read()?;
        let stored = upsert_into(&mut list, ssid, pass)?;
        if stored {
            self.write(&list)?;
        }
        Ok(stored)
    }

    fn remove(&self, ssid: &str) -> connectivity_common::Result<bool> {
        let _guard = self.nvs.guard();
        let mut list = self.read()?;
        let removed = list.remove(ssid);
        if removed {
            self.write(&list)?;
        }
        Ok(removed)
    }

    fn clear(&self) -> connectivity_common::Result<()> {
        let _guard = self.nvs.guard();
        self.write(&CredentialList::default())
    }
}

struct EspWifiDriver {
    wifi: EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
    subscriptions: Vec<EspSubscription<'static, System>>,
}

fn driver_error(context: &str, err: impl core::fmt::Display) -> DriverError {
    DriverError::new(format!("{context}: {err}"))
}

fn esp_check(context: &str, rc: esp_idf_svc::sys::esp_err_t) -> Result<(), DriverError> {
    if rc == esp_idf_svc::sys::ESP_OK {
        Ok(())
    } else {
        Err(DriverError::new(format!("{context} failed: esp_err_t={rc}")))
    }
}

impl WifiDriver for EspWifiDriver {
    fn register(&mut self, sink: LinkEventSink) -> Result<(), DriverError> {
        let wifi_sink = sink.clone();
        let wifi_events = self
            .sys_loop
            .subscribe::<WifiEvent, _>(move |event| {
                let mapped = match event {
                    WifiEvent::StaStarted | WifiEvent::ApStarted => Some(LinkEvent::Started),
                    WifiEvent::StaStopped | WifiEvent::ApStopped => Some(LinkEvent::Stopped),
                    WifiEvent::ScanDone(_) => Some(LinkEvent::ScanDone),
                    WifiEvent::StaDisconnected(disconnected) => Some(LinkEvent::Disconnected {
                        reason_code: u16::from(disconnected.reason),
                    }),
                    _ => None,
                };
                if let Some(event) = mapped {
                    wifi_sink.dispatch(event);
                }
            })
            .map_err(|err| driver_error("wifi event subscription", err))?;

        let ip_events = self
            .sys_loop
            .subscribe::<IpEvent, _>(move |event| {
                if let IpEvent::DhcpIpAssigned(assignment) = event {
                    sink.dispatch(LinkEvent::GotAddress {
                        address: assignment.ip(),
                    });
                }
            })
            .map_err(|err| driver_error("ip event subscription", err))?;

        self.subscriptions = vec![wifi_events, ip_events];
        Ok(())
    }

    fn unregister(&mut self) {
        self.subscriptions.clear();
    }

    fn enter_station_mode(&mut self) -> Result<(), DriverError> {
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration::default()))
            .map_err(|err| driver_error("station mode", err))
    }

    fn set_station_config(
        &mut self,
        credential: &Credential,
        listen_interval: u16,
    ) -> Result<(), DriverError> {
        let auth_method = if credential.pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: credential
                    .ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| DriverError::new("wifi ssid too long"))?,
                password: credential
                    .pass
                    .as_str()
                    .try_into()
                    .map_err(|_| DriverError::new("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(|err| driver_error("station config", err))?;

        // ClientConfiguration has no listen interval; patch the raw config.
        let mut raw = esp_idf_svc::sys::wifi_config_t::default();
        let interface = esp_idf_svc::sys::wifi_interface_t_WIFI_IF_STA;
        esp_check("esp_wifi_get_config", unsafe {
            esp_idf_svc::sys::esp_wifi_get_config(interface, &mut raw)
        })?;
        unsafe { raw.sta.listen_interval = listen_interval };
        esp_check("esp_wifi_set_config", unsafe {
            esp_idf_svc::sys::esp_wifi_set_config(interface, &mut raw)
        })
    }

    fn enter_access_point_mode(&mut self, settings: &AccessPointSettings) -> Result<(), DriverError> {
        let auth_method = if settings.is_open() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: settings
                    .ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| DriverError::new("access point ssid too long"))?,
                password: settings
                    .pass
                    .as_str()
                    .try_into()
                    .map_err(|_| DriverError::new("access point password too long"))?,
                auth_method,
                channel: settings.channel,
                max_connections: u16::from(settings.max_connections),
                ..Default::default()
            }))
            .map_err(|err| driver_error("access point config", err))
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.wifi.start().map_err(|err| driver_error("wifi start", err))
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.wifi.stop().map_err(|err| driver_error("wifi stop", err))
    }

    fn connect(&mut self) -> Result<(), DriverError> {
        self.wifi
            .connect()
            .map_err(|err| driver_error("wifi connect", err))
    }

    fn disconnect(&mut self) -> Result<(), DriverError> {
        self.wifi
            .disconnect()
            .map_err(|err| driver_error("wifi disconnect", err))
    }

    fn scan(&mut self, config: &ScanConfig) -> Result<Vec<ScanEntry>, DriverError> {
        let scan_config = EspScanConfig {
            channel: (config.channel != 0).then_some(config.channel),
            scan_type: ScanType::Active {
                min: Duration::from_millis(u64::from(config.active_min_ms)),
                max: Duration::from_millis(u64::from(config.active_max_ms)),
            },
            show_hidden: config.show_hidden,
            ..Default::default()
        };
        self.wifi
            .start_scan(&scan_config, true)
            .map_err(|err| driver_error("wifi scan", err))?;
        let records = self
            .wifi
            .get_scan_result()
            .map_err(|err| driver_error("wifi scan results", err))?;

        Ok(records
            .into_iter()
            .map(|record| ScanEntry {
                ssid: record.ssid.as_str().to_string(),
                rssi: record.signal_strength,
            })
            .collect())
    }

    fn release(&mut self) -> Result<(), DriverError> {
        // EspWifi owns the driver for the program lifetime; stop already
        // powered the radio down.
        debug!("wifi release");
        Ok(())
    }

    fn hw_id(&self) -> Option<[u8; 6]> {
        self.wifi.sta_netif().get_mac().ok()
    }

    fn rssi(&self) -> Option<i8> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info.rssi)
    }
}

fn esp_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Broker transport over the esp-idf MQTT client. The client connects as
/// soon as it is created, so `start` creates it and `stop` drops it.
#[derive(Default)]
struct EspMqttTransport {
    config: Option<SessionConfig>,
    sink: Option<SessionEventSink>,
    client: Option<EspMqttClient<'static>>,
}

impl EspMqttTransport {
    fn client(&mut self) -> Result<&mut EspMqttClient<'static>, TransportError> {
        self.client
            .as_mut()
            .ok_or_else(|| TransportError::new("mqtt client not started"))
    }
}

impl MqttTransport for EspMqttTransport {
    fn open(&mut self, config: &SessionConfig, sink: SessionEventSink) -> Result<(), TransportError> {
        self.config = Some(config.clone());
        self.sink = Some(sink);
        Ok(())
    }

    fn start(&mut self) -> Result<(), TransportError> {
        let (config, sink) = match (&self.config, &self.sink) {
            (Some(config), Some(sink)) => (config, sink.clone()),
            _ => return Err(TransportError::new("mqtt transport not opened")),
        };

        let lwt = config.last_will.as_ref().map(|will| LwtConfiguration {
            topic: will.topic.as_str(),
            payload: will.message.as_bytes(),
            qos: esp_qos(will.qos),
            retain: will.retain,
        });
        let conf = MqttClientConfiguration {
            client_id: Some(config.client_id.as_str()),
            username: (!config.username.is_empty()).then_some(config.username.as_str()),
            password: (!config.password.is_empty()).then_some(config.password.as_str()),
            keep_alive_interval: config
                .keep_alive
                .enabled
                .then(|| Duration::from_secs(u64::from(config.keep_alive.keepalive_sec))),
            disable_clean_session: !config.clean_session,
            reconnect_timeout: (!config.disable_auto_reconnect)
                .then(|| Duration::from_millis(config.reconnect_timeout_ms)),
            lwt,
            ..Default::default()
        };

        let (client, connection) = EspMqttClient::new(config.broker_uri.as_str(), &conf)
            .map_err(|err| TransportError::new(format!("mqtt client: {err}")))?;
        spawn_mqtt_receiver(connection, sink)?;
        self.client = Some(client);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        // Dropping the client ends the connection; the receiver reports it.
        self.client = None;
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        self.client()?
            .subscribe(topic, esp_qos(qos))
            .map(|_| ())
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
            .enqueue(topic, esp_qos(qos), retain, payload)
            .map(Some)
            .map_err(|err| TransportError::new(format!("mqtt publish `{topic}`: {err}")))
    }

    fn close(&mut self) {
        self.client = None;
        self.sink = None;
        self.config = None;
    }
}

fn spawn_mqtt_receiver(
    mut connection: EspMqttConnection,
    sink: SessionEventSink,
) -> Result<(), TransportError> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            let mut connected = false;
            while let Ok(event) = connection.next() {
                match event.payload() {
                    EventPayload::Connected(_) => {
                        connected = true;
                        sink.dispatch(SessionEvent::Connected);
                    }
                    EventPayload::Disconnected => {
                        if connected {
                            connected = false;
                            sink.dispatch(SessionEvent::Disconnected);
                        }
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => sink.dispatch(SessionEvent::Message {
                        topic: topic.to_string(),
                        payload: data.to_vec(),
                    }),
                    EventPayload::Error(err) => warn!("mqtt error event: {err:?}"),
                    _ => {}
                }
            }
            if connected {
                sink.dispatch(SessionEvent::Disconnected);
            }
            info!("mqtt connection closed");
        })
        .map(|_| ())
        .map_err(|err| TransportError::new(format!("mqtt receiver thread: {err}")))
}

/// Text goes to the log; the three indicator LEDs are driven directly.
struct LedDisplay {
    leds: Mutex<Vec<(Led, PinDriver<'static, AnyOutputPin, Output>)>>,
}

impl LedDisplay {
    fn new() -> Self {
        let mut leds = Vec::new();
        for (led, pin) in [
            (Led::Green, GREEN_LED_PIN),
            (Led::Yellow, YELLOW_LED_PIN),
            (Led::Red, RED_LED_PIN),
        ] {
            match unsafe { PinDriver::output(AnyOutputPin::new(pin)) } {
                Ok(mut driver) => {
                    if let Err(err) = driver.set_low() {
                        warn!("failed to clear {led:?} LED: {err}");
                    }
                    leds.push((led, driver));
                }
                Err(err) => warn!("{led:?} LED unavailable on GPIO{pin}: {err}"),
            }
        }
        Self {
            leds: Mutex::new(leds),
        }
    }

    fn drive(&self, lit: impl Fn(Led) -> Option<bool>) {
        let mut leds = self
            .leds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (led, pin) in leds.iter_mut() {
            let result = match lit(*led) {
                Some(true) => pin.set_high(),
                Some(false) => pin.set_low(),
                None => continue,
            };
            if let Err(err) = result {
                warn!("failed to drive {led:?} LED: {err}");
            }
        }
    }
}

impl DisplaySurface for LedDisplay {
    fn show_text(&self, text: &str) {
        info!(target: "display", "{text}");
    }

    fn set_indicator(&self, led: Led) {
        self.drive(|candidate| Some(candidate == led));
    }

    fn set_led(&self, led: Led, on: bool) {
        self.drive(|candidate| (candidate == led).then_some(on));
    }
}

struct EspPlatform;

impl DevicePlatform for EspPlatform {
    fn restart(&self) {
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

/// Setup page on the access point's HTTP server. The server lives until the
/// provisioning restart.
#[derive(Default)]
struct EspSetupPortal {
    server: Mutex<Option<EspHttpServer<'static>>>,
}

impl SetupPortal for EspSetupPortal {
    fn start(&self, provisioner: Provisioner) -> connectivity_common::Result<()> {
        let mut server = self
            .server
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if server.is_some() {
            debug!("setup portal already running");
            return Ok(());
        }

        let created = create_setup_server(provisioner)
            .map_err(|err| Error::Transport(format!("setup portal: {err:#}")))?;
        *server = Some(created);
        info!("setup portal started");
        Ok(())
    }
}

fn create_setup_server(provisioner: Provisioner) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, |req| {
        req.into_ok_response()?.write_all(SETUP_PAGE.as_bytes())?;
        Ok(())
    })?;

    {
        let provisioner = provisioner.clone();
        server.fn_handler::<anyhow::Error, _>("/set", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Some(submission) = core::str::from_utf8(&body).ok().and_then(parse_form) else {
                return write_text(req, 400, "expected ssid and pass form fields");
            };
            match provisioner.submit(&submission) {
                Ok(()) => {
                    write_text(req, 200, "Saved! Rebooting...")?;
                    spawn_restart(&provisioner);
                    Ok(())
                }
                Err(err) => write_text(req, http_status(&err), &err.to_string()),
            }
        })?;
    }

    {
        let provisioner = provisioner.clone();
        server.fn_handler::<anyhow::Error, _>("/api/network", Method::Get, move |req| {
            match provisioner.view() {
                Ok(view) => write_json(req, 200, &view),
                Err(err) => write_error(req, http_status(&err), &err.to_string()),
            }
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/network", Method::Put, move |mut req| {
        let body = read_request_body(&mut req)?;
        let submission: NetworkSubmission = match serde_json::from_slice(&body) {
            Ok(submission) => submission,
            Err(err) => return write_error(req, 400, &format!("invalid network payload: {err}")),
        };
        match provisioner.submit(&submission) {
            Ok(()) => {
                let payload = serde_json::json!({ "saved": submission.ssid, "restarting": true });
                write_json(req, 200, &payload)?;
                spawn_restart(&provisioner);
                Ok(())
            }
            Err(err) => write_error(req, http_status(&err), &err.to_string()),
        }
    })?;

    Ok(server)
}

fn spawn_restart(provisioner: &Provisioner) {
    let provisioner = provisioner.clone();
    if let Err(err) = thread::Builder::new()
        .name("prov-restart".into())
        .spawn(move || provisioner.restart())
    {
        warn!("failed to spawn restart thread: {err}");
    }
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_FORM_BYTES {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_text(
    req: Request<&mut EspHttpConnection<'_>>,
    status: u16,
    message: &str,
) -> anyhow::Result<()> {
    req.into_response(status, None, &[("Content-Type", "text/plain; charset=utf-8")])?
        .write_all(message.as_bytes())?;
    Ok(())
}

fn write_json<T: serde::Serialize>(
    req: Request<&mut EspHttpConnection<'_>>,
    status: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: Request<&mut EspHttpConnection<'_>>,
    status: u16,
    message: &str,
) -> anyhow::Result<()> {
    write_json(req, status, &serde_json::json!({ "error": message }))
}

/// Interrupt-side state. Only the GPIO ISR touches `classifier`.
struct ButtonIsr {
    pin: i32,
    classifier: UnsafeCell<ButtonClassifier>,
    flags: Arc<ButtonFlags>,
}

/// The ISR service dispatches per pin, so every call is for this line.
struct GpioLine {
    pin: i32,
}

impl ButtonLine for GpioLine {
    fn take_pending(&mut self) -> bool {
        true
    }

    fn is_high(&self) -> bool {
        unsafe { esp_idf_svc::sys::gpio_get_level(self.pin) != 0 }
    }
}

unsafe extern "C" fn button_isr(arg: *mut c_void) {
    let isr = &*(arg as *const ButtonIsr);
    let now_us = u64::try_from(esp_idf_svc::sys::esp_timer_get_time()).unwrap_or(0);
    let classifier = &mut *isr.classifier.get();
    classifier.service(&mut GpioLine { pin: isr.pin }, now_us, &isr.flags);
}

fn install_button_isr(pin: i32, flags: Arc<ButtonFlags>) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::gpio_config_t {
        pin_bit_mask: 1_u64 << pin,
        mode: esp_idf_svc::sys::gpio_mode_t_GPIO_MODE_INPUT,
        pull_up_en: esp_idf_svc::sys::gpio_pullup_t_GPIO_PULLUP_ENABLE,
        pull_down_en: esp_idf_svc::sys::gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
        intr_type: esp_idf_svc::sys::gpio_int_type_t_GPIO_INTR_ANYEDGE,
        ..Default::default()
    };
    let rc = unsafe { esp_idf_svc::sys::gpio_config(&config) };
    if rc != esp_idf_svc::sys::ESP_OK {
        return Err(anyhow!("gpio_config failed with code {rc}"));
    }

    let rc = unsafe { esp_idf_svc::sys::gpio_install_isr_service(0) };
    if rc != esp_idf_svc::sys::ESP_OK && rc != esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Err(anyhow!("gpio_install_isr_service failed with code {rc}"));
    }

    // Lives for the program lifetime; the handler is never removed.
    let isr: &'static ButtonIsr = Box::leak(Box::new(ButtonIsr {
        pin,
        classifier: UnsafeCell::new(ButtonClassifier::new()),
        flags,
    }));
    let rc = unsafe {
        esp_idf_svc::sys::gpio_isr_handler_add(
            pin,
            Some(button_isr),
            isr as *const ButtonIsr as *mut c_void,
        )
    };
    if rc != esp_idf_svc::sys::ESP_OK {
        return Err(anyhow!("gpio_isr_handler_add failed with code {rc}"));
    }
    info!("button interrupt armed on GPIO{pin}");
    Ok(())
}
