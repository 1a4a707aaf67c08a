use serde::{Deserialize, Serialize};

use crate::types::Qos;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub active_min_ms: u32,
    pub active_max_ms: u32,
    pub channel: u8,
    pub show_hidden: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            active_min_ms: 50,
            active_max_ms: 120,
            channel: 0,
            show_hidden: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPointConfig {
    pub channel: u8,
    pub max_connections: u8,
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            channel: 6,
            max_connections: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub connect_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    pub start_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub listen_interval: u16,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub access_point: AccessPointConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            stop_timeout_ms: 10_000,
            disconnect_timeout_ms: 5_000,
            start_timeout_ms: 3_000,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 500,
            listen_interval: 3,
            scan: ScanConfig::default(),
            access_point: AccessPointConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    pub keepalive_sec: u16,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keepalive_sec: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastWill {
    pub topic: String,
    pub message: String,
    pub qos: Qos,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub broker_uri: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
    #[serde(default)]
    pub keep_alive: KeepAliveConfig,
    pub clean_session: bool,
    pub disable_auto_reconnect: bool,
    pub reconnect_timeout_ms: u64,
    #[serde(default)]
    pub last_will: Option<LastWill>,
    pub connect_timeout_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            broker_uri: "mqtt://127.0.0.1:1883".to_string(),
            username: String::new(),
            password: String::new(),
            client_id: "connectivity-device".to_string(),
            keep_alive: KeepAliveConfig::default(),
            clean_session: false,
            disable_auto_reconnect: false,
            reconnect_timeout_ms: 4_000,
            last_will: None,
            connect_timeout_ms: 15_000,
            stop_timeout_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_name: String,
    pub firmware_version: String,
    pub setup_ap_ssid: String,
    pub setup_ap_pass: String,
    pub tick_interval_ms: u64,
    pub session_wait_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: "connectivity-devkit".to_string(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            setup_ap_ssid: "esp32_setup".to_string(),
            setup_ap_pass: "setup1234".to_string(),
            tick_interval_ms: 200,
            session_wait_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.link.sanitize();
        self.session.sanitize();
        self.device.sanitize();
    }
}

impl LinkConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.connect_timeout_ms == 0 {
            self.connect_timeout_ms = defaults.connect_timeout_ms;
        }
        if self.stop_timeout_ms == 0 {
            self.stop_timeout_ms = defaults.stop_timeout_ms;
        }
        if self.disconnect_timeout_ms == 0 {
            self.disconnect_timeout_ms = defaults.disconnect_timeout_ms;
        }
        if self.start_timeout_ms == 0 {
            self.start_timeout_ms = defaults.start_timeout_ms;
        }
        self.max_reconnect_attempts = self.max_reconnect_attempts.max(1);

        self.access_point.channel = self.access_point.channel.clamp(1, 13);
        self.access_point.max_connections = self.access_point.max_connections.clamp(1, 10);

        if self.scan.active_min_ms > self.scan.active_max_ms {
            self.scan.active_min_ms = self.scan.active_max_ms;
        }
    }
}

impl SessionConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.connect_timeout_ms == 0 {
            self.connect_timeout_ms = defaults.connect_timeout_ms;
        }
        if self.stop_timeout_ms == 0 {
            self.stop_timeout_ms = defaults.stop_timeout_ms;
        }
        if self.reconnect_timeout_ms == 0 {
            self.reconnect_timeout_ms = defaults.reconnect_timeout_ms;
        }
        if self.keep_alive.keepalive_sec == 0 {
            self.keep_alive.keepalive_sec = defaults.keep_alive.keepalive_sec;
        }
        if self.client_id.is_empty() {
            self.client_id = defaults.client_id;
        }
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        self.tick_interval_ms = self.tick_interval_ms.clamp(10, 5_000);
        if self.setup_ap_ssid.is_empty() {
            self.setup_ap_ssid = Self::default().setup_ap_ssid;
        }
    }
}
