use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MAX_CREDENTIALS: usize = 15;
pub const MAX_NAME_BYTES: usize = 32;
pub const MAX_SECRET_BYTES: usize = 64;
pub const MAX_SCAN_ENTRIES: usize = 32;

/// 802.11 / driver disconnect reason codes the link manager classifies.
pub mod reason_code {
    pub const AUTH_EXPIRE: u16 = 2;
    pub const ASSOC_EXPIRE: u16 = 4;
    pub const ASSOC_LEAVE: u16 = 8;
    pub const FOUR_WAY_HANDSHAKE_TIMEOUT: u16 = 15;
    pub const BEACON_TIMEOUT: u16 = 200;
    pub const NO_AP_FOUND: u16 = 201;
    pub const AUTH_FAIL: u16 = 202;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub ssid: String,
    pub pass: String,
}

impl Credential {
    pub fn new(ssid: impl Into<String>, pass: impl Into<String>) -> Result<Self> {
        let credential = Self {
            ssid: ssid.into(),
            pass: pass.into(),
        };
        credential.validate()?;
        Ok(credential)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ssid.is_empty() {
            return Err(Error::InvalidArgument("network name is empty"));
        }
        if self.ssid.len() > MAX_NAME_BYTES {
            return Err(Error::InvalidArgument("network name longer than 32 bytes"));
        }
        if self.pass.len() > MAX_SECRET_BYTES {
            return Err(Error::InvalidArgument("secret longer than 64 bytes"));
        }
        Ok(())
    }
}

/// Ordered saved networks; names are unique and the list never exceeds
/// `MAX_CREDENTIALS` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Credential>", into = "Vec<Credential>")]
pub struct CredentialList {
    entries: Vec<Credential>,
}

impl CredentialList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the secret in place when the name exists, appends otherwise.
    /// Returns false when a new name does not fit.
    pub fn upsert(&mut self, credential: Credential) -> bool {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|entry| entry.ssid == credential.ssid)
        {
            existing.pass = credential.pass;
            return true;
        }

        if self.entries.len() >= MAX_CREDENTIALS {
            return false;
        }

        self.entries.push(credential);
        true
    }

    /// Removes `ssid`; the remaining entries keep their insertion order.
    pub fn remove(&mut self, ssid: &str) -> bool {
        match self.entries.iter().position(|entry| entry.ssid == ssid) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, ssid: &str) -> Option<&Credential> {
        self.entries.iter().find(|entry| entry.ssid == ssid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl From<Vec<Credential>> for CredentialList {
    fn from(entries: Vec<Credential>) -> Self {
        let mut list = Self::new();
        for entry in entries {
            if entry.validate().is_err() {
                continue;
            }
            if !list.upsert(entry) {
                break;
            }
        }
        list
    }
}

impl From<CredentialList> for Vec<Credential> {
    fn from(list: CredentialList) -> Self {
        list.entries
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEntry {
    pub ssid: String,
    pub rssi: i8,
}

/// Result of one scan pass: unique names, strongest signal kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanList {
    entries: Vec<ScanEntry>,
}

impl ScanList {
    pub fn from_records(records: impl IntoIterator<Item = ScanEntry>) -> Self {
        let mut list = Self::default();
        for record in records {
            list.insert(record);
        }
        list
    }

    pub fn insert(&mut self, record: ScanEntry) {
        if record.ssid.is_empty() {
            return;
        }

        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|entry| entry.ssid == record.ssid)
        {
            existing.rssi = existing.rssi.max(record.rssi);
            return;
        }

        if self.entries.len() < MAX_SCAN_ENTRIES {
            self.entries.push(record);
        }
    }

    pub fn contains(&self, ssid: &str) -> bool {
        self.entries.iter().any(|entry| entry.ssid == ssid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScanEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.entries).unwrap_or_else(|_| "[]".to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub ssid: String,
    pub pass: String,
    pub address: Option<Ipv4Addr>,
    pub hw_id: Option<[u8; 6]>,
    pub rssi: Option<i8>,
}

impl LinkInfo {
    pub fn address_text(&self) -> String {
        self.address.map(|ip| ip.to_string()).unwrap_or_default()
    }

    pub fn hw_id_text(&self) -> String {
        match self.hw_id {
            Some(mac) => format_mac(&mac),
            None => String::new(),
        }
    }

    pub fn rssi_text(&self) -> String {
        match self.rssi {
            Some(rssi) => rssi.to_string(),
            None => "N/A".to_string(),
        }
    }
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    #[default]
    None,
    Station,
    AccessPoint,
}

impl LinkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Station => "station",
            Self::AccessPoint => "access_point",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    #[default]
    None,
    WrongSecret,
    NoTarget,
    Other,
}

impl DisconnectReason {
    pub fn from_reason_code(code: u16) -> Self {
        match code {
            reason_code::AUTH_FAIL
            | reason_code::AUTH_EXPIRE
            | reason_code::FOUR_WAY_HANDSHAKE_TIMEOUT
            | reason_code::ASSOC_EXPIRE => Self::WrongSecret,
            reason_code::NO_AP_FOUND => Self::NoTarget,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::WrongSecret => "wrong_secret",
            Self::NoTarget => "no_target",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
    None,
}

impl LinkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Disconnected => "DISCONNECTED",
            Self::Error => "ERROR",
            Self::None => "NONE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
    None,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Disconnected => "DISCONNECTED",
            Self::Error => "ERROR",
            Self::None => "NONE",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}
