//! Credential intake while the setup access point is up.
//!
//! The HTTP surface differs per platform; both hand the submitted network to
//! a [`Provisioner`], which validates it, persists it and reboots the device
//! so the next boot joins it.

use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    link::LinkManager,
    orchestrator::{DevicePlatform, DisplaySurface, Led},
    store::CredentialStore,
    types::{Credential, LinkMode},
};

pub const RESTART_DELAY_MS: u64 = 1_000;
pub const MAX_FORM_BYTES: usize = 512;

pub const SETUP_PAGE: &str = r#"<!doctype html>
<html>
<head><meta name="viewport" content="width=device-width, initial-scale=1"><title>Wi-Fi setup</title></head>
<body>
<h1>Wi-Fi setup</h1>
<form method="post" action="/set">
<label>SSID <input name="ssid" maxlength="32" required></label><br>
<label>Password <input name="pass" type="password" maxlength="64"></label><br>
<button type="submit">Save</button>
</form>
</body>
</html>
"#;

/// A network submitted through the setup page or the JSON endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetworkSubmission {
    pub ssid: String,
    #[serde(default)]
    pub pass: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningView {
    pub device_name: String,
    pub setup_mode: bool,
    pub saved_networks: Vec<String>,
}

/// Serves the setup page while the access point is up. Starting an already
/// running portal is a no-op.
pub trait SetupPortal: Send + Sync {
    fn start(&self, provisioner: Provisioner) -> Result<()>;
}

/// HTTP status for a rejected submission.
pub fn http_status(err: &Error) -> u16 {
    match err {
        Error::InvalidArgument(_) => 400,
        Error::InvalidState(_) => 409,
        Error::ResourceExhausted(_) => 507,
        _ => 500,
    }
}

/// Decodes an `application/x-www-form-urlencoded` body carrying `ssid` and
/// `pass`. A missing `pass` means an open network.
pub fn parse_form(body: &str) -> Option<NetworkSubmission> {
    let mut ssid = None;
    let mut pass = None;
    for pair in body.trim().split('&') {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        match name {
            "ssid" => ssid = Some(decode_component(value)?),
            "pass" => pass = Some(decode_component(value)?),
            _ => {}
        }
    }
    Some(NetworkSubmission {
        ssid: ssid?,
        pass: pass.unwrap_or_default(),
    })
}

fn decode_component(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => decoded.push(b' '),
            b'%' => {
                let hex = raw.get(index + 1..index + 3)?;
                decoded.push(u8::from_str_radix(hex, 16).ok()?);
                index += 2;
            }
            byte => decoded.push(byte),
        }
        index += 1;
    }
    String::from_utf8(decoded).ok()
}

#[derive(Clone)]
pub struct Provisioner {
    device_name: String,
    link: LinkManager,
    store: Arc<dyn CredentialStore>,
    display: Arc<dyn DisplaySurface>,
    platform: Arc<dyn DevicePlatform>,
}

impl Provisioner {
    pub fn new(
        device_name: impl Into<String>,
        link: LinkManager,
        store: Arc<dyn CredentialStore>,
        display: Arc<dyn DisplaySurface>,
        platform: Arc<dyn DevicePlatform>,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            link,
            store,
            display,
            platform,
        }
    }

    pub fn is_setup_mode(&self) -> bool {
        self.link.mode() == LinkMode::AccessPoint
    }

    pub fn view(&self) -> Result<ProvisioningView> {
        let saved = self.store.get()?;
        Ok(ProvisioningView {
            device_name: self.device_name.clone(),
            setup_mode: self.is_setup_mode(),
            saved_networks: saved.iter().map(|credential| credential.ssid.clone()).collect(),
        })
    }

    /// Validates and persists `submission`. Only accepted while the setup
    /// access point is running.
    pub fn submit(&self, submission: &NetworkSubmission) -> Result<()> {
        if !self.is_setup_mode() {
            return Err(Error::InvalidState("setup access point is not running"));
        }

        let credential = Credential::new(submission.ssid.as_str(), submission.pass.as_str())?;
        if !self.store.upsert(&credential.ssid, &credential.pass)? {
            return Err(Error::ResourceExhausted(
                "saved network list is full".to_string(),
            ));
        }
        info!("provisioned network `{}`", credential.ssid);
        self.link.remember(credential);

        self.display.show_text("New WIFI set successfully !");
        self.display.set_indicator(Led::Green);
        Ok(())
    }

    /// Reboots so the next boot joins the saved networks.
    pub fn restart(&self) {
        self.display.show_text("Rebooting");
        self.platform.sleep_ms(RESTART_DELAY_MS);
        warn!("restarting after provisioning");
        self.platform.restart();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::LinkConfig,
        link::LinkObserver,
        sim::{SimulatedNetwork, SimulatedRadio},
        store::MemoryCredentialStore,
        types::{CredentialList, LinkStatus, ScanList, MAX_CREDENTIALS},
    };

    struct Quiet;

    impl LinkObserver for Quiet {
        fn on_status(&self, _text: &str, _status: LinkStatus) {}

        fn on_scan_result(&self, _scan: &ScanList) {}
    }

    #[derive(Default)]
    struct Panel {
        texts: Mutex<Vec<String>>,
    }

    impl DisplaySurface for Panel {
        fn show_text(&self, text: &str) {
            self.texts.lock().unwrap().push(text.to_string());
        }

        fn set_indicator(&self, _led: Led) {}

        fn set_led(&self, _led: Led, _on: bool) {}
    }

    #[derive(Default)]
    struct CountingPlatform {
        restarts: AtomicUsize,
    }

    impl DevicePlatform for CountingPlatform {
        fn restart(&self) {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }

        fn sleep_ms(&self, _ms: u64) {}
    }

    struct Rig {
        provisioner: Provisioner,
        link: LinkManager,
        store: Arc<MemoryCredentialStore>,
        panel: Arc<Panel>,
        platform: Arc<CountingPlatform>,
    }

    fn rig(access_point: bool) -> Rig {
        let radio = SimulatedRadio::new(vec![SimulatedNetwork::new("home", "pw1", -40)]);
        let link = LinkManager::init(
            LinkConfig {
                start_timeout_ms: 500,
                stop_timeout_ms: 500,
                ..LinkConfig::default()
            },
            CredentialList::new(),
            Box::new(radio),
            Arc::new(Quiet),
        )
        .unwrap();
        if access_point {
            link.start_access_point("esp32_setup", "setup1234").unwrap();
        }

        let store = Arc::new(MemoryCredentialStore::default());
        let panel = Arc::new(Panel::default());
        let platform = Arc::new(CountingPlatform::default());
        let provisioner = Provisioner::new(
            "bench",
            link.clone(),
            store.clone(),
            panel.clone(),
            platform.clone(),
        );
        Rig {
            provisioner,
            link,
            store,
            panel,
            platform,
        }
    }

    fn submission(ssid: &str, pass: &str) -> NetworkSubmission {
        NetworkSubmission {
            ssid: ssid.to_string(),
            pass: pass.to_string(),
        }
    }

    #[test]
    fn form_body_is_url_decoded() {
        assert_eq!(
            parse_form("ssid=My+Home%21&pass=p%26ss%3Dw"),
            Some(submission("My Home!", "p&ss=w"))
        );
        assert_eq!(parse_form("pass=x&ssid=cafe"), Some(submission("cafe", "x")));
        assert_eq!(parse_form("ssid=open"), Some(submission("open", "")));
        assert_eq!(parse_form("ssid=caf%C3%A9&pass="), Some(submission("café", "")));
    }

    #[test]
    fn form_body_without_name_or_with_bad_escape_is_rejected() {
        assert_eq!(parse_form("pass=only"), None);
        assert_eq!(parse_form("ssid=bad%2"), None);
        assert_eq!(parse_form("ssid=bad%zz"), None);
        assert_eq!(parse_form("ssid=%FF"), None);
    }

    #[test]
    fn submission_in_setup_mode_is_saved() {
        let rig = rig(true);

        rig.provisioner.submit(&submission("home", "pw1")).unwrap();

        let saved = rig.store.get().unwrap();
        assert_eq!(saved.get("home").map(|c| c.pass.as_str()), Some("pw1"));
        assert!(rig.link.credentials().get("home").is_some());
        assert!(rig
            .panel
            .texts
            .lock()
            .unwrap()
            .contains(&"New WIFI set successfully !".to_string()));
        assert_eq!(rig.platform.restarts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn submission_outside_setup_mode_is_refused() {
        let rig = rig(false);

        let result = rig.provisioner.submit(&submission("home", "pw1"));

        assert!(matches!(result, Err(Error::InvalidState(_))));
        assert!(rig.store.get().unwrap().is_empty());
    }

    #[test]
    fn invalid_submission_is_not_stored() {
        let rig = rig(true);

        let empty = rig.provisioner.submit(&submission("", "pw"));
        let long = rig.provisioner.submit(&submission(&"n".repeat(33), "pw"));

        assert!(matches!(empty, Err(Error::InvalidArgument(_))));
        assert!(matches!(long, Err(Error::InvalidArgument(_))));
        assert!(rig.store.get().unwrap().is_empty());
    }

    #[test]
    fn submission_into_full_store_is_refused() {
        let rig = rig(true);
        for index in 0..MAX_CREDENTIALS {
            rig.store.upsert(&format!("net{index}"), "pw").unwrap();
        }

        let result = rig.provisioner.submit(&submission("one-more", "pw"));

        assert!(matches!(result, Err(Error::ResourceExhausted(_))));
        assert!(rig.store.get().unwrap().get("one-more").is_none());
    }

    #[test]
    fn view_lists_saved_names_only() {
        let rig = rig(true);
        rig.store.upsert("home", "pw1").unwrap();
        rig.store.upsert("office", "pw2").unwrap();

        let view = rig.provisioner.view().unwrap();

        assert_eq!(
            view,
            ProvisioningView {
                device_name: "bench".to_string(),
                setup_mode: true,
                saved_networks: vec!["home".to_string(), "office".to_string()],
            }
        );
        assert!(!serde_json::to_string(&view).unwrap().contains("pw1"));
    }

    #[test]
    fn rejections_map_to_http_statuses() {
        assert_eq!(http_status(&Error::InvalidArgument("network name is empty")), 400);
        assert_eq!(http_status(&Error::InvalidState("setup access point is not running")), 409);
        assert_eq!(http_status(&Error::ResourceExhausted("full".to_string())), 507);
        assert_eq!(http_status(&Error::Storage("flash".to_string())), 500);
    }

    #[test]
    fn restart_goes_through_the_platform() {
        let rig = rig(true);

        rig.provisioner.restart();

        assert_eq!(rig.platform.restarts.load(Ordering::SeqCst), 1);
    }
}
