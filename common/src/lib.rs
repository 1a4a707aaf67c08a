pub mod classifier;
pub mod config;
pub mod error;
pub mod event_bits;
pub mod link;
pub mod orchestrator;
pub mod provisioning;
pub mod session;
pub mod sim;
pub mod store;
pub mod topics;
pub mod types;

pub use classifier::{ButtonClassifier, ButtonFlags, ButtonGesture, ButtonLine};
pub use config::{DeviceConfig, LinkConfig, RuntimeConfig, SessionConfig};
pub use error::{DriverError, Error, Result, TransportError};
pub use link::{LinkEvent, LinkEventSink, LinkManager, LinkObserver, WifiDriver};
pub use orchestrator::{
    BootOutcome, Collaborators, DevicePlatform, DisplaySurface, Led, Orchestrator,
};
pub use provisioning::{NetworkSubmission, Provisioner, SetupPortal};
pub use session::{
    MqttTransport, SessionEvent, SessionEventSink, SessionManager, SessionObserver, TopicTable,
};
pub use store::{CredentialStore, MemoryCredentialStore};
pub use topics::*;
pub use types::{Credential, CredentialList, DisconnectReason, LinkStatus, Qos, SessionStatus};
