use crate::error::RpcError;
use async_trait::async_trait;
use derive_more::Display;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod cli;
pub mod monitor;

/// Radio lifecycle state as reported by ModemManager. Ordered, a state compares
/// greater than every state that precedes it in the lifecycle.
#[derive(
    Display,
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum ModemState {
    #[default]
    Unknown,
    Initializing,
    Locked,
    Disabled,
    Disabling,
    Enabling,
    Enabled,
    Searching,
    Registered,
    Disconnecting,
    Connecting,
    Connected,
}

impl ModemState {
    pub fn is_enabled(self) -> bool {
        self >= ModemState::Enabled
    }

    pub fn is_registered(self) -> bool {
        self >= ModemState::Registered
    }
}

impl From<&str> for ModemState {
    fn from(value: &str) -> Self {
        match value.trim() {
            "initializing" => ModemState::Initializing,
            "locked" => ModemState::Locked,
            "disabled" => ModemState::Disabled,
            "disabling" => ModemState::Disabling,
            "enabling" => ModemState::Enabling,
            "enabled" => ModemState::Enabled,
            "searching" => ModemState::Searching,
            "registered" => ModemState::Registered,
            "disconnecting" => ModemState::Disconnecting,
            "connecting" => ModemState::Connecting,
            "connected" => ModemState::Connected,
            _ => ModemState::Unknown,
        }
    }
}

/// Raw network registration of a single radio technology.
#[derive(
    Display, Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum RegistrationState {
    #[default]
    Idle,
    Searching,
    Home,
    Roaming,
    Denied,
}

impl RegistrationState {
    pub fn is_registered(self) -> bool {
        matches!(self, RegistrationState::Home | RegistrationState::Roaming)
    }
}

impl From<&str> for RegistrationState {
    fn from(value: &str) -> Self {
        match value.trim() {
            // cdma reports a bare "registered" when it can't tell home from roaming
            "home" | "home-sms-only" | "home-csfb-not-preferred" | "registered" => {
                RegistrationState::Home
            }
            "roaming" | "roaming-sms-only" | "roaming-csfb-not-preferred" => {
                RegistrationState::Roaming
            }
            "searching" | "attached-rlos" => RegistrationState::Searching,
            "denied" => RegistrationState::Denied,
            _ => RegistrationState::Idle,
        }
    }
}

/// Registration of the modem, `secondary` is only set on dual-stack (CDMA
/// 1x + EV-DO) modems.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationSnapshot {
    pub primary: RegistrationState,
    pub secondary: Option<RegistrationState>,
}

impl RegistrationSnapshot {
    pub fn single(state: RegistrationState) -> Self {
        Self {
            primary: state,
            secondary: None,
        }
    }

    pub fn dual(primary: RegistrationState, secondary: RegistrationState) -> Self {
        Self {
            primary,
            secondary: Some(secondary),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.primary.is_registered()
            || self.secondary.is_some_and(RegistrationState::is_registered)
    }

    pub fn is_home(&self) -> bool {
        self.primary == RegistrationState::Home
            || self.secondary == Some(RegistrationState::Home)
    }
}

/// Immutable identifiers of a modem. `primary` keys activation tracking.
#[derive(Display, Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[display("{primary}")]
pub struct DeviceIdentity {
    pub primary: String,
    pub secondary: Option<String>,
}

impl DeviceIdentity {
    /// What per-device records are stored under.
    pub fn key(&self) -> &str {
        &self.primary
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimIdentity {
    pub iccid: String,
    pub imsi: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquipmentIdentity {
    /// IMEI on 3GPP modems, MEID on CDMA modems.
    pub equipment_id: String,
    pub esn: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HardwareInfo {
    pub manufacturer: String,
    pub model: String,
    pub revision: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ModemStatus {
    pub state: ModemState,
    pub operator_code: Option<String>,
    pub operator_name: Option<String>,
    /// Radio Access Technology -- e.g.: gsm, lte
    pub access_tech: Option<String>,
    pub mdn: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectProperties {
    pub apn: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub allow_roaming: bool,
}

pub type BearerPath = String;

/// Unsolicited notifications from the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemSignal {
    StateChanged { old: ModemState, new: ModemState },
    Registration(RegistrationSnapshot),
    ActivationState { activated: bool, error: Option<String> },
    /// A (possibly placeholder) phone number got assigned to the device.
    ServiceIdentifier(String),
    Removed,
}

pub type SignalStream = BoxStream<'static, ModemSignal>;

/// Request/response side of the modem management service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModemTransport: 'static + Send + Sync {
    async fn enable(&self, enable: bool, timeout: Duration) -> Result<(), RpcError>;

    async fn status(&self, timeout: Duration) -> Result<ModemStatus, RpcError>;

    async fn sim_identity(&self, timeout: Duration) -> Result<SimIdentity, RpcError>;

    async fn equipment_identity(
        &self,
        timeout: Duration,
    ) -> Result<EquipmentIdentity, RpcError>;

    async fn hardware_info(&self, timeout: Duration) -> Result<HardwareInfo, RpcError>;

    async fn registration(
        &self,
        timeout: Duration,
    ) -> Result<RegistrationSnapshot, RpcError>;

    async fn connect(
        &self,
        props: ConnectProperties,
        timeout: Duration,
    ) -> Result<BearerPath, RpcError>;

    /// Disconnects every bearer of the modem.
    async fn disconnect(&self, timeout: Duration) -> Result<(), RpcError>;

    async fn activate(&self, carrier: String, timeout: Duration) -> Result<(), RpcError>;

    async fn reset(&self, timeout: Duration) -> Result<(), RpcError>;

    async fn register(&self, network_id: String, timeout: Duration)
        -> Result<(), RpcError>;

    async fn signal_setup(&self, rate: Duration) -> Result<(), RpcError>;
}

/// A service identifier is valid when it is not an all-zero placeholder.
pub fn is_valid_mdn(mdn: &str) -> bool {
    mdn.chars().any(|c| c.is_ascii_digit() && c != '0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_orders_modem_states_along_the_lifecycle() {
        assert!(ModemState::Initializing < ModemState::Disabled);
        assert!(ModemState::Connected.is_enabled());
        assert!(ModemState::Searching.is_enabled());
        assert!(!ModemState::Enabling.is_enabled());
        assert!(!ModemState::Searching.is_registered());
        assert_eq!(ModemState::from("connected"), ModemState::Connected);
        assert_eq!(ModemState::from("failed"), ModemState::Unknown);
    }

    #[test]
    fn it_treats_either_technology_as_registered() {
        let cdma = RegistrationSnapshot::dual(
            RegistrationState::Idle,
            RegistrationState::Roaming,
        );

        assert!(cdma.is_registered());
        assert!(!cdma.is_home());
        assert!(!RegistrationSnapshot::default().is_registered());
    }

    #[test]
    fn it_rejects_placeholder_mdns() {
        assert!(!is_valid_mdn(""));
        assert!(!is_valid_mdn("0000000000"));
        assert!(!is_valid_mdn("+000-000"));
        assert!(is_valid_mdn("4155550100"));
    }
}
