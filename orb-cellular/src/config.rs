use crate::{activation::ActivationPolicy, capability::Technology};
use bon::Builder;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct CellularConfig {
    #[builder(default = Technology::Universal3gpp)]
    pub technology: Technology,
    /// Per-RPC timeout for everything but enabling and disabling the radio.
    #[builder(default = Duration::from_secs(30))]
    pub rpc_timeout: Duration,
    #[builder(default = Duration::from_secs(45))]
    pub enable_timeout: Duration,
    /// Also used as the signal quality refresh rate.
    #[builder(default = Duration::from_secs(10))]
    pub modem_poll_interval: Duration,
    #[builder(default = Duration::from_secs(15))]
    pub registration_debounce: Duration,
    #[builder(default)]
    pub activation: ActivationPolicy,
    #[builder(default = false)]
    pub allow_roaming: bool,
}

impl Default for CellularConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
