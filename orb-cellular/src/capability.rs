//! Technology specific half of the cellular device.
//!
//! A [`Capability`] translates the logical start/stop requests of the
//! controller into the RPC sequence its [`Technology`] needs and exposes the
//! remaining modem operations behind one uniform interface.

use crate::{
    chain::{ChainReport, Epoch, EpochToken, TaskChain},
    error::{CellularError, Result},
    modem::{
        BearerPath, ConnectProperties, DeviceIdentity, HardwareInfo, ModemState,
        ModemStatus, ModemTransport, RegistrationSnapshot,
    },
    utils::State,
};
use bon::bon;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{oneshot, Mutex},
    time,
};
use tracing::{debug, info, instrument, warn};

#[derive(
    Display, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Technology {
    #[display("classic-cdma")]
    ClassicCdma,
    #[display("classic-gsm")]
    ClassicGsm,
    #[display("universal-3gpp")]
    #[value(name = "universal-3gpp")]
    #[serde(rename = "universal-3gpp")]
    Universal3gpp,
    #[display("universal-cdma")]
    UniversalCdma,
}

impl Technology {
    pub fn is_cdma(self) -> bool {
        matches!(self, Technology::ClassicCdma | Technology::UniversalCdma)
    }

    /// Only 3GPP modems carry a SIM, and with it an IMSI.
    pub fn has_sim(self) -> bool {
        !self.is_cdma()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Nothing was done, the modem was enabled already.
    AlreadyEnabled,
    Enabled,
}

pub struct Capability {
    technology: Technology,
    transport: Arc<dyn ModemTransport>,
    rpc_timeout: Duration,
    modem_state: State<ModemState>,
    status: State<ModemStatus>,
    identity: State<Option<DeviceIdentity>>,
    hardware: State<Option<HardwareInfo>>,
    /// Serializes enable/disable chains, waiters are served in FIFO order.
    ops: Mutex<()>,
    deferred_start: State<Option<oneshot::Sender<()>>>,
    epoch: Epoch,
}

#[bon]
impl Capability {
    #[builder]
    pub fn new(
        technology: Technology,
        transport: Arc<dyn ModemTransport>,
        #[builder(default = Duration::from_secs(30))] rpc_timeout: Duration,
    ) -> Self {
        Self {
            technology,
            transport,
            rpc_timeout,
            modem_state: State::default(),
            status: State::default(),
            identity: State::default(),
            hardware: State::default(),
            ops: Mutex::new(()),
            deferred_start: State::default(),
            epoch: Epoch::new(),
        }
    }
}

impl Capability {
    pub fn technology(&self) -> Technology {
        self.technology
    }

    pub fn modem_state(&self) -> ModemState {
        self.modem_state.get()
    }

    pub fn status(&self) -> ModemStatus {
        self.status.get()
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity.get()
    }

    pub fn hardware_info(&self) -> Option<HardwareInfo> {
        self.hardware.get()
    }

    pub fn imsi(&self) -> Option<String> {
        if !self.technology.has_sim() {
            return None;
        }

        self.identity.read(|id| id.as_ref().and_then(|id| id.secondary.clone()))
    }

    /// Classic GSM modems have no notion of OTA activation.
    pub fn supports_activation(&self) -> bool {
        self.technology != Technology::ClassicGsm
    }

    pub fn has_deferred_start(&self) -> bool {
        self.deferred_start.read(Option::is_some)
    }

    #[instrument(skip(self), fields(technology = %self.technology))]
    pub async fn start_modem(&self, timeout: Duration) -> Result<StartOutcome> {
        let _op = self.ops.lock().await;

        if self.modem_state().is_enabled() {
            debug!("modem is {} already, nothing to do", self.modem_state());
            return Ok(StartOutcome::AlreadyEnabled);
        }

        let token = self.epoch.token();

        if matches!(
            self.modem_state(),
            ModemState::Initializing | ModemState::Locked
        ) {
            info!("modem is {}, deferring start", self.modem_state());
            self.wait_until_ready(timeout, &token).await?;
        }

        match self.start_chain(timeout, token.clone()).run().await {
            Err(CellularError::WrongState) => {
                info!("modem refused to enable, deferring start until it is ready");
                self.wait_until_ready(timeout, &token).await?;
                self.start_chain(timeout, token).run().await?;
            }

            res => {
                res?;
            }
        }

        info!("modem enabled");

        Ok(StartOutcome::Enabled)
    }

    /// Reads status and identity of a modem that is up without us enabling
    /// it. The modem state stays with what the modem reports.
    #[instrument(skip(self), fields(technology = %self.technology))]
    pub async fn load_properties(&self) -> Result<()> {
        let token = self.epoch.token();
        let rpc_timeout = self.rpc_timeout;

        TaskChain::strict("load-properties")
            .step_with_timeout("fetch-status", rpc_timeout, move || async move {
                let status = self.transport.status(rpc_timeout).await?;
                self.status.set(ModemStatus {
                    state: self.modem_state(),
                    ..status
                });
                Ok(())
            })
            .step_with_timeout("fetch-identity", rpc_timeout, move || {
                self.fetch_identity()
            })
            .guarded_by(token)
            .run()
            .await
            .map(drop)
    }

    /// Always leaves the local state released, the report lists the steps
    /// that failed on the way.
    #[instrument(skip(self), fields(technology = %self.technology))]
    pub async fn stop_modem(&self, timeout: Duration) -> Result<ChainReport> {
        if self.deferred_start.write(Option::take).is_some() {
            info!("discarding deferred start");
        }

        self.epoch.invalidate();
        let _op = self.ops.lock().await;
        let rpc_timeout = self.rpc_timeout;

        TaskChain::best_effort("stop-modem")
            .step_with_timeout("disconnect", rpc_timeout, move || async move {
                if self.modem_state() < ModemState::Connected {
                    debug!("no active session");
                    return Ok(());
                }

                Ok(self.transport.disconnect(rpc_timeout).await?)
            })
            .step_with_timeout("disable-radio", timeout, move || async move {
                Ok(self.transport.enable(false, timeout).await?)
            })
            .step("release-local-state", move || async move {
                self.release();
                Ok(())
            })
            .run()
            .await
    }

    pub async fn connect(&self, props: ConnectProperties) -> Result<BearerPath> {
        Ok(self.transport.connect(props, self.rpc_timeout).await?)
    }

    pub async fn disconnect(&self) -> Result<()> {
        Ok(self.transport.disconnect(self.rpc_timeout).await?)
    }

    pub async fn activate(&self, carrier: &str) -> Result<()> {
        if !self.supports_activation() {
            return Err(CellularError::UnsupportedOperation("activate"));
        }

        Ok(self
            .transport
            .activate(carrier.to_string(), self.rpc_timeout)
            .await?)
    }

    pub async fn register(&self, network_id: &str) -> Result<()> {
        if self.technology.is_cdma() {
            return Err(CellularError::UnsupportedOperation("register"));
        }

        Ok(self
            .transport
            .register(network_id.to_string(), self.rpc_timeout)
            .await?)
    }

    /// Power cycles the modem. It drops off the bus and comes back as a new
    /// device, so everything in flight is invalidated.
    pub async fn reset(&self) -> Result<()> {
        self.transport.reset(self.rpc_timeout).await?;

        self.epoch.invalidate();
        self.modem_state.set(ModemState::Unknown);

        Ok(())
    }

    pub async fn registration(&self) -> Result<RegistrationSnapshot> {
        Ok(self.transport.registration(self.rpc_timeout).await?)
    }

    pub async fn signal_setup(&self, rate: Duration) -> Result<()> {
        Ok(self.transport.signal_setup(rate).await?)
    }

    pub async fn refresh_status(&self) -> Result<ModemStatus> {
        let status = self.transport.status(self.rpc_timeout).await?;
        self.update_status(status.clone());

        Ok(status)
    }

    pub fn on_modem_state_changed(&self, old: ModemState, new: ModemState) {
        debug!("modem state changed {old} -> {new}");
        self.modem_state.set(new);

        if new == ModemState::Disabled
            && old < ModemState::Disabled
            && let Some(ready) = self.deferred_start.write(Option::take)
        {
            info!("modem left {old}, resuming deferred start");
            let _ = ready.send(());
        }

        if new == ModemState::Unknown {
            self.epoch.invalidate();
            self.identity.set(None);
        }
    }

    pub fn on_service_identifier(&self, mdn: &str) {
        self.status.write(|s| s.mdn = Some(mdn.to_string()));
    }

    pub fn on_removed(&self) {
        warn!("modem disappeared");

        if self.deferred_start.write(Option::take).is_some() {
            info!("discarding deferred start");
        }

        self.epoch.invalidate();
        self.modem_state.set(ModemState::Unknown);
        self.identity.set(None);
    }

    fn start_chain(&self, timeout: Duration, token: EpochToken) -> TaskChain<'_> {
        let rpc_timeout = self.rpc_timeout;

        TaskChain::strict("start-modem")
            .step_with_timeout("enable-radio", timeout, move || async move {
                Ok(self.transport.enable(true, timeout).await?)
            })
            .step_with_timeout("fetch-status", rpc_timeout, move || async move {
                self.refresh_status().await.map(drop)
            })
            .step_with_timeout("fetch-identity", rpc_timeout, move || {
                self.fetch_identity()
            })
            .step_with_timeout("fetch-hardware-info", rpc_timeout, move || async move {
                let info = self.transport.hardware_info(rpc_timeout).await?;
                debug!(
                    "modem is a {} {} rev {}",
                    info.manufacturer, info.model, info.revision
                );
                self.hardware.set(Some(info));
                Ok(())
            })
            .step("finalize", move || async move {
                self.modem_state.write(|s| {
                    if !s.is_enabled() {
                        *s = ModemState::Enabled;
                    }
                });
                Ok(())
            })
            .guarded_by(token)
    }

    async fn fetch_identity(&self) -> Result<()> {
        let identity = if self.technology.has_sim() {
            let sim = self.transport.sim_identity(self.rpc_timeout).await?;
            DeviceIdentity {
                primary: sim.iccid,
                secondary: Some(sim.imsi),
            }
        } else {
            let equipment = self.transport.equipment_identity(self.rpc_timeout).await?;
            DeviceIdentity {
                primary: equipment.equipment_id,
                secondary: equipment.esn,
            }
        };

        info!("modem identity {identity}");
        self.identity.set(Some(identity));

        Ok(())
    }

    async fn wait_until_ready(&self, timeout: Duration, token: &EpochToken) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.deferred_start.set(Some(tx));

        let res = match time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CellularError::Aborted),
            Err(_) => {
                self.deferred_start.set(None);
                Err(CellularError::Timeout)
            }
        };

        if res.is_ok() && !token.is_current() {
            return Err(CellularError::Aborted);
        }

        res
    }

    fn update_status(&self, status: ModemStatus) {
        self.modem_state.set(status.state);
        self.status.set(status);
    }

    fn release(&self) {
        self.modem_state.set(ModemState::Disabled);
        self.status.set(ModemStatus {
            state: ModemState::Disabled,
            ..Default::default()
        });
        self.hardware.set(None);
    }
}
