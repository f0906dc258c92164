//! The cellular device.
//!
//! [`Cellular`] owns the capability, the registration tracker, the
//! connection manager and the activation bookkeeping, and keeps the coarse
//! [`DeviceState`] in line with what the modem reports.

use crate::{
    activation::{ActivationManager, ActivationStatus, ActivationStore},
    capability::{Capability, StartOutcome, Technology},
    config::CellularConfig,
    connection::{ConnectionManager, LastGoodApnStore},
    error::{CellularError, Result},
    modem::{
        BearerPath, DeviceIdentity, ModemSignal, ModemState, ModemTransport,
        RegistrationSnapshot, SignalStream,
    },
    provider::{ApnEntry, ProviderDatabase},
    registration::{Commit, RegistrationTracker},
    storage::Persistence,
    utils::State,
};
use bon::bon;
use derive_more::Display;
use futures::{future::BoxFuture, FutureExt as _, StreamExt as _};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc};
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, instrument, warn};

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
pub enum DeviceState {
    #[default]
    Disabled,
    Enabled,
    Registered,
    Connected,
    /// Connected, and the network interface is up.
    Linked,
}

#[derive(Clone)]
pub struct Cellular {
    inner: Arc<Inner>,
}

struct Inner {
    config: CellularConfig,
    capability: Arc<Capability>,
    registration: RegistrationTracker,
    connection: ConnectionManager,
    activation: ActivationManager,
    state: State<DeviceState>,
    bearer: State<Option<BearerPath>>,
    /// Whether the modem should be brought back up when it reappears.
    wants_enabled: State<bool>,
    applied_registration: State<RegistrationSnapshot>,
    resumed: State<HashSet<String>>,
}

#[bon]
impl Cellular {
    #[builder]
    pub async fn new(
        #[builder(default)] config: CellularConfig,
        transport: impl ModemTransport,
        storage: impl Persistence,
        #[builder(default)] providers: ProviderDatabase,
    ) -> Self {
        let storage: Arc<dyn Persistence> = Arc::new(storage);

        let capability = Arc::new(
            Capability::builder()
                .technology(config.technology)
                .transport(Arc::new(transport))
                .rpc_timeout(config.rpc_timeout)
                .build(),
        );

        let connection = ConnectionManager::new(
            Arc::clone(&capability),
            Arc::new(providers),
            LastGoodApnStore::load(Arc::clone(&storage)).await,
            config.allow_roaming,
        );

        let registration = RegistrationTracker::new(config.registration_debounce);

        let activation = ActivationManager::new(
            Arc::clone(&capability),
            ActivationStore::load(storage).await,
            config.activation,
            registration.subscribe(),
        );

        Self {
            inner: Arc::new(Inner {
                registration,
                config,
                capability,
                connection,
                activation,
                state: State::default(),
                bearer: State::default(),
                wants_enabled: State::default(),
                applied_registration: State::default(),
                resumed: State::default(),
            }),
        }
    }
}

impl Cellular {
    pub fn state(&self) -> DeviceState {
        self.inner.state.get()
    }

    pub fn technology(&self) -> Technology {
        self.inner.capability.technology()
    }

    pub fn modem_state(&self) -> ModemState {
        self.inner.capability.modem_state()
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.inner.capability.identity()
    }

    pub fn bearer(&self) -> Option<BearerPath> {
        self.inner.bearer.get()
    }

    /// The debounced registration.
    pub fn registration_state(&self) -> RegistrationSnapshot {
        self.inner.registration.committed()
    }

    pub fn activation_state(&self, identity: &str) -> ActivationStatus {
        self.inner.activation.status(identity)
    }

    pub fn activation_failure(&self) -> Option<CellularError> {
        self.inner.activation.failure()
    }

    #[instrument(skip(self))]
    pub async fn start_modem(&self) -> Result<()> {
        self.inner.wants_enabled.set(true);

        let outcome = self
            .inner
            .capability
            .start_modem(self.inner.config.enable_timeout)
            .await?;

        self.promote(DeviceState::Disabled, DeviceState::Enabled);

        match outcome {
            // Registration handling needs the device to be enabled already.
            StartOutcome::Enabled => {
                task::spawn(self.clone().after_enabled());
            }
            StartOutcome::AlreadyEnabled if self.identity().is_none() => {
                task::spawn(self.clone().identify());
            }
            StartOutcome::AlreadyEnabled => {}
        }

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop_modem(&self) -> Result<()> {
        self.inner.wants_enabled.set(false);
        self.inner.activation.stop_timers();
        self.inner.registration.reset();

        let report = self
            .inner
            .capability
            .stop_modem(self.inner.config.enable_timeout)
            .await?;

        for (step, e) in &report.failed {
            warn!("{step} failed while stopping modem: {e}");
        }

        self.inner.bearer.set(None);
        self.inner
            .applied_registration
            .set(RegistrationSnapshot::default());
        self.set_state(DeviceState::Disabled);

        Ok(())
    }

    /// `apn` replaces any APN the user supplied before.
    #[instrument(skip(self, apn))]
    pub async fn connect(&self, apn: Option<ApnEntry>) -> Result<BearerPath> {
        match self.state() {
            DeviceState::Connected | DeviceState::Linked => {
                return Err(CellularError::AlreadyConnected);
            }
            DeviceState::Registered => {}
            DeviceState::Disabled | DeviceState::Enabled => {
                return Err(CellularError::NotRegistered);
            }
        }

        let connected = self.inner.connection.connect(apn).await?;
        self.inner.bearer.set(Some(connected.bearer.clone()));

        if !self.promote(DeviceState::Registered, DeviceState::Connected) {
            warn!(
                "connected while {}, not tracking the session as connected",
                self.state()
            );
        }

        Ok(connected.bearer)
    }

    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        if self.state() < DeviceState::Connected {
            debug!("no data session to tear down");
            return Ok(());
        }

        self.inner.capability.disconnect().await?;
        self.drop_session();

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn activate(&self, carrier: &str) -> Result<()> {
        if !self.inner.capability.supports_activation() {
            return Err(CellularError::UnsupportedOperation("activate"));
        }

        if self.state() < DeviceState::Enabled {
            return Err(CellularError::InvalidArguments(
                "activation needs an enabled device".into(),
            ));
        }

        let Some(identity) = self.identity_key() else {
            return Err(CellularError::InvalidArguments(
                "device identity is not known yet".into(),
            ));
        };

        self.inner.activation.activate(&identity, carrier).await
    }

    #[instrument(skip(self))]
    pub async fn register(&self, network_id: &str) -> Result<()> {
        if self.state() < DeviceState::Enabled {
            return Err(CellularError::InvalidArguments(
                "registration needs an enabled device".into(),
            ));
        }

        self.inner.capability.register(network_id).await
    }

    #[instrument(skip(self))]
    pub async fn reset(&self) -> Result<()> {
        self.inner.capability.reset().await
    }

    pub fn link_up(&self) {
        if !self.promote(DeviceState::Connected, DeviceState::Linked) {
            debug!("ignoring link up while {}", self.state());
        }
    }

    pub fn link_down(&self) {
        if self.state() == DeviceState::Linked {
            self.set_state(DeviceState::Connected);
        }
    }

    pub async fn handle_signal(&self, signal: ModemSignal) {
        debug!("modem signal {signal:?}");

        match signal {
            ModemSignal::StateChanged { old, new } => self.on_modem_state(old, new),

            ModemSignal::Registration(raw) => self.on_registration(raw).await,

            ModemSignal::ActivationState { activated, error } => {
                if let Some(identity) = self.identity_key() {
                    self.inner
                        .activation
                        .on_activation_state(&identity, activated, error.as_deref())
                        .await;
                }
            }

            ModemSignal::ServiceIdentifier(mdn) => {
                self.inner.capability.on_service_identifier(&mdn);
                self.inner
                    .activation
                    .on_service_identifier(self.identity_key().as_deref(), &mdn)
                    .await;
            }

            ModemSignal::Removed => {
                self.inner.capability.on_removed();
                self.inner.registration.reset();
                self.inner.bearer.set(None);
                self.set_state(DeviceState::Disabled);
            }
        }
    }

    /// Feeds modem signals and debounced registration commits into the
    /// device until the signal stream ends.
    pub fn spawn(&self, mut signals: SignalStream) -> JoinHandle<color_eyre::Result<()>> {
        let this = self.clone();
        let mut committed = self.inner.registration.subscribe();

        task::spawn(async move {
            loop {
                tokio::select! {
                    signal = signals.next() => match signal {
                        Some(signal) => this.handle_signal(signal).await,
                        None => {
                            info!("modem signal stream ended");
                            return Ok(());
                        }
                    },

                    changed = committed.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }

                        let snapshot = *committed.borrow_and_update();
                        this.apply_registration(snapshot).await;
                    }
                }
            }
        })
    }

    fn on_modem_state(&self, old: ModemState, new: ModemState) {
        let reappeared = old < ModemState::Disabled && new >= ModemState::Disabled;
        let resumes_deferred_start = self.inner.capability.has_deferred_start();

        self.inner.capability.on_modem_state_changed(old, new);

        if old >= ModemState::Connected
            && new < ModemState::Connected
            && self.state() >= DeviceState::Connected
        {
            warn!("data session dropped by the modem");
            self.drop_session();
        }

        if new == ModemState::Unknown
            || (new == ModemState::Disabled && old >= ModemState::Enabled)
        {
            self.inner.bearer.set(None);
            self.set_state(DeviceState::Disabled);
        }

        if reappeared {
            task::spawn(self.clone().identify());
        }

        if reappeared
            && !resumes_deferred_start
            && self.inner.wants_enabled.get()
            && self.state() == DeviceState::Disabled
        {
            info!("modem is back, enabling it again");
            task::spawn(self.clone().restart());
        }

        self.reconcile();
    }

    async fn on_registration(&self, raw: RegistrationSnapshot) {
        let commit = self.inner.registration.on_signal(raw, self.state());

        if commit == Commit::Immediate {
            self.apply_registration(self.inner.registration.committed())
                .await;
        }
    }

    async fn apply_registration(&self, committed: RegistrationSnapshot) {
        if self.inner.applied_registration.set(committed) == committed {
            return;
        }

        info!("registration is now {committed:?}");
        self.reconcile();

        if let Some(identity) = self.identity_key() {
            self.inner
                .activation
                .on_registration(&identity, committed)
                .await;
        }
    }

    /// Moves the device state to where the modem state and the committed
    /// registration allow it to be.
    fn reconcile(&self) {
        let registered = self.inner.registration.committed().is_registered();
        let can_register = registered && self.modem_state().is_registered();

        let next = match self.state() {
            DeviceState::Disabled => DeviceState::Disabled,
            DeviceState::Enabled if can_register => DeviceState::Registered,
            DeviceState::Enabled => DeviceState::Enabled,
            _ if !registered => DeviceState::Enabled,
            current => current,
        };

        if next < DeviceState::Connected {
            self.inner.bearer.set(None);
        }

        self.set_state(next);
    }

    fn drop_session(&self) {
        self.inner.bearer.set(None);
        self.inner.state.write(|s| {
            if *s >= DeviceState::Connected {
                *s = DeviceState::Registered;
            }
        });
        self.reconcile();
    }

    // Boxed, the restart goes through the signal handling that spawns it.
    fn restart(self) -> BoxFuture<'static, ()> {
        async move {
            if let Err(e) = self.start_modem().await {
                warn!("failed to enable modem again: {e}");
            }
        }
        .boxed()
    }

    async fn after_enabled(self) {
        let capability = &self.inner.capability;

        if let Err(e) = capability
            .signal_setup(self.inner.config.modem_poll_interval)
            .await
        {
            warn!("failed to set up signal quality polling: {e}");
        }

        match capability.registration().await {
            Ok(raw) => self.on_registration(raw).await,
            Err(e) => warn!("failed to fetch registration: {e}"),
        }

        self.resume_activation().await;
    }

    /// Picks up a modem that is present but was not enabled by us.
    async fn identify(self) {
        if let Err(e) = self.inner.capability.load_properties().await {
            warn!("failed to identify modem: {e}");
            return;
        }

        self.resume_activation().await;
    }

    /// Resumes the activation of each identity once, later sightings only
    /// catch up on the registration.
    async fn resume_activation(&self) {
        let Some(identity) = self.identity_key() else {
            return;
        };

        if self.inner.resumed.write(|r| r.insert(identity.clone())) {
            self.inner.activation.resume(&identity).await;
        } else {
            self.inner
                .activation
                .on_registration(&identity, self.inner.registration.committed())
                .await;
        }
    }

    fn identity_key(&self) -> Option<String> {
        self.identity().map(|id| id.key().to_string())
    }

    /// Moves `from` to `to`, returns whether the device was in `from`.
    fn promote(&self, from: DeviceState, to: DeviceState) -> bool {
        let promoted = self.inner.state.write(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        });

        if promoted {
            info!("device state {from} -> {to}");
            self.reconcile();
        }

        promoted
    }

    fn set_state(&self, next: DeviceState) {
        let prev = self.inner.state.set(next);
        if prev != next {
            info!("device state {prev} -> {next}");
        }
    }
}
