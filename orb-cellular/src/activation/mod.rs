//! Over-the-air activation.
//!
//! The activation RPC only starts provisioning. The device counts as
//! activated once it registers on its home network, and the record is only
//! dropped once the network also hands out a real phone number.

mod store;

pub use store::{ActivationRecord, ActivationStatus, ActivationStore};

use crate::{
    capability::Capability,
    error::{CellularError, Result},
    modem::{is_valid_mdn, RegistrationSnapshot},
    timer::CancellableTimer,
    utils::State,
};
use bon::Builder;
use futures::{future::BoxFuture, FutureExt as _};
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{sync::watch, task};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder)]
pub struct ActivationPolicy {
    /// How long home registration may take after the modem took the request.
    #[builder(default = Duration::from_secs(120))]
    pub confirm_timeout: Duration,
    #[builder(default = Duration::from_secs(5))]
    pub retry_delay: Duration,
    #[builder(default = 5)]
    pub max_retries: u32,
    /// Confirmation timeouts tolerated before giving up. Every timeout but
    /// the last one resets the modem.
    #[builder(default = 2)]
    pub max_timeouts: u32,
}

impl Default for ActivationPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Clone)]
pub struct ActivationManager {
    inner: Arc<Inner>,
}

struct Inner {
    capability: Arc<Capability>,
    store: ActivationStore,
    policy: ActivationPolicy,
    /// The committed registration of the device.
    registration: watch::Receiver<RegistrationSnapshot>,
    confirm_timer: State<Option<CancellableTimer>>,
    retry_timer: State<Option<CancellableTimer>>,
    mdn: State<Option<String>>,
    failure: State<Option<CellularError>>,
}

impl ActivationManager {
    pub fn new(
        capability: Arc<Capability>,
        store: ActivationStore,
        policy: ActivationPolicy,
        registration: watch::Receiver<RegistrationSnapshot>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                capability,
                store,
                policy,
                registration,
                confirm_timer: State::default(),
                retry_timer: State::default(),
                mdn: State::default(),
                failure: State::default(),
            }),
        }
    }

    pub fn status(&self, identity: &str) -> ActivationStatus {
        self.inner.store.get(identity)
    }

    pub fn store(&self) -> &ActivationStore {
        &self.inner.store
    }

    /// Set once activation has been given up on, cleared by a new request.
    pub fn failure(&self) -> Option<CellularError> {
        self.inner.failure.get()
    }

    #[instrument(skip(self))]
    pub async fn activate(&self, identity: &str, carrier: &str) -> Result<()> {
        if !self.inner.capability.supports_activation() {
            return Err(CellularError::UnsupportedOperation("activate"));
        }

        self.stop_timers();
        self.inner.failure.set(None);

        self.inner
            .store
            .update(identity, |r| {
                r.status = ActivationStatus::Pending;
                r.carrier = Some(carrier.to_string());
                r.retries = 0;
                r.timeouts = 0;
            })
            .await;

        self.issue(identity, carrier).await
    }

    /// Picks up whatever was left in flight by a previous run.
    pub async fn resume(&self, identity: &str) {
        let Some(record) = self.inner.store.record(identity) else {
            return;
        };

        info!("resuming activation of {identity} from {}", record.status);

        match record.status {
            ActivationStatus::Unknown => {}
            ActivationStatus::Pending | ActivationStatus::PendingTimeout if self.is_home() => {
                self.confirm(identity).await;
            }
            ActivationStatus::Pending => self.arm_confirm_timer(identity),
            ActivationStatus::PendingRetry => self.schedule_retry(identity).await,
            ActivationStatus::PendingTimeout => {
                if record.timeouts >= self.inner.policy.max_timeouts {
                    self.give_up(identity, "activation never got confirmed");
                } else {
                    self.reset_and_wait(identity).await;
                }
            }
            ActivationStatus::Activated => self.try_complete(identity).await,
        }
    }

    pub async fn on_registration(&self, identity: &str, registration: RegistrationSnapshot) {
        if !registration.is_home() {
            return;
        }

        match self.status(identity) {
            ActivationStatus::Pending | ActivationStatus::PendingTimeout => {
                self.confirm(identity).await;
            }

            ActivationStatus::Activated => self.try_complete(identity).await,

            ActivationStatus::Unknown | ActivationStatus::PendingRetry => {}
        }
    }

    pub async fn on_service_identifier(&self, identity: Option<&str>, mdn: &str) {
        self.inner.mdn.set(Some(mdn.to_string()));

        if let Some(identity) = identity
            && self.status(identity) == ActivationStatus::Activated
        {
            self.try_complete(identity).await;
        }
    }

    pub async fn on_activation_state(
        &self,
        identity: &str,
        activated: bool,
        error: Option<&str>,
    ) {
        if self.status(identity) != ActivationStatus::Pending {
            return;
        }

        if let Some(error) = error {
            warn!("modem reported activation failure for {identity}: {error}");
            self.stop_confirm_timer();
            self.schedule_retry(identity).await;
        } else if activated && self.is_home() {
            self.confirm(identity).await;
        } else if activated && !self.confirm_timer_pending() {
            self.arm_confirm_timer(identity);
        }
    }

    pub fn stop_timers(&self) {
        self.stop_confirm_timer();
        if let Some(timer) = self.inner.retry_timer.write(Option::take) {
            timer.stop();
        }
    }

    async fn issue(&self, identity: &str, carrier: &str) -> Result<()> {
        match self.inner.capability.activate(carrier).await {
            Ok(()) => {
                if self.status(identity) != ActivationStatus::Pending {
                    return Ok(());
                }

                if self.is_home() {
                    self.confirm(identity).await;
                } else {
                    info!("activation of {identity} requested, waiting for home registration");
                    self.arm_confirm_timer(identity);
                }

                Ok(())
            }

            Err(e) => {
                warn!("activation request for {identity} failed: {e}");
                if self.status(identity) == ActivationStatus::Pending {
                    self.schedule_retry(identity).await;
                }

                Err(e)
            }
        }
    }

    async fn schedule_retry(&self, identity: &str) {
        let record = self
            .inner
            .store
            .set(identity, ActivationStatus::PendingRetry)
            .await;

        if record.retries >= self.inner.policy.max_retries {
            self.give_up(identity, "out of activation retries");
            return;
        }

        let delay = self.inner.policy.retry_delay;
        debug!("retrying activation of {identity} in {delay:?}");

        let timer = self.spawn_after(delay, identity, Self::retry_task);
        self.inner.retry_timer.set(Some(timer));
    }

    async fn retry(&self, identity: &str) {
        let Some(record) = self.inner.store.record(identity) else {
            return;
        };

        if record.status != ActivationStatus::PendingRetry {
            return;
        }

        let Some(carrier) = record.carrier else {
            warn!("no carrier recorded for {identity}, cannot retry activation");
            return;
        };

        let record = self
            .inner
            .store
            .update(identity, |r| {
                r.status = ActivationStatus::Pending;
                r.retries += 1;
            })
            .await;

        info!(
            "retrying activation of {identity} ({}/{})",
            record.retries, self.inner.policy.max_retries
        );

        // A failed retry has already scheduled the next one.
        if let Err(e) = self.issue(identity, &carrier).await {
            debug!("activation retry {} of {identity} failed: {e}", record.retries);
        }
    }

    async fn on_confirm_timeout(&self, identity: &str) {
        if !matches!(
            self.status(identity),
            ActivationStatus::Pending | ActivationStatus::PendingTimeout
        ) {
            return;
        }

        let record = self
            .inner
            .store
            .update(identity, |r| {
                r.status = ActivationStatus::PendingTimeout;
                r.timeouts += 1;
            })
            .await;

        if record.timeouts >= self.inner.policy.max_timeouts {
            self.give_up(identity, "activation never got confirmed");
            return;
        }

        warn!(
            "activation of {identity} not confirmed within {:?}",
            self.inner.policy.confirm_timeout
        );

        self.reset_and_wait(identity).await;
    }

    async fn reset_and_wait(&self, identity: &str) {
        info!("resetting modem to recover activation of {identity}");

        if let Err(e) = self.inner.capability.reset().await {
            error!("failed to reset modem: {e}");
        }

        self.arm_confirm_timer(identity);
    }

    fn is_home(&self) -> bool {
        self.inner.registration.borrow().is_home()
    }

    async fn confirm(&self, identity: &str) {
        info!("home registration confirms activation of {identity}");
        self.stop_confirm_timer();
        self.inner
            .store
            .set(identity, ActivationStatus::Activated)
            .await;
        self.try_complete(identity).await;
    }

    async fn try_complete(&self, identity: &str) {
        let mdn = self
            .inner
            .mdn
            .get()
            .or_else(|| self.inner.capability.status().mdn);

        if mdn.as_deref().is_some_and(is_valid_mdn) {
            info!("activation of {identity} complete");
            self.inner.store.remove(identity).await;
        } else {
            debug!("activation of {identity} waits for a valid service identifier");
        }
    }

    fn give_up(&self, identity: &str, reason: &str) {
        error!("giving up on activation of {identity}: {reason}");
        self.inner
            .failure
            .set(Some(CellularError::OperationFailed(reason.to_string())));
    }

    fn arm_confirm_timer(&self, identity: &str) {
        let timer = self.spawn_after(
            self.inner.policy.confirm_timeout,
            identity,
            Self::confirm_timeout_task,
        );

        self.inner.confirm_timer.set(Some(timer));
    }

    fn stop_confirm_timer(&self) {
        if let Some(timer) = self.inner.confirm_timer.write(Option::take) {
            timer.stop();
        }
    }

    fn confirm_timer_pending(&self) -> bool {
        self.inner
            .confirm_timer
            .read(|t| t.as_ref().is_some_and(CancellableTimer::is_pending))
    }

    // Boxed, retries re-arm themselves from inside the retry.
    fn retry_task(self, identity: String) -> BoxFuture<'static, ()> {
        async move { self.retry(&identity).await }.boxed()
    }

    fn confirm_timeout_task(self, identity: String) -> BoxFuture<'static, ()> {
        async move { self.on_confirm_timeout(&identity).await }.boxed()
    }

    /// The work runs on its own task, so replacing the timer from inside it
    /// does not abort it.
    fn spawn_after(
        &self,
        delay: Duration,
        identity: &str,
        work: fn(ActivationManager, String) -> BoxFuture<'static, ()>,
    ) -> CancellableTimer {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let identity = identity.to_string();

        CancellableTimer::start(delay, async move {
            if let Some(inner) = inner.upgrade() {
                task::spawn(work(ActivationManager { inner }, identity));
            }
        })
    }
}
