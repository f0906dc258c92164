use crate::{
    cellular::DeviceState,
    modem::{RegistrationSnapshot, RegistrationState},
    timer::CancellableTimer,
    utils::State,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    Immediate,
    Deferred,
}

/// Debounces raw registration signals into the registration visible to the
/// rest of the daemon.
///
/// Gaining registration is committed right away. Dropping from a committed
/// Home/Roaming to Searching/Idle is held back for the debounce window and
/// forgotten if registration comes back within it.
pub struct RegistrationTracker {
    debounce: Duration,
    latest: State<RegistrationSnapshot>,
    committed: Arc<watch::Sender<RegistrationSnapshot>>,
    pending: State<Option<CancellableTimer>>,
}

impl RegistrationTracker {
    pub fn new(debounce: Duration) -> Self {
        let (committed, _) = watch::channel(RegistrationSnapshot::default());

        Self {
            debounce,
            latest: State::default(),
            committed: Arc::new(committed),
            pending: State::default(),
        }
    }

    pub fn on_signal(&self, raw: RegistrationSnapshot, device_state: DeviceState) -> Commit {
        self.latest.set(raw);

        if self.cancel_pending() {
            if raw.is_registered() {
                info!("registration came back within the debounce window");
            } else {
                warn!("consecutive registration drops, restarting debounce window");
            }
        }

        let committed = self.committed();
        let defer = committed.is_registered()
            && is_transient_loss(&raw)
            && device_state >= DeviceState::Registered
            && !self.debounce.is_zero();

        if !defer {
            self.commit(raw);
            return Commit::Immediate;
        }

        debug!(
            "deferring registration update {:?} by {:?}",
            raw.primary, self.debounce
        );

        let committed = Arc::clone(&self.committed);
        let timer = CancellableTimer::start(self.debounce, async move {
            debug!("committing deferred registration update");
            committed.send_replace(raw);
        });
        self.pending.set(Some(timer));

        Commit::Deferred
    }

    /// Drops any deferred update and forgets the committed registration.
    pub fn reset(&self) {
        self.cancel_pending();
        self.latest.set(RegistrationSnapshot::default());
        self.commit(RegistrationSnapshot::default());
    }

    pub fn committed(&self) -> RegistrationSnapshot {
        *self.committed.borrow()
    }

    /// The last raw signal, committed or not.
    pub fn latest(&self) -> RegistrationSnapshot {
        self.latest.get()
    }

    pub fn has_pending_update(&self) -> bool {
        self.pending
            .read(|p| p.as_ref().is_some_and(CancellableTimer::is_pending))
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistrationSnapshot> {
        self.committed.subscribe()
    }

    fn commit(&self, snapshot: RegistrationSnapshot) {
        self.committed.send_if_modified(|current| {
            let changed = *current != snapshot;
            *current = snapshot;
            changed
        });
    }

    fn cancel_pending(&self) -> bool {
        self.pending
            .write(Option::take)
            .is_some_and(CancellableTimer::stop)
    }
}

/// Losing the network while still looking for it, as opposed to an explicit
/// denial which is never held back.
fn is_transient_loss(snapshot: &RegistrationSnapshot) -> bool {
    let transient = |s: RegistrationState| {
        matches!(s, RegistrationState::Idle | RegistrationState::Searching)
    };

    transient(snapshot.primary) && snapshot.secondary.is_none_or(transient)
}
