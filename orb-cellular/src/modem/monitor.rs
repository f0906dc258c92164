use super::{
    cli::ModemManagerCli, ModemSignal, ModemState, ModemStatus, RegistrationSnapshot,
    SignalStream,
};
use color_eyre::Result;
use futures::{channel::mpsc, StreamExt};
use std::time::Duration;
use tokio::{
    task::{self, JoinHandle},
    time,
};
use tracing::{error, info};

/// Everything a single poll of the modem yields.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ModemSnapshot {
    pub status: ModemStatus,
    pub registration: RegistrationSnapshot,
    pub activated: Option<bool>,
}

/// ModemManager's CLI has no signal subscription, so unsolicited events are
/// synthesized by polling and diffing consecutive snapshots.
pub fn spawn(
    mm: ModemManagerCli,
    poll_interval: Duration,
) -> (JoinHandle<Result<()>>, SignalStream) {
    info!("starting modem monitor");

    let (tx, rx) = mpsc::unbounded();

    let handle = task::spawn(async move {
        let mut last: Option<ModemSnapshot> = None;

        loop {
            match mm.poll(poll_interval).await {
                Ok(current) => {
                    for signal in diff(last.as_ref(), &current) {
                        if tx.unbounded_send(signal).is_err() {
                            info!("signal receiver dropped, stopping modem monitor");
                            return Ok(());
                        }
                    }

                    last = Some(current);
                }

                Err(e) => {
                    error!("failed to poll modem: {e}");

                    if last.take().is_some()
                        && tx.unbounded_send(ModemSignal::Removed).is_err()
                    {
                        return Ok(());
                    }
                }
            }

            time::sleep(poll_interval).await;
        }
    });

    (handle, rx.boxed())
}

fn diff(prev: Option<&ModemSnapshot>, next: &ModemSnapshot) -> Vec<ModemSignal> {
    let mut signals = Vec::new();

    let old = prev.map(|p| p.status.state).unwrap_or(ModemState::Unknown);
    if prev.is_none() || old != next.status.state {
        signals.push(ModemSignal::StateChanged {
            old,
            new: next.status.state,
        });
    }

    if prev.is_none_or(|p| p.registration != next.registration) {
        signals.push(ModemSignal::Registration(next.registration));
    }

    if let Some(mdn) = &next.status.mdn
        && prev.is_none_or(|p| p.status.mdn.as_ref() != Some(mdn))
    {
        signals.push(ModemSignal::ServiceIdentifier(mdn.clone()));
    }

    if let Some(activated) = next.activated
        && prev.is_none_or(|p| p.activated != Some(activated))
    {
        signals.push(ModemSignal::ActivationState {
            activated,
            error: None,
        });
    }

    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::RegistrationState;

    fn snapshot(state: ModemState, reg: RegistrationState) -> ModemSnapshot {
        ModemSnapshot {
            status: ModemStatus {
                state,
                ..Default::default()
            },
            registration: RegistrationSnapshot::single(reg),
            activated: None,
        }
    }

    #[test]
    fn it_reports_everything_on_first_poll() {
        let next = snapshot(ModemState::Disabled, RegistrationState::Idle);

        let signals = diff(None, &next);

        assert_eq!(
            signals,
            vec![
                ModemSignal::StateChanged {
                    old: ModemState::Unknown,
                    new: ModemState::Disabled,
                },
                ModemSignal::Registration(RegistrationSnapshot::single(
                    RegistrationState::Idle
                )),
            ]
        );
    }

    #[test]
    fn it_only_reports_changes() {
        // Arrange
        let prev = snapshot(ModemState::Enabled, RegistrationState::Searching);
        let mut next = snapshot(ModemState::Enabled, RegistrationState::Home);
        next.status.mdn = Some("4155550100".into());

        // Act
        let signals = diff(Some(&prev), &next);
        let unchanged = diff(Some(&next), &next);

        // Assert
        assert_eq!(
            signals,
            vec![
                ModemSignal::Registration(RegistrationSnapshot::single(
                    RegistrationState::Home
                )),
                ModemSignal::ServiceIdentifier("4155550100".into()),
            ]
        );
        assert!(unchanged.is_empty());
    }
}
