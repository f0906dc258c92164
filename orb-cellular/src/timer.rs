use std::{future::Future, time::Duration};
use tokio::{
    task::{self, JoinHandle},
    time,
};

/// A one-shot delayed task that can be stopped before it fires.
///
/// Dropping the timer stops it as well.
#[derive(Debug)]
pub struct CancellableTimer {
    handle: JoinHandle<()>,
}

impl CancellableTimer {
    pub fn start<F>(delay: Duration, f: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = task::spawn(async move {
            time::sleep(delay).await;
            f.await;
        });

        Self { handle }
    }

    /// Stops the timer. Returns true if it had not fired yet.
    pub fn stop(self) -> bool {
        let pending = !self.handle.is_finished();
        self.handle.abort();
        pending
    }

    pub fn is_pending(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for CancellableTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    #[tokio::test(start_paused = true)]
    async fn it_fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();

        let timer = CancellableTimer::start(Duration::from_secs(5), async move {
            f.store(true, Ordering::SeqCst);
        });

        time::sleep(Duration::from_secs(4)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(timer.is_pending());

        time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn it_never_fires_once_stopped() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();

        let timer = CancellableTimer::start(Duration::from_secs(5), async move {
            f.store(true, Ordering::SeqCst);
        });

        assert!(timer.stop());
        time::sleep(Duration::from_secs(10)).await;

        assert!(!fired.load(Ordering::SeqCst));
    }
}
