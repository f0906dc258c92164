use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::process::Command;

pub async fn run_cmd(cmd: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(cmd).args(args).output().await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let err = String::from_utf8_lossy(&output.stderr);
        let args = args.join(" ");
        Err(eyre!("Failed to run {cmd} {args}. Error {err}"))
    }
}

/// Shared, synchronously accessed state.
///
/// Closures passed to [`State::read`] and [`State::write`] must not await, the
/// lock is never held across a suspension point.
pub struct State<T> {
    state: Arc<RwLock<T>>,
}

impl<T> State<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn read<F, K>(&self, f: F) -> K
    where
        F: FnOnce(&T) -> K,
    {
        let value = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&value)
    }

    pub fn write<F, K>(&self, f: F) -> K
    where
        F: FnOnce(&mut T) -> K,
    {
        let mut value = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut value)
    }

    /// Returns the value it replaced.
    pub fn set(&self, value: T) -> T {
        self.write(|v| std::mem::replace(v, value))
    }
}

impl<T: Clone> State<T> {
    pub fn get(&self) -> T {
        self.read(T::clone)
    }
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Default> Default for State<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
