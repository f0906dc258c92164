use crate::storage::Persistence;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::WrapErr as _, Result};
use dashmap::DashMap;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const ACTIVATION_KEY: &str = "activation-v1";

#[derive(
    Display, Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum ActivationStatus {
    #[default]
    Unknown,
    Pending,
    PendingRetry,
    PendingTimeout,
    Activated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub identity: String,
    pub status: ActivationStatus,
    pub carrier: Option<String>,
    /// Confirmation waits that ran out since the last explicit request.
    pub timeouts: u32,
    /// Automatic re-issues since the last explicit request.
    pub retries: u32,
    pub updated_at: DateTime<Utc>,
}

impl ActivationRecord {
    fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            status: ActivationStatus::Unknown,
            carrier: None,
            timeouts: 0,
            retries: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Activation progress per device identity, persisted after every mutation.
///
/// The in-memory table is authoritative; failing to persist it is logged and
/// otherwise ignored.
#[derive(Clone)]
pub struct ActivationStore {
    records: Arc<DashMap<String, ActivationRecord>>,
    storage: Arc<dyn Persistence>,
    save_lock: Arc<Mutex<()>>,
}

impl ActivationStore {
    pub async fn load(storage: Arc<dyn Persistence>) -> Self {
        let store = Self {
            records: Arc::new(DashMap::new()),
            storage,
            save_lock: Arc::new(Mutex::new(())),
        };

        match store.read().await {
            Ok(records) => {
                debug!("loaded {} activation records", records.len());
                for (identity, record) in records {
                    store.records.insert(identity, record);
                }
            }

            Err(e) => warn!("failed to load activation records, starting empty: {e:?}"),
        }

        store
    }

    pub fn get(&self, identity: &str) -> ActivationStatus {
        self.records
            .get(identity)
            .map(|r| r.status)
            .unwrap_or_default()
    }

    pub fn record(&self, identity: &str) -> Option<ActivationRecord> {
        self.records.get(identity).map(|r| r.value().clone())
    }

    pub fn identities(&self) -> Vec<String> {
        self.records.iter().map(|r| r.key().clone()).collect()
    }

    pub async fn set(&self, identity: &str, status: ActivationStatus) -> ActivationRecord {
        self.update(identity, |r| r.status = status).await
    }

    /// Upserts the record of `identity`.
    pub async fn update<F>(&self, identity: &str, f: F) -> ActivationRecord
    where
        F: FnOnce(&mut ActivationRecord),
    {
        let record = {
            let mut entry = self
                .records
                .entry(identity.to_string())
                .or_insert_with(|| ActivationRecord::new(identity));

            f(entry.value_mut());
            entry.updated_at = Utc::now();
            entry.clone()
        };

        debug!(
            "activation of {identity} is {} (retries: {}, timeouts: {})",
            record.status, record.retries, record.timeouts
        );

        self.save().await;

        record
    }

    pub async fn remove(&self, identity: &str) {
        if self.records.remove(identity).is_some() {
            self.save().await;
        }
    }

    async fn read(&self) -> Result<BTreeMap<String, ActivationRecord>> {
        let Some(bytes) = self.storage.get(ACTIVATION_KEY).await? else {
            return Ok(BTreeMap::new());
        };

        serde_json::from_slice(&bytes).wrap_err("malformed activation records")
    }

    async fn save(&self) {
        // Snapshot under the lock so that concurrent saves land in order.
        let _lock = self.save_lock.lock().await;

        let snapshot: BTreeMap<_, _> = self
            .records
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();

        let res = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => self.storage.put(ACTIVATION_KEY, bytes).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = res {
            warn!("failed to persist activation records: {e:?}");
        }
    }
}
