use crate::{
    capability::Capability,
    error::{CellularError, Result},
    modem::{BearerPath, ConnectProperties},
    provider::{ApnEntry, ProviderDatabase},
    storage::Persistence,
    utils::State,
};
use color_eyre::eyre::WrapErr as _;
use dashmap::DashMap;
use derive_more::Display;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

const LAST_GOOD_APN_KEY: &str = "last-good-apn-v1";

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApnOrigin {
    #[display("last-good")]
    LastGood,
    #[display("user")]
    UserSupplied,
    #[display("carrier-db")]
    CarrierDatabase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApnCandidate {
    pub entry: ApnEntry,
    pub origin: ApnOrigin,
}

impl ApnCandidate {
    fn properties(&self, allow_roaming: bool) -> ConnectProperties {
        ConnectProperties {
            apn: Some(self.entry.apn.clone()),
            username: self.entry.username.clone(),
            password: self.entry.password.clone(),
            allow_roaming,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    pub bearer: BearerPath,
    /// `None` if the modem connected with its default bearer settings.
    pub apn: Option<ApnCandidate>,
}

/// The APN that last brought a data session up, per device.
#[derive(Clone)]
pub struct LastGoodApnStore {
    entries: Arc<DashMap<String, ApnEntry>>,
    storage: Arc<dyn Persistence>,
}

impl LastGoodApnStore {
    pub async fn load(storage: Arc<dyn Persistence>) -> Self {
        let store = Self {
            entries: Arc::new(DashMap::new()),
            storage,
        };

        let loaded = store
            .storage
            .get(LAST_GOOD_APN_KEY)
            .await
            .and_then(|bytes| {
                bytes
                    .map(|b| serde_json::from_slice::<BTreeMap<String, ApnEntry>>(&b))
                    .transpose()
                    .wrap_err("malformed last good apn table")
            });

        match loaded {
            Ok(entries) => {
                for (identity, entry) in entries.unwrap_or_default() {
                    store.entries.insert(identity, entry);
                }
            }
            Err(e) => warn!("failed to load last good apns, starting empty: {e:?}"),
        }

        store
    }

    pub fn get(&self, identity: &str) -> Option<ApnEntry> {
        self.entries.get(identity).map(|e| e.value().clone())
    }

    pub async fn set(&self, identity: &str, entry: ApnEntry) {
        self.entries.insert(identity.to_string(), entry);
        self.save().await;
    }

    pub async fn clear(&self, identity: &str) {
        if self.entries.remove(identity).is_some() {
            self.save().await;
        }
    }

    async fn save(&self) {
        let snapshot: BTreeMap<_, _> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let res = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => self.storage.put(LAST_GOOD_APN_KEY, bytes).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = res {
            warn!("failed to persist last good apns: {e:?}");
        }
    }
}

/// Walks the APN try-list until the modem accepts one.
pub struct ConnectionManager {
    capability: Arc<Capability>,
    providers: Arc<ProviderDatabase>,
    last_good: LastGoodApnStore,
    user_apn: State<Option<ApnEntry>>,
    allow_roaming: bool,
    in_flight: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        capability: Arc<Capability>,
        providers: Arc<ProviderDatabase>,
        last_good: LastGoodApnStore,
        allow_roaming: bool,
    ) -> Self {
        Self {
            capability,
            providers,
            last_good,
            user_apn: State::default(),
            allow_roaming,
            in_flight: Mutex::new(()),
        }
    }

    /// An explicit APN always wins over what worked before.
    pub async fn set_user_apn(&self, apn: Option<ApnEntry>) {
        if apn.is_some()
            && let Some(key) = self.identity_key()
        {
            self.last_good.clear(&key).await;
        }

        self.user_apn.set(apn);
    }

    pub fn user_apn(&self) -> Option<ApnEntry> {
        self.user_apn.get()
    }

    pub fn last_good_apn(&self) -> Option<ApnEntry> {
        self.identity_key().and_then(|key| self.last_good.get(&key))
    }

    pub fn build_try_list(&self) -> VecDeque<ApnCandidate> {
        let status = self.capability.status();
        let imsi = self.capability.imsi();
        let provider = self
            .providers
            .home_provider(imsi.as_deref(), status.operator_code.as_deref());

        let last_good = self.last_good_apn().map(|entry| ApnCandidate {
            entry,
            origin: ApnOrigin::LastGood,
        });

        let user = self.user_apn().map(|entry| ApnCandidate {
            entry,
            origin: ApnOrigin::UserSupplied,
        });

        let carrier = provider.into_iter().flat_map(|p| &p.apns).map(|entry| ApnCandidate {
            entry: entry.clone(),
            origin: ApnOrigin::CarrierDatabase,
        });

        last_good.into_iter().chain(user).chain(carrier).collect()
    }

    /// Only invalid APNs move on to the next candidate, any other failure
    /// ends the attempt right away. A given `apn` replaces the user APN once
    /// no other connect is in flight.
    #[instrument(skip(self, apn))]
    pub async fn connect(&self, apn: Option<ApnEntry>) -> Result<Connected> {
        let Ok(_in_flight) = self.in_flight.try_lock() else {
            warn!("rejecting connect, another one is in flight");
            return Err(CellularError::DeviceBusy);
        };

        if apn.is_some() {
            self.set_user_apn(apn).await;
        }

        let allow_roaming = self.allow_roaming || self.provider_requires_roaming();
        let mut try_list = self.build_try_list();

        if try_list.is_empty() {
            info!("no apn candidates, connecting with the modem's default settings");
            let bearer = self
                .capability
                .connect(ConnectProperties {
                    allow_roaming,
                    ..Default::default()
                })
                .await?;

            return Ok(Connected { bearer, apn: None });
        }

        let mut last_err = None;

        while let Some(candidate) = try_list.pop_front() {
            info!(
                "connecting with apn {} ({})",
                candidate.entry.apn, candidate.origin
            );

            match self
                .capability
                .connect(candidate.properties(allow_roaming))
                .await
            {
                Ok(bearer) => {
                    if let Some(key) = self.identity_key() {
                        self.last_good.set(&key, candidate.entry.clone()).await;
                    }

                    return Ok(Connected {
                        bearer,
                        apn: Some(candidate),
                    });
                }

                Err(CellularError::InvalidApn(msg)) => {
                    warn!(
                        "apn {} rejected: {msg}, {} candidates left",
                        candidate.entry.apn,
                        try_list.len()
                    );
                    last_err = Some(CellularError::InvalidApn(msg));
                }

                Err(e) => return Err(e),
            }
        }

        warn!("every apn candidate was rejected");
        if let Some(key) = self.identity_key() {
            self.last_good.clear(&key).await;
        }

        Err(last_err.unwrap_or_else(|| CellularError::InvalidApn("no candidates".into())))
    }

    fn identity_key(&self) -> Option<String> {
        self.capability.identity().map(|id| id.key().to_string())
    }

    fn provider_requires_roaming(&self) -> bool {
        let status = self.capability.status();
        let imsi = self.capability.imsi();

        self.providers
            .home_provider(imsi.as_deref(), status.operator_code.as_deref())
            .is_some_and(|p| p.requires_roaming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capability::Technology,
        error::RpcError,
        modem::{HardwareInfo, MockModemTransport, ModemState, ModemStatus, SimIdentity},
        storage::InMemoryPersistence,
    };
    use proptest::prelude::*;
    use std::{sync::Mutex as StdMutex, time::Duration};

    const DB: &str = r#"{
        "26201": {
            "name": "Telekom",
            "country": "de",
            "apns": [{"apn": "internet.telekom"}, {"apn": "internet.t-d1.de", "username": "t-mobile", "password": "tm"}]
        },
        "29505": {"name": "FL1", "country": "li", "apns": [{"apn": "fl1"}], "requires_roaming": true}
    }"#;

    fn entry(apn: &str) -> ApnEntry {
        ApnEntry {
            apn: apn.into(),
            username: None,
            password: None,
        }
    }

    /// A transport that went through a successful start with the given IMSI.
    fn started_transport(imsi: &'static str) -> MockModemTransport {
        let mut mock = MockModemTransport::new();
        mock.expect_enable().returning(|_, _| Ok(()));
        mock.expect_status().returning(|_| {
            Ok(ModemStatus {
                state: ModemState::Registered,
                ..Default::default()
            })
        });
        mock.expect_sim_identity().returning(move |_| {
            Ok(SimIdentity {
                iccid: "ICCID-001".into(),
                imsi: imsi.into(),
            })
        });
        mock.expect_hardware_info()
            .returning(|_| Ok(HardwareInfo::default()));
        mock
    }

    async fn manager(
        mock: MockModemTransport,
        storage: Arc<dyn Persistence>,
    ) -> ConnectionManager {
        let capability = Arc::new(
            Capability::builder()
                .technology(Technology::Universal3gpp)
                .transport(Arc::new(mock))
                .build(),
        );
        capability.start_modem(Duration::from_secs(1)).await.unwrap();

        ConnectionManager::new(
            capability,
            Arc::new(ProviderDatabase::from_json(DB).unwrap()),
            LastGoodApnStore::load(storage).await,
            false,
        )
    }

    fn record_connects(
        mock: &mut MockModemTransport,
        replies: Vec<std::result::Result<BearerPath, RpcError>>,
    ) -> Arc<StdMutex<Vec<ConnectProperties>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let replies = StdMutex::new(VecDeque::from(replies));

        mock.expect_connect().returning(move |props, _| {
            log.lock().unwrap().push(props);
            replies.lock().unwrap().pop_front().unwrap()
        });

        seen
    }

    fn apns(seen: &StdMutex<Vec<ConnectProperties>>) -> Vec<Option<String>> {
        seen.lock().unwrap().iter().map(|p| p.apn.clone()).collect()
    }

    #[tokio::test]
    async fn it_orders_candidates_by_origin() {
        // Arrange
        let storage = Arc::new(InMemoryPersistence::new());
        let manager = manager(started_transport("262011234567890"), storage).await;
        manager.last_good.set("ICCID-001", entry("remembered")).await;

        // Act
        manager.user_apn.set(Some(entry("internet.telekom")));
        let list = manager.build_try_list();

        // Assert
        let origins: Vec<_> = list.iter().map(|c| c.origin).collect();
        let names: Vec<_> = list.iter().map(|c| c.entry.apn.as_str()).collect();
        assert_eq!(
            origins,
            vec![
                ApnOrigin::LastGood,
                ApnOrigin::UserSupplied,
                ApnOrigin::CarrierDatabase,
                ApnOrigin::CarrierDatabase,
            ]
        );
        assert_eq!(
            names,
            vec!["remembered", "internet.telekom", "internet.telekom", "internet.t-d1.de"]
        );
        assert_eq!(list[3].entry.username.as_deref(), Some("t-mobile"));
    }

    #[tokio::test]
    async fn it_forgets_the_last_good_apn_when_the_user_picks_one() {
        let storage = Arc::new(InMemoryPersistence::new());
        let manager = manager(started_transport("262011234567890"), storage).await;
        manager.last_good.set("ICCID-001", entry("remembered")).await;

        manager.set_user_apn(Some(entry("custom"))).await;

        assert_eq!(manager.last_good_apn(), None);
        assert_eq!(manager.build_try_list()[0].origin, ApnOrigin::UserSupplied);
    }

    #[tokio::test]
    async fn it_walks_the_list_past_invalid_apns() {
        // Arrange
        let storage: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        let mut mock = started_transport("262011234567890");
        let seen = record_connects(
            &mut mock,
            vec![
                Err(RpcError::InvalidApn("a".into())),
                Err(RpcError::InvalidApn("b".into())),
                Ok("/bearer/3".into()),
            ],
        );
        let manager = manager(mock, Arc::clone(&storage)).await;
        manager.user_apn.set(Some(entry("A")));

        // Act
        let connected = manager.connect(None).await.unwrap();

        // Assert
        assert_eq!(
            apns(&seen),
            vec![
                Some("A".into()),
                Some("internet.telekom".into()),
                Some("internet.t-d1.de".into()),
            ]
        );
        assert_eq!(connected.bearer, "/bearer/3");
        assert_eq!(manager.last_good_apn().unwrap().apn, "internet.t-d1.de");

        let reloaded = LastGoodApnStore::load(storage).await;
        assert_eq!(reloaded.get("ICCID-001").unwrap().apn, "internet.t-d1.de");
    }

    #[tokio::test]
    async fn it_clears_the_last_good_apn_once_every_candidate_failed() {
        // Arrange
        let storage = Arc::new(InMemoryPersistence::new());
        let mut mock = started_transport("262011234567890");
        let seen = record_connects(
            &mut mock,
            vec![
                Err(RpcError::InvalidApn("a".into())),
                Err(RpcError::InvalidApn("b".into())),
                Err(RpcError::InvalidApn("c".into())),
            ],
        );
        let manager = manager(mock, storage).await;
        manager.last_good.set("ICCID-001", entry("remembered")).await;

        // Act
        let res = manager.connect(None).await;

        // Assert
        assert_eq!(res, Err(CellularError::InvalidApn("c".into())));
        assert_eq!(apns(&seen).len(), 3);
        assert_eq!(manager.last_good_apn(), None);
    }

    #[tokio::test]
    async fn it_gives_up_on_errors_other_than_invalid_apn() {
        let storage = Arc::new(InMemoryPersistence::new());
        let mut mock = started_transport("262011234567890");
        let seen = record_connects(&mut mock, vec![Err(RpcError::NoNetwork)]);
        let manager = manager(mock, storage).await;
        manager.last_good.set("ICCID-001", entry("remembered")).await;

        let res = manager.connect(None).await;

        assert!(matches!(res, Err(CellularError::OperationFailed(_))));
        assert_eq!(apns(&seen), vec![Some("remembered".into())]);
        assert_eq!(manager.last_good_apn().unwrap().apn, "remembered");
    }

    #[tokio::test]
    async fn it_connects_without_an_apn_when_there_are_no_candidates() {
        let storage = Arc::new(InMemoryPersistence::new());
        let mut mock = started_transport("001010000000000");
        let seen = record_connects(&mut mock, vec![Ok("/bearer/0".into())]);
        let manager = manager(mock, storage).await;

        let connected = manager.connect(None).await.unwrap();

        assert_eq!(connected.apn, None);
        assert_eq!(apns(&seen), vec![None]);
    }

    #[tokio::test]
    async fn it_allows_roaming_when_the_provider_requires_it() {
        let storage = Arc::new(InMemoryPersistence::new());
        let mut mock = started_transport("295050905643977");
        let seen = record_connects(&mut mock, vec![Ok("/bearer/0".into())]);
        let manager = manager(mock, storage).await;

        manager.connect(None).await.unwrap();

        assert!(seen.lock().unwrap()[0].allow_roaming);
    }

    #[tokio::test]
    async fn it_rejects_a_second_connect_while_one_is_in_flight() {
        // Arrange
        let storage = Arc::new(InMemoryPersistence::new());
        let mut mock = started_transport("262011234567890");
        mock.expect_connect().never();
        let manager = manager(mock, storage).await;
        let _in_flight = manager.in_flight.lock().await;

        // Act
        let res = manager.connect(None).await;

        // Assert
        assert_eq!(res, Err(CellularError::DeviceBusy));
    }

    #[tokio::test]
    async fn it_keeps_the_apn_settings_when_a_connect_is_rejected_as_busy() {
        // Arrange
        let storage = Arc::new(InMemoryPersistence::new());
        let mut mock = started_transport("262011234567890");
        mock.expect_connect().never();
        let manager = manager(mock, storage).await;
        manager.last_good.set("ICCID-001", entry("remembered")).await;
        let _in_flight = manager.in_flight.lock().await;

        // Act
        let res = manager.connect(Some(entry("custom"))).await;

        // Assert
        assert_eq!(res, Err(CellularError::DeviceBusy));
        assert_eq!(manager.user_apn(), None);
        assert_eq!(manager.last_good_apn().unwrap().apn, "remembered");
    }

    #[tokio::test]
    async fn it_takes_over_the_apn_passed_to_connect() {
        // Arrange
        let storage = Arc::new(InMemoryPersistence::new());
        let mut mock = started_transport("262011234567890");
        let seen = record_connects(&mut mock, vec![Ok("/bearer/0".into())]);
        let manager = manager(mock, storage).await;
        manager.last_good.set("ICCID-001", entry("remembered")).await;

        // Act
        manager.connect(Some(entry("custom"))).await.unwrap();

        // Assert
        assert_eq!(apns(&seen), vec![Some("custom".into())]);
        assert_eq!(manager.user_apn().unwrap().apn, "custom");
        assert_eq!(manager.last_good_apn().unwrap().apn, "custom");
    }

    proptest! {
        #[test]
        fn try_lists_keep_tier_order(
            last_good in proptest::option::of("[a-z]{1,8}"),
            user in proptest::option::of("[a-z]{1,8}"),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();

            let list = rt.block_on(async {
                let storage = Arc::new(InMemoryPersistence::new());
                let manager = manager(started_transport("262011234567890"), storage).await;
                if let Some(apn) = &last_good {
                    manager.last_good.set("ICCID-001", entry(apn)).await;
                }
                manager.user_apn.set(user.as_deref().map(entry));
                manager.build_try_list()
            });

            let expected = usize::from(last_good.is_some()) + usize::from(user.is_some()) + 2;
            prop_assert_eq!(list.len(), expected);
            prop_assert!(list
                .iter()
                .zip(list.iter().skip(1))
                .all(|(a, b)| rank(a.origin) <= rank(b.origin)));
        }
    }

    fn rank(origin: ApnOrigin) -> u8 {
        match origin {
            ApnOrigin::LastGood => 0,
            ApnOrigin::UserSupplied => 1,
            ApnOrigin::CarrierDatabase => 2,
        }
    }
}
