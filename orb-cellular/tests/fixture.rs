#![allow(dead_code)]
use async_trait::async_trait;
use bon::bon;
use color_eyre::Result;
use futures::{
    channel::mpsc::{self, UnboundedSender},
    StreamExt as _,
};
use mockall::mock;
use orb_cellular::{
    capability::Technology,
    cellular::Cellular,
    config::CellularConfig,
    modem::{
        BearerPath, ConnectProperties, EquipmentIdentity, HardwareInfo, ModemSignal,
        ModemState, ModemStatus, ModemTransport, RegistrationSnapshot, RegistrationState,
        SimIdentity,
    },
    provider::ProviderDatabase,
    storage::{InMemoryPersistence, Persistence},
    RpcError,
};
use std::time::Duration;
use tokio::{task::JoinHandle, time};

pub const ICCID: &str = "ICCID-001";
pub const IMSI: &str = "310260000000001";
pub const MDN: &str = "4155550100";

pub struct Fixture {
    pub cellular: Cellular,
    signals: UnboundedSender<ModemSignal>,
    events: JoinHandle<Result<()>>,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.events.abort();
    }
}

#[bon]
impl Fixture {
    #[builder(finish_fn = run)]
    pub async fn new(
        transport: MockTransport,
        #[builder(default)] config: CellularConfig,
        storage: Option<Box<dyn Persistence>>,
        #[builder(default)] providers: ProviderDatabase,
    ) -> Self {
        let storage = storage
            .unwrap_or_else(|| Box::new(InMemoryPersistence::new()) as Box<dyn Persistence>);

        let cellular = Cellular::builder()
            .config(config)
            .transport(transport)
            .storage(BoxedPersistence(storage))
            .providers(providers)
            .build()
            .await;

        let (tx, rx) = mpsc::unbounded();
        let events = cellular.spawn(rx.boxed());

        Self {
            cellular,
            signals: tx,
            events,
        }
    }

    /// Delivers a modem signal and lets the device react to it.
    pub async fn signal(&self, signal: ModemSignal) {
        self.signals.unbounded_send(signal).unwrap();
        settle().await;
    }

    pub async fn modem_state(&self, old: ModemState, new: ModemState) {
        self.signal(ModemSignal::StateChanged { old, new }).await;
    }

    pub async fn registration(&self, state: RegistrationState) {
        self.signal(ModemSignal::Registration(RegistrationSnapshot::single(state)))
            .await;
    }

    /// Enables the modem, then brings it onto its home network.
    pub async fn register(&self) {
        self.cellular.start_modem().await.unwrap();
        settle().await;
        self.modem_state(ModemState::Enabled, ModemState::Registered)
            .await;
        self.registration(RegistrationState::Home).await;
    }
}

/// Lets every task that is ready run to completion.
pub async fn settle() {
    time::sleep(Duration::from_millis(10)).await;
}

struct BoxedPersistence(Box<dyn Persistence>);

#[async_trait]
impl Persistence for BoxedPersistence {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.0.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.0.put(key, value).await
    }
}

pub fn status(state: ModemState) -> ModemStatus {
    ModemStatus {
        state,
        operator_code: Some("310260".into()),
        operator_name: Some("T-Mobile".into()),
        access_tech: Some("lte".into()),
        mdn: None,
    }
}

/// A 3GPP modem that enables cleanly and is not registered anywhere yet.
pub fn transport() -> MockTransport {
    let mut mock = MockTransport::new();
    mock.expect_enable().returning(|_, _| Ok(()));
    allow_start(&mut mock, status(ModemState::Enabled));

    mock
}

/// Everything the enable pipeline and its follow up query, except enabling
/// itself. Expectations set before this call take precedence.
pub fn allow_start(mock: &mut MockTransport, status: ModemStatus) {
    mock.expect_status().returning(move |_| Ok(status.clone()));
    mock.expect_sim_identity().returning(|_| {
        Ok(SimIdentity {
            iccid: ICCID.into(),
            imsi: IMSI.into(),
        })
    });
    mock.expect_hardware_info().returning(|_| {
        Ok(HardwareInfo {
            manufacturer: "Quectel".into(),
            model: "EG25".into(),
            revision: "EG25GGBR07A08M2G".into(),
        })
    });
    mock.expect_signal_setup().returning(|_| Ok(()));
    mock.expect_registration()
        .returning(|_| Ok(RegistrationSnapshot::single(RegistrationState::Idle)));
}

pub fn config() -> CellularConfig {
    CellularConfig::builder()
        .technology(Technology::Universal3gpp)
        .registration_debounce(Duration::from_secs(15))
        .build()
}

mock! {
    pub Transport {}
    #[async_trait]
    impl ModemTransport for Transport {
        async fn enable(&self, enable: bool, timeout: Duration) -> Result<(), RpcError>;

        async fn status(&self, timeout: Duration) -> Result<ModemStatus, RpcError>;

        async fn sim_identity(&self, timeout: Duration) -> Result<SimIdentity, RpcError>;

        async fn equipment_identity(
            &self,
            timeout: Duration,
        ) -> Result<EquipmentIdentity, RpcError>;

        async fn hardware_info(&self, timeout: Duration) -> Result<HardwareInfo, RpcError>;

        async fn registration(
            &self,
            timeout: Duration,
        ) -> Result<RegistrationSnapshot, RpcError>;

        async fn connect(
            &self,
            props: ConnectProperties,
            timeout: Duration,
        ) -> Result<BearerPath, RpcError>;

        async fn disconnect(&self, timeout: Duration) -> Result<(), RpcError>;

        async fn activate(&self, carrier: String, timeout: Duration) -> Result<(), RpcError>;

        async fn reset(&self, timeout: Duration) -> Result<(), RpcError>;

        async fn register(&self, network_id: String, timeout: Duration)
            -> Result<(), RpcError>;

        async fn signal_setup(&self, rate: Duration) -> Result<(), RpcError>;
    }
}
