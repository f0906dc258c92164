use super::{
    monitor::ModemSnapshot, BearerPath, ConnectProperties, EquipmentIdentity,
    HardwareInfo, ModemState, ModemStatus, ModemTransport, RegistrationSnapshot,
    RegistrationState, SimIdentity,
};
use crate::{
    error::RpcError,
    utils::{run_cmd, State},
};
use async_trait::async_trait;
use derive_more::Display;
use regex::Regex;
use std::{sync::LazyLock, time::Duration};
use tokio::time;
use tracing::{debug, warn};

macro_rules! jerr {
    ($s:expr) => {
        format!("could not get {}", $s)
    };
}

/// ModemManager numeric modem index, e.g. `0` in `/org/freedesktop/ModemManager1/Modem/0`.
#[derive(Display, Debug, Clone, PartialEq, Eq)]
pub struct ModemId(String);

impl ModemId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<usize> for ModemId {
    fn from(value: usize) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modem {
    pub id: ModemId,
    pub vendor: String,
    pub model: String,
}

/// [`ModemTransport`] backed by `mmcli`. Talks to the first modem ModemManager
/// knows about.
#[derive(Clone, Default)]
pub struct ModemManagerCli {
    modem_id: State<Option<ModemId>>,
}

impl ModemManagerCli {
    /// Extra time granted to mmcli itself on top of the request timeout.
    const GRACE: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self::default()
    }

    pub async fn list_modems(&self) -> Result<Vec<Modem>, RpcError> {
        let output = run_cmd("mmcli", &["-L"])
            .await
            .map_err(|e| classify(&e.to_string()))?;

        Ok(parse_mmcli_modem_list(&output))
    }

    async fn modem_id(&self) -> Result<ModemId, RpcError> {
        if let Some(id) = self.modem_id.get() {
            return Ok(id);
        }

        let modem = self
            .list_modems()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RpcError::Failed("couldn't find a modem".to_string()))?;

        debug!("using modem {} [{}] {}", modem.id, modem.vendor, modem.model);
        self.modem_id.set(Some(modem.id.clone()));

        Ok(modem.id)
    }

    /// Runs `mmcli -m <id> --timeout=<secs> <args..>`.
    async fn modem_cmd(&self, args: &[&str], timeout: Duration) -> Result<String, RpcError> {
        let id = self.modem_id().await?;
        let timeout_arg = format!("--timeout={}", timeout.as_secs().max(1));

        let mut full = vec!["-m", id.as_str(), timeout_arg.as_str()];
        full.extend_from_slice(args);

        self.run(&full, timeout).await
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<String, RpcError> {
        let output = time::timeout(timeout + Self::GRACE, run_cmd("mmcli", args))
            .await
            .map_err(|_| RpcError::Timeout)?;

        output.map_err(|e| {
            let err = classify(&e.to_string());
            if is_modem_gone(&e.to_string()) {
                warn!("modem went away, forgetting cached modem id");
                self.modem_id.set(None);
            }

            err
        })
    }

    async fn modem_json(&self, timeout: Duration) -> Result<serde_json::Value, RpcError> {
        let output = self.modem_cmd(&["-J"], timeout).await?;
        serde_json::from_str(&output).map_err(|e| RpcError::Failed(e.to_string()))
    }

    /// Status, registration and activation out of a single `mmcli -J` call.
    pub async fn poll(&self, timeout: Duration) -> Result<ModemSnapshot, RpcError> {
        let json = self.modem_json(timeout).await?;

        Ok(ModemSnapshot {
            status: parse_status(&json),
            registration: parse_registration(&json),
            activated: parse_activation(&json),
        })
    }
}

#[async_trait]
impl ModemTransport for ModemManagerCli {
    async fn enable(&self, enable: bool, timeout: Duration) -> Result<(), RpcError> {
        let arg = if enable { "--enable" } else { "--disable" };
        self.modem_cmd(&[arg], timeout).await?;

        Ok(())
    }

    async fn status(&self, timeout: Duration) -> Result<ModemStatus, RpcError> {
        let json = self.modem_json(timeout).await?;
        Ok(parse_status(&json))
    }

    async fn sim_identity(&self, timeout: Duration) -> Result<SimIdentity, RpcError> {
        let json = self.modem_json(timeout).await?;
        let sim_id = parse_sim_id(&json)
            .ok_or_else(|| RpcError::Failed(jerr!("modem.generic.sim")))?;

        let output = self.run(&["-i", &sim_id.to_string(), "-J"], timeout).await?;
        let json: serde_json::Value =
            serde_json::from_str(&output).map_err(|e| RpcError::Failed(e.to_string()))?;

        parse_sim_identity(&json)
    }

    async fn equipment_identity(
        &self,
        timeout: Duration,
    ) -> Result<EquipmentIdentity, RpcError> {
        let json = self.modem_json(timeout).await?;
        parse_equipment_identity(&json)
    }

    async fn hardware_info(&self, timeout: Duration) -> Result<HardwareInfo, RpcError> {
        let json = self.modem_json(timeout).await?;
        Ok(parse_hardware_info(&json))
    }

    async fn registration(
        &self,
        timeout: Duration,
    ) -> Result<RegistrationSnapshot, RpcError> {
        let json = self.modem_json(timeout).await?;
        Ok(parse_registration(&json))
    }

    async fn connect(
        &self,
        props: ConnectProperties,
        timeout: Duration,
    ) -> Result<BearerPath, RpcError> {
        let arg = format!("--simple-connect={}", simple_connect_args(&props));
        self.modem_cmd(&[arg.as_str()], timeout).await?;

        let json = self.modem_json(timeout).await?;
        let bearer = json["modem"]["generic"]["bearers"]
            .as_array()
            .and_then(|b| b.first()?.as_str())
            .unwrap_or("/")
            .to_string();

        Ok(bearer)
    }

    async fn disconnect(&self, timeout: Duration) -> Result<(), RpcError> {
        self.modem_cmd(&["--simple-disconnect"], timeout).await?;
        Ok(())
    }

    async fn activate(&self, carrier: String, timeout: Duration) -> Result<(), RpcError> {
        let arg = format!("--cdma-activate={carrier}");
        self.modem_cmd(&[arg.as_str()], timeout).await?;

        Ok(())
    }

    async fn reset(&self, timeout: Duration) -> Result<(), RpcError> {
        self.modem_cmd(&["--reset"], timeout).await?;
        // the modem re-enumerates with a new index after a reset
        self.modem_id.set(None);

        Ok(())
    }

    async fn register(
        &self,
        network_id: String,
        timeout: Duration,
    ) -> Result<(), RpcError> {
        let arg = format!("--3gpp-register-in-operator={network_id}");
        self.modem_cmd(&[arg.as_str()], timeout).await?;

        Ok(())
    }

    async fn signal_setup(&self, rate: Duration) -> Result<(), RpcError> {
        let arg = format!("--signal-setup={}", rate.as_secs());
        self.modem_cmd(&[arg.as_str()], Duration::from_secs(10)).await?;

        Ok(())
    }
}

/// Maps ModemManager D-Bus error names found in mmcli's stderr to [`RpcError`].
pub fn classify(err: &str) -> RpcError {
    let lower = err.to_ascii_lowercase();

    if lower.contains("wrongstate") || lower.contains("wrong state") {
        RpcError::WrongState
    } else if lower.contains("missingorunknownapn")
        || lower.contains("invalidapn")
        || lower.contains("unknown apn")
    {
        RpcError::InvalidApn(err.trim().to_string())
    } else if lower.contains("nonetwork") || lower.contains("no network") {
        RpcError::NoNetwork
    } else if lower.contains("core.timeout") || lower.contains("timed out") {
        RpcError::Timeout
    } else {
        RpcError::Failed(err.trim().to_string())
    }
}

fn is_modem_gone(err: &str) -> bool {
    err.contains("couldn't find modem") || err.contains("UnknownObject")
}

fn simple_connect_args(props: &ConnectProperties) -> String {
    let mut args = Vec::new();
    if let Some(apn) = &props.apn {
        args.push(format!("apn={apn}"));
    }
    if let Some(user) = &props.username {
        args.push(format!("user={user}"));
    }
    if let Some(password) = &props.password {
        args.push(format!("password={password}"));
    }

    let roaming = if props.allow_roaming { "yes" } else { "no" };
    args.push(format!("allow-roaming={roaming}"));

    args.join(",")
}

fn parse_mmcli_modem_list(str: &str) -> Vec<Modem> {
    static RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^/org/freedesktop/ModemManager\d+/Modem/(?P<id>\d+)\s+\[(?P<vendor>[^\]]+)]\s+(?P<model>.+)$").unwrap()
    });

    str.trim()
        .split("\n")
        .map(|line| line.trim())
        .filter(|line| line.starts_with("/org/freedesktop"))
        .filter_map(|line| {
            let captures = RE.captures(line.trim())?;
            let id = captures.name("id")?.as_str().parse::<usize>().ok()?;
            let vendor = captures.name("vendor")?.as_str().to_string();
            let model = captures.name("model")?.as_str().to_string();

            Some(Modem {
                id: ModemId::from(id),
                vendor,
                model,
            })
        })
        .collect()
}

/// mmcli prints `--` for unset values.
fn field(value: &serde_json::Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "--")
        .map(str::to_string)
}

fn parse_status(json: &serde_json::Value) -> ModemStatus {
    let modem = &json["modem"];

    ModemStatus {
        state: modem["generic"]["state"]
            .as_str()
            .map(ModemState::from)
            .unwrap_or_default(),
        operator_code: field(&modem["3gpp"]["operator-code"]),
        operator_name: field(&modem["3gpp"]["operator-name"]),
        access_tech: modem["generic"]["access-technologies"]
            .as_array()
            .and_then(|a| field(a.first()?)),
        mdn: modem["generic"]["own-numbers"]
            .as_array()
            .and_then(|a| field(a.first()?)),
    }
}

fn parse_sim_id(json: &serde_json::Value) -> Option<usize> {
    json["modem"]["generic"]["sim"]
        .as_str()
        .and_then(|s| s.split("/").last()?.parse().ok())
}

fn parse_sim_identity(json: &serde_json::Value) -> Result<SimIdentity, RpcError> {
    let props = &json["sim"]["properties"];

    let iccid = field(&props["iccid"])
        .ok_or_else(|| RpcError::Failed(jerr!("sim.properties.iccid")))?;
    let imsi = field(&props["imsi"])
        .ok_or_else(|| RpcError::Failed(jerr!("sim.properties.imsi")))?;

    Ok(SimIdentity { iccid, imsi })
}

fn parse_equipment_identity(
    json: &serde_json::Value,
) -> Result<EquipmentIdentity, RpcError> {
    let modem = &json["modem"];

    let equipment_id = field(&modem["generic"]["equipment-identifier"])
        .or_else(|| field(&modem["cdma"]["meid"]))
        .ok_or_else(|| RpcError::Failed(jerr!("modem.generic.equipment-identifier")))?;

    Ok(EquipmentIdentity {
        equipment_id,
        esn: field(&modem["cdma"]["esn"]),
    })
}

fn parse_hardware_info(json: &serde_json::Value) -> HardwareInfo {
    let generic = &json["modem"]["generic"];

    HardwareInfo {
        manufacturer: field(&generic["manufacturer"]).unwrap_or_default(),
        model: field(&generic["model"]).unwrap_or_default(),
        revision: field(&generic["revision"]).unwrap_or_default(),
    }
}

fn parse_registration(json: &serde_json::Value) -> RegistrationSnapshot {
    let modem = &json["modem"];

    if let Some(gpp) = field(&modem["3gpp"]["registration-state"]) {
        return RegistrationSnapshot::single(RegistrationState::from(gpp.as_str()));
    }

    let cdma1x = field(&modem["cdma"]["cdma1x-registration-state"]);
    let evdo = field(&modem["cdma"]["evdo-registration-state"]);
    let reg = |s: Option<String>| {
        s.map(|s| RegistrationState::from(s.as_str()))
            .unwrap_or_default()
    };

    RegistrationSnapshot::dual(reg(cdma1x), reg(evdo))
}

/// `Some(true)` once the CDMA activation state reads "activated".
fn parse_activation(json: &serde_json::Value) -> Option<bool> {
    field(&json["modem"]["cdma"]["activation-state"]).map(|s| s == "activated")
}
