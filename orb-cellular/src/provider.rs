use color_eyre::{eyre::WrapErr as _, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApnEntry {
    pub apn: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub country: String,
    #[serde(default)]
    pub apns: Vec<ApnEntry>,
    #[serde(default)]
    pub requires_roaming: bool,
}

/// Read-only carrier database keyed by operator id (MCC+MNC).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderDatabase {
    providers: HashMap<String, Provider>,
}

impl ProviderDatabase {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let providers = serde_json::from_str(json).wrap_err("malformed provider database")?;
        Ok(Self { providers })
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;

        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn lookup(&self, operator_id: &str) -> Option<&Provider> {
        self.providers.get(operator_id)
    }

    /// The provider that issued the SIM. The IMSI starts with MCC (3 digits)
    /// and MNC (2 or 3 digits); the longer match wins. Falls back to the
    /// operator the modem is currently registered with.
    pub fn home_provider(
        &self,
        imsi: Option<&str>,
        operator_code: Option<&str>,
    ) -> Option<&Provider> {
        let from_imsi = imsi.and_then(|imsi| {
            [6, 5]
                .into_iter()
                .filter_map(|len| imsi.get(..len))
                .find_map(|id| self.lookup(id))
        });

        from_imsi.or_else(|| operator_code.and_then(|code| self.lookup(code)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DB: &str = r#"{
        "26202": {
            "name": "Vodafone",
            "country": "de",
            "apns": [{"apn": "web.vodafone.de"}, {"apn": "event.vodafone.de", "username": "vf", "password": "vf"}]
        },
        "310410": {
            "name": "AT&T",
            "country": "us",
            "apns": [{"apn": "broadband"}],
            "requires_roaming": false
        },
        "29505": {
            "name": "FL1",
            "country": "li",
            "requires_roaming": true
        }
    }"#;

    #[test]
    fn it_looks_up_providers_by_imsi_prefix() {
        let db = ProviderDatabase::from_json(DB).unwrap();

        assert_eq!(db.len(), 3);
        assert_eq!(
            db.home_provider(Some("310410123456789"), None).map(|p| p.name.as_str()),
            Some("AT&T")
        );
        assert_eq!(
            db.home_provider(Some("262021234567890"), None).map(|p| p.apns.len()),
            Some(2)
        );
        assert!(db.home_provider(Some("295050905643977"), None).unwrap().requires_roaming);
    }

    #[test]
    fn it_falls_back_to_the_serving_operator() {
        let db = ProviderDatabase::from_json(DB).unwrap();

        assert_eq!(
            db.home_provider(Some("001010000000000"), Some("26202"))
                .map(|p| p.country.as_str()),
            Some("de")
        );
        assert_eq!(db.home_provider(None, None), None);
    }

    #[test]
    fn it_rejects_malformed_databases() {
        assert!(ProviderDatabase::from_json("[1, 2]").is_err());
    }
}
