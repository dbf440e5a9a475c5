//! TPA credential checks and the static app catalog used by the binary.

use std::collections::BTreeMap;

use glasses_protocol::{AppSettings, InstalledApp};
use thiserror::Error;

use crate::apps::AppRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("unknown package {0}")]
    UnknownPackage(String),
    #[error("invalid api key for {0}")]
    InvalidApiKey(String),
}

impl AuthError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            AuthError::UnknownPackage(_) => "unknown_package",
            AuthError::InvalidApiKey(_) => "invalid_api_key",
        }
    }
}

pub trait CredentialValidator: Send + Sync + 'static {
    fn validate(&self, package_name: &str, api_key: &str) -> Result<(), AuthError>;
}

/// A package and the API key it must present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpaCredential {
    pub package_name: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    app: InstalledApp,
    api_key: String,
    settings: AppSettings,
}

/// Every user sees the same installed apps.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_credentials(credentials: &[TpaCredential]) -> Self {
        credentials.iter().fold(Self::new(), |catalog, credential| {
            catalog.with_app(
                InstalledApp {
                    package_name: credential.package_name.clone(),
                    name: credential.package_name.clone(),
                    description: String::new(),
                },
                credential.api_key.clone(),
            )
        })
    }

    pub fn with_app(mut self, app: InstalledApp, api_key: impl Into<String>) -> Self {
        self.entries.insert(
            app.package_name.clone(),
            CatalogEntry {
                app,
                api_key: api_key.into(),
                settings: AppSettings::default(),
            },
        );
        self
    }

    pub fn with_settings(mut self, package_name: &str, settings: AppSettings) -> Self {
        if let Some(entry) = self.entries.get_mut(package_name) {
            entry.settings = settings;
        }
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CredentialValidator for StaticCatalog {
    fn validate(&self, package_name: &str, api_key: &str) -> Result<(), AuthError> {
        let entry = self
            .entries
            .get(package_name)
            .ok_or_else(|| AuthError::UnknownPackage(package_name.to_string()))?;
        if entry.api_key != api_key {
            return Err(AuthError::InvalidApiKey(package_name.to_string()));
        }
        Ok(())
    }
}

impl AppRegistry for StaticCatalog {
    fn installed_apps(&self, _user_id: &str) -> Vec<InstalledApp> {
        self.entries.values().map(|entry| entry.app.clone()).collect()
    }

    fn settings(&self, _user_id: &str, package_name: &str) -> AppSettings {
        self.entries
            .get(package_name)
            .map(|entry| entry.settings.clone())
            .unwrap_or_default()
    }
}
