//! Provisioning configuration.
//!
//! Layering, lowest to highest priority: config file (JSON), environment
//! variables (`HOCUS_*`), CLI flags (applied by the binary).

use crate::address::AddressResolverConfig;
use crate::registry::{DeviceRecord, DeviceRegistry, RegistryError};
use hocus_pki::CaConfig;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("environment override {name} invalid: {value:?}")]
    Env { name: &'static str, value: String },

    #[error("pki.key_bits = {0} is below the 3072-bit production floor")]
    WeakKey(usize),
}

/// Remote key-material store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Base URL of the blob store namespace
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

impl StoreSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Tunnel network layout and the device list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_subnet")]
    pub subnet: Ipv4Net,
    #[serde(default = "default_pool")]
    pub pool: Ipv4Net,
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
}

impl NetworkSettings {
    pub fn registry(&self) -> Result<DeviceRegistry, RegistryError> {
        DeviceRegistry::new(self.subnet, self.pool, self.devices.clone())
    }
}

/// Public-address resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressSettings {
    #[serde(default)]
    pub override_addr: Option<IpAddr>,
    #[serde(default)]
    pub metadata_url: Option<String>,
    #[serde(default)]
    pub echo_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

impl Default for AddressSettings {
    fn default() -> Self {
        Self {
            override_addr: None,
            metadata_url: None,
            echo_url: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_retries(),
        }
    }
}

impl AddressSettings {
    pub fn resolver_config(&self) -> AddressResolverConfig {
        let defaults = AddressResolverConfig::default();
        AddressResolverConfig {
            override_addr: self.override_addr,
            metadata_url: self
                .metadata_url
                .clone()
                .unwrap_or(defaults.metadata_url),
            echo_url: self.echo_url.clone().unwrap_or(defaults.echo_url),
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
        }
    }
}

/// Top-level provisioning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    pub store: StoreSettings,
    pub network: NetworkSettings,
    #[serde(default)]
    pub address: AddressSettings,
    #[serde(default)]
    pub pki: CaConfig,
    #[serde(default = "default_material_dir")]
    pub material_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Passphrase protecting per-device PKCS12 bundles
    #[serde(default = "default_p12_passphrase")]
    pub p12_passphrase: String,
    /// Also maintain the legacy shared client identity
    #[serde(default)]
    pub shared_client_identity: bool,
    /// Skip devices whose issuance fails during reconciliation instead of
    /// aborting the run
    #[serde(default)]
    pub skip_failed_devices: bool,
}

impl ProvisionConfig {
    /// Load from a JSON file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self =
            serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.apply_env()?;
        if config.pki.key_bits < 3072 {
            return Err(ConfigError::WeakKey(config.pki.key_bits));
        }
        Ok(config)
    }

    /// Environment overrides: `HOCUS_PUBLIC_ADDR`, `HOCUS_STORE_URL`,
    /// `HOCUS_P12_PASSPHRASE`.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var("HOCUS_PUBLIC_ADDR") {
            let addr = value.parse().map_err(|_| ConfigError::Env {
                name: "HOCUS_PUBLIC_ADDR",
                value: value.clone(),
            })?;
            self.address.override_addr = Some(addr);
        }
        if let Ok(value) = std::env::var("HOCUS_STORE_URL") {
            self.store.base_url = value;
        }
        if let Ok(value) = std::env::var("HOCUS_P12_PASSPHRASE") {
            self.p12_passphrase = value;
        }
        Ok(())
    }
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_retries() -> u32 {
    2
}

fn default_subnet() -> Ipv4Net {
    "10.11.0.0/24".parse().expect("valid default subnet")
}

fn default_pool() -> Ipv4Net {
    "10.11.0.128/25".parse().expect("valid default pool")
}

fn default_material_dir() -> PathBuf {
    PathBuf::from("/etc/hocus/material")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/etc/hocus/ipsec")
}

fn default_p12_passphrase() -> String {
    "hocuspocus".to_string()
}
