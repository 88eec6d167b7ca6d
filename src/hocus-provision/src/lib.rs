//! VPN identity and tunnel-configuration provisioning engine.
//!
//! Runs once at server startup: resolves the public address, restores or
//! bootstraps the CA / server / client identities, reconciles newly-added
//! devices into the set without re-keying existing ones, and emits the
//! tunnel daemon's configuration and secrets files.
//!
//! Key material lives in two places: a local material directory (the
//! authoritative copy for the current process lifetime) and a remote
//! key-material store that survives pod restarts. Store writes are always
//! best-effort; store reads fall back to bootstrapping.

pub mod address;
pub mod config;
pub mod error;
pub mod provisioner;
pub mod registry;
pub mod state;
pub mod store;
pub mod tunnel;

pub use address::{AddressError, AddressResolver, AddressResolverConfig};
pub use config::ProvisionConfig;
pub use error::ProvisionError;
pub use provisioner::{Phase, ProvisionReport, Provisioner, ProvisionerOptions, StateSource};
pub use registry::{DeviceRecord, DeviceRegistry, RegistryError};
pub use state::{MaterialDir, ProvisioningState};
pub use store::{
    HttpKeyMaterialStore, KeyMaterialStore, MemoryKeyMaterialStore, StoreError,
};
pub use tunnel::{RenderError, TunnelConfigEmitter};
