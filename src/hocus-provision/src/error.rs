//! Fatal provisioning errors.
//!
//! Only errors that must stop the run live here. Recoverable conditions
//! (store read misses, failed best-effort writes) are handled inside the
//! state machine and never reach the process boundary.

use crate::address::AddressError;
use crate::registry::RegistryError;
use crate::store::StoreError;
use crate::tunnel::RenderError;
use hocus_pki::PkiError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a provisioning run.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// No address source succeeded. There is no safe default: a server
    /// certificate naming the wrong address fails at connect time, which
    /// is far harder to diagnose than failing here.
    #[error("public address resolution failed: {0}")]
    AddressResolution(#[from] AddressError),

    /// Issuance failed during bootstrap or reconciliation.
    #[error("signing failed during {stage}: {source}")]
    Signing {
        stage: &'static str,
        #[source]
        source: PkiError,
    },

    /// The store denied access while reading persisted state. Treating
    /// this as "absent" would bootstrap a fresh CA and orphan every
    /// deployed device profile, so it stops the run instead.
    #[error("key-material store access denied: {0}")]
    StoreAccess(#[from] StoreError),

    /// The device registry violates a load-time invariant.
    #[error("device registry invalid: {0}")]
    Registry(#[from] RegistryError),

    /// The tunnel configuration could not be rendered consistently.
    #[error("tunnel config rendering failed: {0}")]
    ConfigRender(#[from] RenderError),

    /// Local key material could not be read or written.
    #[error("local key material I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    /// Which stage failed, for the process-boundary diagnostic.
    pub fn stage(&self) -> &'static str {
        match self {
            ProvisionError::AddressResolution(_) => "resolve",
            ProvisionError::Signing { stage, .. } => stage,
            ProvisionError::StoreAccess(_) => "restore",
            ProvisionError::Registry(_) => "resolve",
            ProvisionError::ConfigRender(_) => "emit",
            ProvisionError::Io { .. } => "local-state",
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ProvisionError::Io {
            path: path.into(),
            source,
        }
    }
}
