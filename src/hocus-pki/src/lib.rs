//! Certificate authority and identity primitives for the Hocuspocus VPN.
//!
//! One self-signed root CA signs every other certificate in the system:
//! a single server certificate whose SAN is the server's public address,
//! and one client certificate per device whose SAN is the device name.
//!
//! # Security Design
//!
//! - **Root CA**: RSA-4096, 10-year validity, created once, never rotated
//! - **Server cert**: re-issued only when the public address changes
//! - **Client certs**: one per device, never shared, so rotating or
//!   revoking one device cannot invalidate another

pub mod ca;
pub mod error;
pub mod identity;
pub mod pkcs12;

pub use ca::{create_root, issue, CaConfig};
pub use error::{PkiError, Result};
pub use identity::{Identity, IdentityRole};
pub use pkcs12::client_bundle;
