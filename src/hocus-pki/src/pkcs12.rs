//! PKCS12 bundle assembly for client distribution.
//!
//! Each bundle holds exactly one client's private key, its certificate and
//! the CA certificate, protected by a passphrase. Downstream tooling wraps
//! the bundle into an installable device profile.

use crate::{Identity, IdentityRole, PkiError, Result};
use p12_keystore::{Certificate, KeyStore, KeyStoreEntry, PrivateKeyChain};
use sha2::{Digest, Sha256};

/// Build a passphrase-protected PKCS12 bundle for one client identity.
///
/// Contains the client key, client certificate and CA certificate, and
/// nothing belonging to any other client.
pub fn client_bundle(client: &Identity, ca: &Identity, passphrase: &str) -> Result<Vec<u8>> {
    if client.role != IdentityRole::Client {
        return Err(PkiError::Pkcs12(format!(
            "bundle requires a client identity, got {}",
            client.role
        )));
    }

    let client_der = pem_to_cert_der(&client.cert_pem)?;
    let ca_der = pem_to_cert_der(&ca.cert_pem)?;
    let key_der = pem_to_key_der(&client.key_pem)?;

    let client_cert = Certificate::from_der(&client_der)
        .map_err(|e| PkiError::Pkcs12(format!("client certificate: {e}")))?;
    let ca_cert = Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::Pkcs12(format!("CA certificate: {e}")))?;

    // local key id links the key to its certificate inside the container
    let local_key_id = Sha256::digest(&client_der)[..20].to_vec();
    let chain = PrivateKeyChain::new(key_der, local_key_id, vec![client_cert, ca_cert]);

    let mut keystore = KeyStore::new();
    keystore.add_entry(&client.subject, KeyStoreEntry::PrivateKeyChain(chain));
    keystore
        .writer(passphrase)
        .write()
        .map_err(|e| PkiError::Pkcs12(e.to_string()))
}

fn pem_to_cert_der(pem: &str) -> Result<Vec<u8>> {
    let mut reader = pem.as_bytes();
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| PkiError::Certificate("no certificate in PEM".into()))?
        .map_err(|e| PkiError::Certificate(e.to_string()))?;
    Ok(cert.as_ref().to_vec())
}

fn pem_to_key_der(pem: &str) -> Result<Vec<u8>> {
    let mut reader = pem.as_bytes();
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| PkiError::InvalidKey(e.to_string()))?
        .ok_or_else(|| PkiError::InvalidKey("no private key in PEM".into()))?;
    Ok(key.secret_der().to_vec())
}
