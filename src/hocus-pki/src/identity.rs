//! Identity value objects.
//!
//! An [`Identity`] is a key pair plus an X.509 certificate, frozen at
//! issuance. Nothing mutates an identity after creation; rotation means
//! issuing a replacement.

use crate::{PkiError, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;

/// Role an identity plays in the trust hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityRole {
    /// Self-signed root, signs everything else
    Ca,
    /// The VPN server's own identity, SAN = public address
    Server,
    /// One per device, SAN = device name
    Client,
}

impl std::fmt::Display for IdentityRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityRole::Ca => write!(f, "ca"),
            IdentityRole::Server => write!(f, "server"),
            IdentityRole::Client => write!(f, "client"),
        }
    }
}

/// A key pair plus certificate. Immutable once issued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub role: IdentityRole,
    /// Subject common name
    pub subject: String,
    /// Issuer common name (equals `subject` for the CA itself)
    pub issuer: String,
    /// Subject alternative name: public address for the server,
    /// device name for clients, absent for the CA
    pub san: Option<String>,
    pub cert_pem: String,
    pub key_pem: String,
}

impl Identity {
    /// Rebuild an identity from PEM material, recovering subject, issuer
    /// and SAN from the certificate. Used when loading persisted state.
    pub fn from_pem_parts(role: IdentityRole, cert_pem: String, key_pem: String) -> Result<Self> {
        let (subject, issuer, san) = {
            let (_, der) = parse_x509_pem(cert_pem.as_bytes())
                .map_err(|e| PkiError::Certificate(e.to_string()))?;
            let (_, cert) = parse_x509_certificate(&der.contents)
                .map_err(|e| PkiError::Certificate(e.to_string()))?;
            let subject = common_name(cert.subject())?;
            let issuer = common_name(cert.issuer())?;
            let san = san_entries(&cert)?.into_iter().next();
            (subject, issuer, san)
        };
        Ok(Self {
            role,
            subject,
            issuer,
            san,
            cert_pem,
            key_pem,
        })
    }

    /// SHA-256 fingerprint of the certificate DER, hex-encoded.
    pub fn fingerprint(&self) -> Result<String> {
        use sha2::{Digest, Sha256};
        let (_, der) = parse_x509_pem(self.cert_pem.as_bytes())
            .map_err(|e| PkiError::Certificate(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(&der.contents)))
    }

    /// DER-encoded SubjectPublicKeyInfo of the certificate.
    ///
    /// Stable across restarts for an unchanged identity, so this is what
    /// idempotence checks compare.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        let (_, der) = parse_x509_pem(self.cert_pem.as_bytes())
            .map_err(|e| PkiError::Certificate(e.to_string()))?;
        let (_, cert) = parse_x509_certificate(&der.contents)
            .map_err(|e| PkiError::Certificate(e.to_string()))?;
        Ok(cert.public_key().raw.to_vec())
    }

    /// All subject-alternative-name entries (DNS names and IP addresses).
    pub fn san_names(&self) -> Result<Vec<String>> {
        let (_, der) = parse_x509_pem(self.cert_pem.as_bytes())
            .map_err(|e| PkiError::Certificate(e.to_string()))?;
        let (_, cert) = parse_x509_certificate(&der.contents)
            .map_err(|e| PkiError::Certificate(e.to_string()))?;
        san_entries(&cert)
    }

    /// Whether the certificate carries `addr` as an IP SAN.
    pub fn covers_address(&self, addr: IpAddr) -> bool {
        self.san_names()
            .map(|names| names.iter().any(|n| n == &addr.to_string()))
            .unwrap_or(false)
    }

    /// Validate this certificate's signature against the CA's public key
    /// and check the issuer name matches the CA subject.
    pub fn verify_issued_by(&self, ca: &Identity) -> Result<()> {
        if self.issuer != ca.subject {
            return Err(PkiError::Certificate(format!(
                "issuer {:?} does not match CA subject {:?}",
                self.issuer, ca.subject
            )));
        }
        let (_, der) = parse_x509_pem(self.cert_pem.as_bytes())
            .map_err(|e| PkiError::Certificate(e.to_string()))?;
        let (_, cert) = parse_x509_certificate(&der.contents)
            .map_err(|e| PkiError::Certificate(e.to_string()))?;
        let (_, ca_der) = parse_x509_pem(ca.cert_pem.as_bytes())
            .map_err(|e| PkiError::Certificate(e.to_string()))?;
        let (_, ca_cert) = parse_x509_certificate(&ca_der.contents)
            .map_err(|e| PkiError::Certificate(e.to_string()))?;
        cert.verify_signature(Some(ca_cert.public_key()))
            .map_err(|e| PkiError::Certificate(format!("signature validation failed: {e}")))
    }
}

fn common_name(name: &X509Name<'_>) -> Result<String> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| PkiError::Certificate("certificate has no common name".into()))
}

fn san_entries(cert: &X509Certificate<'_>) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let san = cert
        .subject_alternative_name()
        .map_err(|e| PkiError::Certificate(e.to_string()))?;
    if let Some(ext) = san {
        for name in &ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => out.push((*dns).to_string()),
                GeneralName::IPAddress(bytes) if bytes.len() == 4 => {
                    let octets: [u8; 4] = (*bytes).try_into().expect("length checked");
                    out.push(std::net::Ipv4Addr::from(octets).to_string());
                }
                _ => {}
            }
        }
    }
    Ok(out)
}
