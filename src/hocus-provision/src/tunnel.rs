//! Tunnel configuration emission.
//!
//! Renders the IKEv2 daemon's connection file and its secrets file from
//! the resolved identities and the device registry: one fallback profile
//! assigning from the shared pool, plus one dedicated profile per device
//! pinning its fixed address. Dedicated profiles carry an exact peer
//! identity (`rightid`), so the daemon prefers them over the fallback
//! whenever both match.

use crate::registry::DeviceRegistry;
use crate::state::ProvisioningState;
use std::fmt::Write as _;
use std::net::IpAddr;
use thiserror::Error;

/// Internal inconsistencies that must fail loudly rather than produce a
/// broken tunnel configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("device {name:?} address {addr} is outside subnet {subnet}")]
    AddressOutsideSubnet {
        name: String,
        addr: std::net::Ipv4Addr,
        subnet: ipnet::Ipv4Net,
    },

    #[error("no client identity for device {0:?}")]
    MissingClientIdentity(String),
}

/// Renders `ipsec.conf` / `ipsec.secrets` content.
#[derive(Debug, Clone)]
pub struct TunnelConfigEmitter {
    /// File name of the server certificate in the daemon's cert directory
    pub server_cert_file: String,
    /// File name of the server private key in the daemon's key directory
    pub server_key_file: String,
}

impl Default for TunnelConfigEmitter {
    fn default() -> Self {
        Self {
            server_cert_file: "server-cert".to_string(),
            server_key_file: "server-key".to_string(),
        }
    }
}

impl TunnelConfigEmitter {
    /// Render the connection file: `%default` + fallback + one dedicated
    /// conn per device holding a client identity.
    ///
    /// A registered device without an identity is an internal
    /// inconsistency, unless `allow_missing` is set: then the device is
    /// left out of the rendered config (its issuance was skipped upstream)
    /// and picks up a dedicated conn on a later run.
    pub fn render_conf(
        &self,
        state: &ProvisioningState,
        registry: &DeviceRegistry,
        public_addr: IpAddr,
        allow_missing: bool,
    ) -> Result<String, RenderError> {
        // Registry invariants are enforced at load time; re-check here so
        // an inconsistent state fails before it reaches the daemon.
        for device in registry.devices() {
            if !registry.subnet().contains(&device.addr) {
                return Err(RenderError::AddressOutsideSubnet {
                    name: device.name.clone(),
                    addr: device.addr,
                    subnet: registry.subnet(),
                });
            }
            if !state.has_client(&device.name) && !allow_missing {
                return Err(RenderError::MissingClientIdentity(device.name.clone()));
            }
        }

        let mut out = String::new();
        let _ = writeln!(out, "config setup");
        let _ = writeln!(out, "    uniqueids=never");
        let _ = writeln!(out);
        let _ = writeln!(out, "conn %default");
        let _ = writeln!(out, "    keyexchange=ikev2");
        let _ = writeln!(out, "    ike=aes256-sha256-modp3072!");
        let _ = writeln!(out, "    esp=aes256-sha256!");
        let _ = writeln!(out, "    dpdaction=clear");
        let _ = writeln!(out, "    left=%any");
        let _ = writeln!(out, "    leftid={public_addr}");
        let _ = writeln!(out, "    leftcert={}", self.server_cert_file);
        let _ = writeln!(out, "    leftsendcert=always");
        let _ = writeln!(out, "    leftsubnet=0.0.0.0/0");
        let _ = writeln!(out, "    right=%any");
        let _ = writeln!(out, "    rightauth=pubkey");
        let _ = writeln!(out, "    auto=add");

        // dedicated profiles first: exact rightid beats the fallback's
        // wildcard whenever both match
        for device in registry.devices() {
            if !state.has_client(&device.name) {
                continue;
            }
            let _ = writeln!(out);
            let _ = writeln!(out, "conn device-{}", device.name);
            let _ = writeln!(out, "    rightid=\"{}\"", device.name);
            let _ = writeln!(out, "    rightsourceip={}/32", device.addr);
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "conn fallback");
        let _ = writeln!(out, "    rightsourceip={}", registry.pool());

        Ok(out)
    }

    /// Render the secrets file: exactly one line granting the server key
    /// authority to prove the server identity. No client key material.
    pub fn render_secrets(&self) -> String {
        format!(": RSA {}\n", self.server_key_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceRecord;
    use hocus_pki::{Identity, IdentityRole};
    use std::collections::BTreeMap;

    fn fake_identity(role: IdentityRole, subject: &str) -> Identity {
        Identity {
            role,
            subject: subject.to_string(),
            issuer: "Hocuspocus VPN CA".to_string(),
            san: None,
            cert_pem: String::new(),
            key_pem: String::new(),
        }
    }

    fn fake_state(devices: &[&str]) -> ProvisioningState {
        let mut clients = BTreeMap::new();
        for device in devices {
            clients.insert(
                device.to_string(),
                fake_identity(IdentityRole::Client, device),
            );
        }
        ProvisioningState {
            ca: fake_identity(IdentityRole::Ca, "Hocuspocus VPN CA"),
            server: fake_identity(IdentityRole::Server, "Hocuspocus VPN Server"),
            clients,
        }
    }

    fn registry(devices: &[(&str, &str)]) -> DeviceRegistry {
        DeviceRegistry::new(
            "10.11.0.0/24".parse().unwrap(),
            "10.11.0.128/25".parse().unwrap(),
            devices
                .iter()
                .map(|(name, addr)| DeviceRecord {
                    name: name.to_string(),
                    addr: addr.parse().unwrap(),
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn conf_contains_fallback_and_dedicated_profiles() {
        let registry = registry(&[("iphone", "10.11.0.2"), ("macbook-air", "10.11.0.3")]);
        let state = fake_state(&["iphone", "macbook-air"]);
        let emitter = TunnelConfigEmitter::default();
        let conf = emitter
            .render_conf(&state, &registry, "203.0.113.10".parse().unwrap(), false)
            .unwrap();

        assert!(conf.contains("conn %default"));
        assert!(conf.contains("leftid=203.0.113.10"));
        assert!(conf.contains("conn device-iphone"));
        assert!(conf.contains("rightid=\"iphone\""));
        assert!(conf.contains("rightsourceip=10.11.0.2/32"));
        assert!(conf.contains("conn device-macbook-air"));
        assert!(conf.contains("conn fallback"));
        assert!(conf.contains("rightsourceip=10.11.0.128/25"));
    }

    #[test]
    fn dedicated_profiles_precede_fallback() {
        let registry = registry(&[("iphone", "10.11.0.2")]);
        let state = fake_state(&["iphone"]);
        let conf = TunnelConfigEmitter::default()
            .render_conf(&state, &registry, "203.0.113.10".parse().unwrap(), false)
            .unwrap();
        let dedicated = conf.find("conn device-iphone").unwrap();
        let fallback = conf.find("conn fallback").unwrap();
        assert!(dedicated < fallback);
    }

    #[test]
    fn missing_client_identity_fails_render() {
        let registry = registry(&[("iphone", "10.11.0.2")]);
        let state = fake_state(&[]);
        let err = TunnelConfigEmitter::default()
            .render_conf(&state, &registry, "203.0.113.10".parse().unwrap(), false)
            .unwrap_err();
        assert_eq!(err, RenderError::MissingClientIdentity("iphone".into()));
    }

    #[test]
    fn missing_client_identity_is_omitted_when_allowed() {
        let registry = registry(&[("iphone", "10.11.0.2"), ("macbook-air", "10.11.0.3")]);
        let state = fake_state(&["iphone"]);
        let conf = TunnelConfigEmitter::default()
            .render_conf(&state, &registry, "203.0.113.10".parse().unwrap(), true)
            .unwrap();
        assert!(conf.contains("conn device-iphone"));
        assert!(!conf.contains("conn device-macbook-air"));
        assert!(conf.contains("conn fallback"));
    }

    #[test]
    fn secrets_reference_server_key_only() {
        let secrets = TunnelConfigEmitter::default().render_secrets();
        assert_eq!(secrets, ": RSA server-key\n");
        assert!(!secrets.contains("client"));
    }
}
