//! Device registry: logical device name → fixed internal tunnel address.
//!
//! Entries are defined at deploy time and immutable during a run; new
//! entries between runs are what reconciliation absorbs. Uniqueness and
//! subnet membership are load-time invariants, not runtime accidents.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use thiserror::Error;

/// One device: a human-assigned name and its permanently-bound address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    pub addr: Ipv4Addr,
}

/// Registry construction errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("device name {0:?} is not a valid identifier (lowercase letters, digits, '-')")]
    InvalidName(String),

    #[error("duplicate device name {0:?}")]
    DuplicateName(String),

    #[error("duplicate device address {0}")]
    DuplicateAddress(Ipv4Addr),

    #[error("device {name:?} address {addr} is outside subnet {subnet}")]
    AddressOutsideSubnet {
        name: String,
        addr: Ipv4Addr,
        subnet: Ipv4Net,
    },

    #[error("device {name:?} address {addr} collides with the shared pool {pool}")]
    AddressInsidePool {
        name: String,
        addr: Ipv4Addr,
        pool: Ipv4Net,
    },

    #[error("shared pool {pool} is not contained in subnet {subnet}")]
    PoolOutsideSubnet { pool: Ipv4Net, subnet: Ipv4Net },
}

/// Ordered mapping of device name to fixed address, plus the tunnel subnet
/// and the shared pool the fallback profile assigns from.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    subnet: Ipv4Net,
    pool: Ipv4Net,
    devices: Vec<DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new(
        subnet: Ipv4Net,
        pool: Ipv4Net,
        devices: Vec<DeviceRecord>,
    ) -> Result<Self, RegistryError> {
        if !(subnet.contains(&pool.network()) && subnet.contains(&pool.broadcast())) {
            return Err(RegistryError::PoolOutsideSubnet { pool, subnet });
        }
        for (i, device) in devices.iter().enumerate() {
            if !valid_name(&device.name) {
                return Err(RegistryError::InvalidName(device.name.clone()));
            }
            if !subnet.contains(&device.addr) {
                return Err(RegistryError::AddressOutsideSubnet {
                    name: device.name.clone(),
                    addr: device.addr,
                    subnet,
                });
            }
            if pool.contains(&device.addr) {
                return Err(RegistryError::AddressInsidePool {
                    name: device.name.clone(),
                    addr: device.addr,
                    pool,
                });
            }
            for earlier in &devices[..i] {
                if earlier.name == device.name {
                    return Err(RegistryError::DuplicateName(device.name.clone()));
                }
                if earlier.addr == device.addr {
                    return Err(RegistryError::DuplicateAddress(device.addr));
                }
            }
        }
        Ok(Self {
            subnet,
            pool,
            devices,
        })
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    pub fn pool(&self) -> Ipv4Net {
        self.pool
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    pub fn get(&self, name: &str) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Device names become certificate SANs and tunnel peer identifiers, so
/// they are restricted to DNS-label characters.
fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet() -> Ipv4Net {
        "10.11.0.0/24".parse().unwrap()
    }

    fn pool() -> Ipv4Net {
        "10.11.0.128/25".parse().unwrap()
    }

    fn device(name: &str, addr: &str) -> DeviceRecord {
        DeviceRecord {
            name: name.to_string(),
            addr: addr.parse().unwrap(),
        }
    }

    #[test]
    fn accepts_valid_registry() {
        let registry = DeviceRegistry::new(
            subnet(),
            pool(),
            vec![device("iphone", "10.11.0.2"), device("macbook-air", "10.11.0.3")],
        )
        .unwrap();
        assert_eq!(registry.devices().len(), 2);
        assert_eq!(registry.get("iphone").unwrap().addr, "10.11.0.2".parse::<Ipv4Addr>().unwrap());
        assert!(registry.get("ipad").is_none());
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = DeviceRegistry::new(
            subnet(),
            pool(),
            vec![device("iphone", "10.11.0.2"), device("iphone", "10.11.0.3")],
        )
        .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateName("iphone".into()));
    }

    #[test]
    fn rejects_duplicate_addresses() {
        let err = DeviceRegistry::new(
            subnet(),
            pool(),
            vec![device("iphone", "10.11.0.2"), device("ipad", "10.11.0.2")],
        )
        .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateAddress("10.11.0.2".parse().unwrap())
        );
    }

    #[test]
    fn rejects_address_outside_subnet() {
        let err = DeviceRegistry::new(subnet(), pool(), vec![device("iphone", "10.12.0.2")])
            .unwrap_err();
        assert!(matches!(err, RegistryError::AddressOutsideSubnet { .. }));
    }

    #[test]
    fn rejects_address_inside_pool() {
        let err = DeviceRegistry::new(subnet(), pool(), vec![device("iphone", "10.11.0.200")])
            .unwrap_err();
        assert!(matches!(err, RegistryError::AddressInsidePool { .. }));
    }

    #[test]
    fn rejects_pool_outside_subnet() {
        let err = DeviceRegistry::new(
            subnet(),
            "10.12.0.0/25".parse().unwrap(),
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::PoolOutsideSubnet { .. }));
    }

    #[test]
    fn rejects_invalid_device_names() {
        for bad in ["", "UPPER", "space name", "-lead", "trail-"] {
            let err = DeviceRegistry::new(subnet(), pool(), vec![device(bad, "10.11.0.2")])
                .unwrap_err();
            assert!(matches!(err, RegistryError::InvalidName(_)), "{bad:?}");
        }
    }
}
