use serde_derive::{Deserialize, Serialize};
use serdeconv;
use std::net::Ipv4Addr;
use std::path::Path;

/// Login daemon configuration. The listen ports are fixed by the client
/// builds; only the address-selection inputs and the backing seed vary per
/// install.
#[derive(Serialize, Deserialize)]
pub struct LoginConfig {
    /// Our public address, for the NAT-aware redirect rule.
    pub override_addr: Ipv4Addr,
    /// Interface address and netmask of the LAN this server sits on.
    pub local_addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Seed file for the in-memory backing store.
    pub seed_file: Option<String>,
}

impl Default for LoginConfig {
    fn default() -> LoginConfig {
        LoginConfig {
            override_addr: Ipv4Addr::new(127, 0, 0, 1),
            local_addr: Ipv4Addr::new(127, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            seed_file: None,
        }
    }
}

impl LoginConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> LoginConfig {
        serdeconv::from_toml_file(path).expect("Error loading login configuration file")
    }
}
