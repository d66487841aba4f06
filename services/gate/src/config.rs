use serde_derive::{Deserialize, Serialize};
use serdeconv;
use std::net::Ipv4Addr;
use std::path::Path;

pub const DEFAULT_PORT: u16 = 11000;

/// Hub daemon configuration, loaded from TOML.
#[derive(Serialize, Deserialize)]
pub struct GateConfig {
    pub port: u16,
    /// Our public address as ships on the outside see it.
    pub override_addr: Ipv4Addr,
    /// The interface address and netmask of the LAN the hub sits on.
    pub local_addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Seed file for the in-memory backing store.
    pub seed_file: Option<String>,
}

impl Default for GateConfig {
    fn default() -> GateConfig {
        GateConfig {
            port: DEFAULT_PORT,
            override_addr: Ipv4Addr::new(127, 0, 0, 1),
            local_addr: Ipv4Addr::new(127, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            seed_file: None,
        }
    }
}

impl GateConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> GateConfig {
        serdeconv::from_toml_file(path).expect("Error loading hub configuration file")
    }
}
