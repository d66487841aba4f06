use serde_derive::{Deserialize, Serialize};
use serdeconv;
use std::net::Ipv4Addr;
use std::path::Path;

/// Ports for a block are laid out above the ship's base port, one stride
/// per block, one offset per client variant.
pub const BLOCK_PORT_STRIDE: u16 = 4;

/// Ship daemon configuration.
#[derive(Serialize, Deserialize, Clone)]
pub struct ShipConfig {
    pub name: String,
    /// Key index identifying our pre-shared hub key.
    pub key_idx: u16,
    /// Two ASCII letters grouping ships in the ship-select UI, or empty
    /// for the main menu.
    pub menu_code: String,
    pub base_port: u16,
    pub blocks: u32,
    pub external_addr: Ipv4Addr,
    pub internal_addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Address and port of the hub.
    pub gate_addr: String,
    /// Base64 of the 128-byte pre-shared hub key, as the key generator
    /// prints it.
    pub gate_key: String,
    pub gm_only: bool,
    pub proxy: bool,
    /// Default event decorating the lobbies.
    pub event: u8,
}

impl Default for ShipConfig {
    fn default() -> ShipConfig {
        ShipConfig {
            name: "Unnamed".to_string(),
            key_idx: 0,
            menu_code: String::new(),
            base_port: 12000,
            blocks: 2,
            external_addr: Ipv4Addr::new(127, 0, 0, 1),
            internal_addr: Ipv4Addr::new(127, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gate_addr: "127.0.0.1:11000".to_string(),
            gate_key: String::new(),
            gm_only: false,
            proxy: false,
            event: 0,
        }
    }
}

impl ShipConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ShipConfig {
        serdeconv::from_toml_file(path).expect("Error loading ship configuration file")
    }

    /// The menu code packed the way the hub wire wants it.
    pub fn menu_code_packed(&self) -> u16 {
        let mut bytes = self.menu_code.bytes();

        match (bytes.next(), bytes.next()) {
            (Some(low), Some(high)) => u16::from_le_bytes([low, high]),
            _ => 0,
        }
    }

    pub fn gate_flags(&self) -> u32 {
        let mut flags = 0;

        if self.gm_only {
            flags |= moor::gate::SHIP_FLAG_GMONLY;
        }

        if self.proxy {
            flags |= moor::gate::SHIP_FLAG_PROXY;
        }

        flags
    }

    /// Listener port for one variant on one block.
    pub fn block_port(&self, block: u32, offset: u16) -> u16 {
        self.base_port + BLOCK_PORT_STRIDE * block as u16 + offset
    }

    /// Decodes the pre-shared hub key. A missing or short key pads with
    /// zeros; the hub will simply refuse the login.
    pub fn gate_key_bytes(&self) -> [u8; 128] {
        let mut key = [0u8; 128];

        if let Ok(decoded) = base64::decode(&self.gate_key) {
            let count = decoded.len().min(128);
            key[..count].copy_from_slice(&decoded[..count]);
        }

        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_menu_code_packing() {
        let mut config = ShipConfig::default();
        assert_eq!(config.menu_code_packed(), 0);

        config.menu_code = "EU".to_string();
        assert_eq!(
            config.menu_code_packed(),
            u16::from_le_bytes([b'E', b'U'])
        );
    }

    #[test]
    fn test_block_port_layout() {
        let config = ShipConfig::default();

        // Block 0 is the ship menu itself; blocks start at 1.
        assert_eq!(config.block_port(0, 0), 12000);
        assert_eq!(config.block_port(1, 0), 12004);
        assert_eq!(config.block_port(1, 2), 12006);
        assert_eq!(config.block_port(2, 1), 12009);
    }
}
