use moor::session::Session;
use std::net::Ipv4Addr;
use std::time::Instant;

/// One connected ship, from the hub's point of view. Until the login
/// completes (`key_set`), the session runs in the clear and the connection
/// counts for nothing.
pub struct ShipConn {
    pub session: Session,

    pub gate_nonce: [u8; 4],
    pub ship_nonce: [u8; 4],
    pub key_set: bool,

    pub key_idx: u16,
    pub proto_ver: u32,
    pub menu_code: u16,
    pub flags: u32,

    pub external: Ipv4Addr,
    pub internal: Ipv4Addr,
    pub port: u16,

    pub clients: u16,
    pub games: u16,

    pub name: String,

    pub last_ping: Instant,
}

impl ShipConn {
    pub fn new(session: Session, gate_nonce: [u8; 4], ship_nonce: [u8; 4]) -> ShipConn {
        ShipConn {
            session,
            gate_nonce,
            ship_nonce,
            key_set: false,
            key_idx: 0,
            proto_ver: 0,
            menu_code: 0,
            flags: 0,
            external: Ipv4Addr::UNSPECIFIED,
            internal: Ipv4Addr::UNSPECIFIED,
            port: 0,
            clients: 0,
            games: 0,
            name: String::new(),
            last_ping: Instant::now(),
        }
    }

    pub fn is_proxy(&self) -> bool {
        self.flags & moor::gate::SHIP_FLAG_PROXY != 0
    }

    pub fn is_gm_only(&self) -> bool {
        self.flags & moor::gate::SHIP_FLAG_GMONLY != 0
    }
}
