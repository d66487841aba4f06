//! NAT-aware address selection.
//!
//! Both the hub (answering ship-list queries) and the login daemon (issuing
//! redirects) have to decide whether a client should be handed a ship's
//! external or internal address. The rule only looks at IPv4 addresses; the
//! deployment story for these clients never grew past that.

use std::net::Ipv4Addr;

/// Picks the address a client should connect to.
///
/// * `client` - source address of the querying client
/// * `external` / `internal` - the ship's two addresses
/// * `override_addr` - the hub's configured public address
/// * `local` / `netmask` - the hub's own interface address and mask
///
/// If the client and the ship share a public address they sit behind the
/// same NAT, so the internal address is returned. If the ship's external
/// address is our own public address and the client is on our LAN, the ship
/// is on that LAN too, so again the internal address. Everything else gets
/// the external address.
pub fn resolve(
    client: Ipv4Addr,
    external: Ipv4Addr,
    internal: Ipv4Addr,
    override_addr: Ipv4Addr,
    local: Ipv4Addr,
    netmask: Ipv4Addr,
) -> Ipv4Addr {
    let client_raw = u32::from(client);
    let local_raw = u32::from(local);
    let mask = u32::from(netmask);

    if client == external {
        return internal;
    }

    if external == override_addr && (client_raw & mask) == (local_raw & mask) {
        return internal;
    }

    external
}
