//! Helpers shared by the ship test suites: a ship/block pair with no
//! sockets, and clients with live cipher pairs plus the mirrored streams
//! needed to read what the server queued for them.

use crate::block::Block;
use crate::client::Client;
use crate::config::ShipConfig;
use crate::limits::{ItemLimits, PermissiveLimits};
use crate::packets;
use crate::script::NoopHook;
use crate::ship::Ship;
use keel::crypto::{Cipher, GcCipher, PcCipher};
use keel::logging::{self, Discard, Logger};
use keel::version::{CipherFamily, ClientVersion};
use moor::header::{HeaderForm, CLIENT_HEADER_SIZE};
use moor::session::{CipherPair, Session};
use std::net::Ipv4Addr;
use std::sync::Arc;

pub fn test_logger() -> Logger {
    Logger::root(Discard, logging::o!())
}

pub fn test_ship() -> Arc<Ship> {
    test_ship_with_limits(Box::new(PermissiveLimits))
}

pub fn test_ship_with_limits(limits: Box<dyn ItemLimits>) -> Arc<Ship> {
    Ship::new(
        ShipConfig::default(),
        limits,
        Box::new(NoopHook),
        &test_logger(),
    )
}

pub fn test_block(ship: &Arc<Ship>) -> Arc<Block> {
    let block = Block::new(1, ship);
    block.setup_default_lobbies(0);
    ship.blocks.lock().push(block.clone());
    block
}

/// A connected client plus the decrypt stream mirroring its session's
/// send cipher.
pub struct TestPeer {
    pub client: Arc<Client>,
    decrypt: Cipher,
}

pub fn make_client(version: ClientVersion, guildcard: u32, level: u32) -> TestPeer {
    let form = packets::header_form(version);
    let mut session = Session::new(form);

    // Seeds only need to be distinct per client and known to the test.
    let server_seed = guildcard.wrapping_mul(0x9E37_79B9).wrapping_add(17);
    let client_seed = server_seed ^ 0xAAAA_5555;

    let (pair, decrypt) = match version.cipher_family() {
        CipherFamily::Pc => (
            CipherPair {
                recv: Cipher::Pc(PcCipher::new(client_seed)),
                send: Cipher::Pc(PcCipher::new(server_seed)),
            },
            Cipher::Pc(PcCipher::new(server_seed)),
        ),
        CipherFamily::Gc => (
            CipherPair {
                recv: Cipher::Gc(GcCipher::new(client_seed)),
                send: Cipher::Gc(GcCipher::new(server_seed)),
            },
            Cipher::Gc(GcCipher::new(server_seed)),
        ),
    };

    session.install_ciphers(pair);

    let client = Client::new(session, version, Ipv4Addr::LOCALHOST);
    client.set_guildcard(guildcard);
    client.state.lock().player.level = level;
    client.state.lock().player.name = format!("P{}", guildcard);

    TestPeer { client, decrypt }
}

impl TestPeer {
    /// Everything the server queued since the last drain, deciphered and
    /// split into packets.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        let mut raw = self.client.session.lock().drain_pending();
        self.decrypt.apply(&mut raw);

        let form = packets::header_form(self.client.version);
        let mut out = Vec::new();
        let mut rest = &raw[..];

        while rest.len() >= CLIENT_HEADER_SIZE {
            let header = form.parse(&rest[..CLIENT_HEADER_SIZE]);
            let len = form.padded_len(header.len);

            out.push(rest[..len].to_vec());
            rest = &rest[len..];
        }

        out
    }

    pub fn drain_opcodes(&mut self) -> Vec<u16> {
        let form = packets::header_form(self.client.version);

        self.drain()
            .iter()
            .map(|pkt| form.parse(&pkt[..CLIENT_HEADER_SIZE]).opcode)
            .collect()
    }

    pub fn form(&self) -> HeaderForm {
        packets::header_form(self.client.version)
    }
}
