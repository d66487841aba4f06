//! Optional scripting hook. Installs get typed connection events against
//! an opaque client handle; the default hook does nothing.

use crate::client::{Client, ClientState};
use keel::version::ClientVersion;
use keel::Guildcard;
use parking_lot::MutexGuard;
use std::net::Ipv4Addr;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ScriptEvent {
    ClientShipLogin,
    ClientBlockLogin,
    ClientShipLogout,
    ClientBlockLogout,
}

/// The surface a hook may poke at. Deliberately narrow; hooks never see
/// the client structure itself.
pub struct ScriptClient<'a> {
    client: &'a Arc<Client>,
    on_block: bool,
}

impl<'a> ScriptClient<'a> {
    pub fn new(client: &'a Arc<Client>, on_block: bool) -> ScriptClient<'a> {
        ScriptClient { client, on_block }
    }

    pub fn guildcard(&self) -> Guildcard {
        self.client.guildcard()
    }

    pub fn version(&self) -> ClientVersion {
        self.client.version
    }

    pub fn privilege(&self) -> u32 {
        self.client.privilege().bits()
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.client.addr
    }

    pub fn client_id(&self) -> usize {
        self.client.state.lock().client_id
    }

    pub fn is_on_block(&self) -> bool {
        self.on_block
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    pub fn send(&self, pkt: &[u8]) {
        drop(self.client.send(pkt));
    }

    /// Read access to the mutable client state, for richer hooks.
    pub fn state(&self) -> MutexGuard<ClientState> {
        self.client.state.lock()
    }
}

pub trait ScriptHook: Send + Sync {
    fn on_event(&self, _event: ScriptEvent, _client: &ScriptClient) {}
}

/// Hook used when no script is configured.
pub struct NoopHook;

impl ScriptHook for NoopHook {}
