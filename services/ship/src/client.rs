use bitflags::bitflags;
use encoding_rs::{SHIFT_JIS, WINDOWS_1252};
use keel::privilege::Privilege;
use keel::version::ClientVersion;
use keel::Guildcard;
use moor::error::NetResult;
use moor::session::Session;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::lobby::Lobby;

pub const BLACKLIST_SIZE: usize = 30;
pub const IGNORE_LIST_SIZE: usize = 10;

/// Display names of the character classes.
pub const CLASSES: [&str; 12] = [
    "HUmar", "HUnewearl", "HUcast", "RAmar", "RAcast", "RAcaseal", "FOmarl", "FOnewm",
    "FOnewearl", "HUcaseal", "FOmar", "RAmarl",
];

bitflags! {
    pub struct ClientFlags: u32 {
        /// Mid-burst: this client is replaying game state into its room.
        const BURSTING        = 0x0000_0001;
        /// Connected to the ship menu rather than a block.
        const TYPE_SHIP       = 0x0000_0002;
        const SENT_MOTD       = 0x0000_0004;
        const LOGGED_IN       = 0x0000_0008;
        /// Console client that asked to see handheld-family games.
        const SHOW_DCPC_ON_GC = 0x0000_0010;
    }
}

/// The character record a block session carries. Ship-menu sessions have
/// none.
#[derive(Clone)]
pub struct Player {
    pub name: String,
    /// Raw level; the displayed level is this plus one.
    pub level: u32,
    pub ch_class: u8,
    /// Challenge stage completion times; zero means not yet cleared.
    pub c_rank_times: [u32; 9],
    pub inventory: Vec<InvItem>,
}

impl Default for Player {
    fn default() -> Player {
        Player {
            name: String::new(),
            level: 0,
            ch_class: 0,
            c_rank_times: [0; 9],
            inventory: Vec::new(),
        }
    }
}

/// One inventory item, as the wire carries it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InvItem {
    pub data: [u32; 4],
}

/// Mutable per-client state, guarded by the client mutex. Room code locks
/// this only while already holding the room lock, never the other way
/// around.
pub struct ClientState {
    pub client_id: usize,
    pub arrow: u32,
    pub language: u8,
    pub join_time: u64,
    pub item_count: u32,
    pub autoreply: Option<Vec<u8>>,
    pub blacklist: [Guildcard; BLACKLIST_SIZE],
    pub ignore_list: [Guildcard; IGNORE_LIST_SIZE],
    pub player: Player,
    pub cur_lobby: Option<Arc<Lobby>>,
}

impl ClientState {
    fn new() -> ClientState {
        ClientState {
            client_id: 0,
            arrow: 0,
            language: 1,
            join_time: 0,
            item_count: 0,
            autoreply: None,
            blacklist: [0; BLACKLIST_SIZE],
            ignore_list: [0; IGNORE_LIST_SIZE],
            player: Player::default(),
            cur_lobby: None,
        }
    }

    pub fn has_blacklisted(&self, guildcard: Guildcard) -> bool {
        guildcard != 0 && self.blacklist.contains(&guildcard)
    }

    pub fn has_ignored(&self, guildcard: Guildcard) -> bool {
        guildcard != 0 && self.ignore_list.contains(&guildcard)
    }

    /// Index of the first challenge stage this character has not cleared.
    pub fn challenge_progress(&self) -> u8 {
        self.player
            .c_rank_times
            .iter()
            .position(|&time| time == 0)
            .unwrap_or(self.player.c_rank_times.len()) as u8
    }
}

/// One connected session on this ship. The connection loop that accepted
/// it owns its lifetime; rooms hold non-owning references through the slot
/// table and must never outlive-free it (the `Arc` makes that structural).
pub struct Client {
    pub version: ClientVersion,
    pub addr: Ipv4Addr,
    pub session: Mutex<Session>,
    pub state: Mutex<ClientState>,

    flags: AtomicU32,
    guildcard: AtomicU32,
    privilege: AtomicU32,
}

impl Client {
    pub fn new(session: Session, version: ClientVersion, addr: Ipv4Addr) -> Arc<Client> {
        Arc::new(Client {
            version,
            addr,
            session: Mutex::new(session),
            state: Mutex::new(ClientState::new()),
            flags: AtomicU32::new(0),
            guildcard: AtomicU32::new(0),
            privilege: AtomicU32::new(0),
        })
    }

    #[inline]
    pub fn has_flag(&self, flag: ClientFlags) -> bool {
        self.flags.load(Ordering::Relaxed) & flag.bits() != 0
    }

    #[inline]
    pub fn set_flag(&self, flag: ClientFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn clear_flag(&self, flag: ClientFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn guildcard(&self) -> Guildcard {
        self.guildcard.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_guildcard(&self, guildcard: Guildcard) {
        self.guildcard.store(guildcard, Ordering::Relaxed);
    }

    #[inline]
    pub fn privilege(&self) -> Privilege {
        Privilege::from_bits_truncate(self.privilege.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_privilege(&self, privilege: u32) {
        self.privilege.store(privilege, Ordering::Relaxed);
    }

    // Admin predicates: a privilege bit only counts on a logged-in session.

    #[inline]
    pub fn local_gm(&self) -> bool {
        self.privilege().local_gm(self.has_flag(ClientFlags::LOGGED_IN))
    }

    #[inline]
    pub fn global_gm(&self) -> bool {
        self.privilege().global_gm(self.has_flag(ClientFlags::LOGGED_IN))
    }

    #[inline]
    pub fn local_root(&self) -> bool {
        self.privilege().local_root(self.has_flag(ClientFlags::LOGGED_IN))
    }

    #[inline]
    pub fn global_root(&self) -> bool {
        self.privilege().global_root(self.has_flag(ClientFlags::LOGGED_IN))
    }

    /// Queues one packet for this client. Failures leave the session
    /// marked and are harvested by its connection loop.
    pub fn send(&self, pkt: &[u8]) -> NetResult<()> {
        self.session.lock().queue_packet(pkt)
    }

    pub fn disconnect(&self) {
        self.session.lock().mark_disconnected();
    }

    pub fn is_disconnected(&self) -> bool {
        self.session.lock().is_disconnected()
    }

    /// The client's current room, if any.
    pub fn current_lobby(&self) -> Option<Arc<Lobby>> {
        self.state.lock().cur_lobby.clone()
    }

    /// Installs a simple-mail autoreply. Handheld clients deliver the text
    /// as UTF-16LE and expect it stored in the legacy encoding their peers
    /// read: Shift-JIS when the message is tagged Japanese, Latin-1
    /// otherwise.
    pub fn set_autoreply(&self, raw: &[u8]) {
        let text = if self.version.uses_pc_header() {
            let units: Vec<u16> = raw
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .take_while(|&unit| unit != 0)
                .collect();

            let decoded = String::from_utf16_lossy(&units);

            let encoding = if decoded.starts_with("\tJ") {
                SHIFT_JIS
            } else {
                WINDOWS_1252
            };

            encoding.encode(&decoded).0.into_owned()
        } else {
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            raw[..end].to_vec()
        };

        self.state.lock().autoreply = Some(text);
    }

    pub fn clear_autoreply(&self) {
        self.state.lock().autoreply = None;
    }
}
