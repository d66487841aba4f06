//! Rooms: the default lobbies every block carries and the games players
//! spin up on demand.
//!
//! Locking: every room guards its mutable state with one mutex. Internal
//! `*_locked` functions take the already-held guard; public entry points
//! acquire exactly once. An operation spanning two rooms locks the lower
//! room id first. The client mutex is only ever taken while a room lock is
//! already held, never the other way around.

use crate::block::Block;
use crate::client::{Client, ClientFlags, InvItem};
use crate::limits::ItemLimits;
use crate::packets;
use crate::subcmd;
use bitflags::bitflags;
use keel::time::timestamp_secs;
use keel::version::{ClientVersion, MINI_LANGUAGE_CODES};
use moor::header::HeaderForm;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

pub const LOBBY_MAX_CLIENTS: usize = 12;
pub const GAME_MAX_CLIENTS: usize = 4;

/// Default lobbies on every block.
pub const DEFAULT_LOBBY_COUNT: u32 = 15;

/// Game ids live above the default lobby range.
const FIRST_GAME_ID: u32 = 0x12;

/// Character level required to enter a game, by difficulty.
pub const GAME_REQUIRED_LEVEL: [u32; 4] = [1, 20, 40, 80];

/// Effectively unbounded level cap.
const NO_LEVEL_CAP: u32 = 9001;

bitflags! {
    pub struct LobbyFlags: u32 {
        const BURSTING     = 0x0000_0001;
        const QUESTING     = 0x0000_0002;
        const QUESTSEL     = 0x0000_0004;
        const TEMP_UNAVAIL = 0x0000_0008;
        const LEGIT_MODE   = 0x0000_0010;
        const LEGIT_CHECK  = 0x0000_0020;
        const DCONLY       = 0x0000_0040;
        const PCONLY       = 0x0000_0080;
        const V1ONLY       = 0x0000_0100;
        const GC_ALLOWED   = 0x0000_0200;
        const SINGLEPLAYER = 0x0000_0400;
        const EP3          = 0x0000_0800;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LobbyKind {
    Default,
    Game,
    Ep3Game,
}

/// Why a room change was refused. These are reported back to the player in
/// chat, so every gate gets its own variant.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RoomError {
    Full,
    Unavailable,
    BusyBurst,
    QuestActive,
    QuestBeingSelected,
    LevelTooLow,
    LevelTooHigh,
    VersionMismatch,
    LegitFail,
    NotBursting,
    UnexpectedDuringBurst,
    Internal,
}

/// An in-room subcommand held back while a new member bursts.
pub struct QueuedPacket {
    pub src: Arc<Client>,
    pub opcode: u16,
    pub pkt: Vec<u8>,
}

pub struct LobbyState {
    pub flags: LobbyFlags,
    pub leader_id: usize,

    pub difficulty: u8,
    pub battle: bool,
    pub challenge: bool,
    pub v2: bool,
    pub episode: u8,
    pub section: u8,
    pub event: u8,

    pub max_chal: u8,
    pub legit_check_passed: usize,

    pub version: ClientVersion,
    pub min_level: u32,
    pub max_level: u32,
    pub rand_seed: u32,

    pub name: String,
    pub passwd: String,
    pub maps: [u32; 32],

    pub clients: [Option<Arc<Client>>; LOBBY_MAX_CLIENTS],
    pub num_clients: usize,

    pub pkt_queue: VecDeque<QueuedPacket>,
    pub create_time: u64,
    pub next_item: u32,
}

pub struct Lobby {
    pub id: u32,
    pub kind: LobbyKind,
    pub capacity: usize,
    pub block: Weak<Block>,
    /// Games invisible in the game list (casual handheld games) are not
    /// counted against the ship either.
    pub listed: bool,
    pub state: Mutex<LobbyState>,
}

impl fmt::Debug for Lobby {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lobby")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Everything a game creation request carries.
pub struct GameParams {
    pub name: String,
    pub passwd: String,
    pub difficulty: u8,
    pub battle: bool,
    pub challenge: bool,
    pub v2: bool,
    pub version: ClientVersion,
    pub section: u8,
    pub event: u8,
    pub episode: u8,
}

// Layout variant counts per area, one row per episode. An entry of one
// means the area has a single fixed layout.
const MAP_VARIANTS: [[u32; 32]; 2] = [
    [
        1, 1, 1, 5, 1, 5, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 1, 1, 1, 1, 1, 1, 1, 1,
        1, 1,
    ],
    [
        1, 1, 2, 1, 2, 1, 2, 1, 2, 1, 1, 3, 1, 3, 1, 3, 2, 2, 1, 3, 2, 2, 2, 2, 1, 1, 1, 1, 1, 1,
        1, 1,
    ],
];

impl Lobby {
    /// Creates one of a block's persistent default lobbies.
    pub fn new_default(block: &Arc<Block>, lobby_id: u32, event: u8) -> Arc<Lobby> {
        let state = LobbyState {
            flags: LobbyFlags::empty(),
            leader_id: 0,
            difficulty: 0,
            battle: false,
            challenge: false,
            v2: false,
            episode: 1,
            section: 0,
            event,
            max_chal: 0,
            legit_check_passed: 0,
            version: ClientVersion::DcV1,
            min_level: 0,
            max_level: NO_LEVEL_CAP,
            rand_seed: 0,
            name: format!("BLOCK{:02}-{:02}", block.b, lobby_id),
            passwd: String::new(),
            maps: [0; 32],
            clients: Default::default(),
            num_clients: 0,
            pkt_queue: VecDeque::new(),
            create_time: timestamp_secs(),
            next_item: 0,
        };

        Arc::new(Lobby {
            id: lobby_id,
            kind: LobbyKind::Default,
            capacity: LOBBY_MAX_CLIENTS,
            block: Arc::downgrade(block),
            listed: true,
            state: Mutex::new(state),
        })
    }

    /// Creates a game and hangs it off the block. Casual handheld games
    /// stay unlisted so console clients never see them in the game list.
    pub fn new_game(block: &Arc<Block>, params: GameParams) -> Arc<Lobby> {
        let id = block.next_game_id(FIRST_GAME_ID);

        // A game made on the older handheld build downgrades to the v1
        // ruleset unless the creator asked for v2.
        let version = if params.version == ClientVersion::DcV2 && !params.v2 {
            ClientVersion::DcV1
        } else {
            params.version
        };

        // The two handheld generations predate episodes.
        let episode = match version {
            ClientVersion::DcV1 | ClientVersion::DcV2 | ClientVersion::Pc => 1,
            _ => params.episode.max(1).min(2),
        };

        let mut maps = [0u32; 32];
        let variants = &MAP_VARIANTS[(episode - 1) as usize];

        for (map, &count) in maps.iter_mut().zip(variants.iter()) {
            if count != 1 {
                *map = rand::random::<u32>() % count;
            }
        }

        let mut name = params.name;
        name.truncate(32);
        let mut passwd = params.passwd;
        passwd.truncate(16);

        let listed = version != ClientVersion::Pc
            || params.battle
            || params.challenge
            || params.difficulty == 3;

        let kind = if version == ClientVersion::Ep3 {
            LobbyKind::Ep3Game
        } else {
            LobbyKind::Game
        };

        let flags = if kind == LobbyKind::Ep3Game {
            LobbyFlags::EP3
        } else {
            LobbyFlags::empty()
        };

        let state = LobbyState {
            flags,
            leader_id: 1,
            difficulty: params.difficulty,
            battle: params.battle,
            challenge: params.challenge,
            v2: params.v2,
            episode,
            section: params.section,
            event: params.event,
            max_chal: 0xFF,
            legit_check_passed: 0,
            version,
            min_level: GAME_REQUIRED_LEVEL[(params.difficulty & 3) as usize],
            max_level: NO_LEVEL_CAP,
            rand_seed: rand::random::<u32>(),
            name,
            passwd,
            maps,
            clients: Default::default(),
            num_clients: 0,
            pkt_queue: VecDeque::new(),
            create_time: timestamp_secs(),
            next_item: 0,
        };

        let lobby = Arc::new(Lobby {
            id,
            kind,
            capacity: GAME_MAX_CLIENTS,
            block: Arc::downgrade(block),
            listed,
            state: Mutex::new(state),
        });

        // Unlisted games stay off the block list (and the ship's game
        // counter); only their creator ever reaches them.
        if listed {
            block.insert_lobby(&lobby);

            if let Some(ship) = block.ship.upgrade() {
                ship.inc_games();
            }
        }

        lobby
    }

    #[inline]
    pub fn is_game(&self) -> bool {
        self.kind != LobbyKind::Default
    }

    pub fn lock(&self) -> MutexGuard<LobbyState> {
        self.state.lock()
    }
}

fn form_for(client: &Client) -> HeaderForm {
    packets::header_form(client.version)
}

/// Queues a packet to every member except `sender`, honoring each
/// recipient's blacklist and, when `igcheck` is set, their ignore list.
/// Headers are rewritten per recipient so both header layouts coexist in
/// one room.
pub fn send_pkt_locked(
    state: &LobbyState,
    sender: Option<&Arc<Client>>,
    pkt: &[u8],
    igcheck: bool,
) {
    let sender_gc = sender.map(|client| client.guildcard()).unwrap_or(0);

    for member in state.clients.iter().flatten() {
        if let Some(sender) = sender {
            if Arc::ptr_eq(member, sender) {
                continue;
            }

            let mstate = member.state.lock();

            if mstate.has_blacklisted(sender_gc) {
                continue;
            }

            if igcheck && mstate.has_ignored(sender_gc) {
                continue;
            }
        }

        let out = packets::convert_header(pkt, HeaderForm::Dc, form_for(member));
        drop(member.send(&out));
    }
}

/// Per-member legit validation. A room with no legit flags set admits
/// anyone.
pub fn check_client_legit(state: &LobbyState, limits: &dyn ItemLimits, client: &Arc<Client>) -> bool {
    if !state
        .flags
        .intersects(LobbyFlags::LEGIT_MODE | LobbyFlags::LEGIT_CHECK)
    {
        return true;
    }

    let item_version = client.version.item_version();
    let cstate = client.state.lock();

    cstate
        .player
        .inventory
        .iter()
        .all(|item: &InvItem| limits.check_item(item, item_version))
}

fn find_max_challenge_locked(state: &LobbyState) -> u8 {
    if !state.challenge {
        return 0;
    }

    let mut min_progress = 255u8;

    for member in state.clients.iter().flatten() {
        let progress = member.state.lock().challenge_progress();

        if progress < min_progress {
            min_progress = progress;
        }
    }

    min_progress.wrapping_add(1)
}

fn add_client_locked(
    lobby: &Arc<Lobby>,
    state: &mut LobbyState,
    client: &Arc<Client>,
) -> Result<usize, RoomError> {
    if state.num_clients >= lobby.capacity {
        return Err(RoomError::Full);
    }

    let clev = if state.challenge {
        client.state.lock().challenge_progress() + 1
    } else {
        state.max_chal
    };

    // Slot zero is handed out last: the UI colors it green and the leader
    // must stay visible when the room is nearly empty.
    let slot = (1..lobby.capacity)
        .find(|&i| state.clients[i].is_none())
        .or_else(|| {
            if state.clients[0].is_none() {
                Some(0)
            } else {
                None
            }
        })
        .ok_or(RoomError::Full)?;

    state.clients[slot] = Some(client.clone());
    state.num_clients += 1;

    // A room must never point its leader at an empty slot.
    if state.clients[state.leader_id].is_none() {
        state.leader_id = slot;
    }

    if state.challenge && state.max_chal > clev {
        state.max_chal = clev;
    }

    let mut cstate = client.state.lock();
    cstate.client_id = slot;
    cstate.arrow = 0;
    cstate.join_time = timestamp_secs();
    cstate.cur_lobby = Some(lobby.clone());

    Ok(slot)
}

fn elect_leader_locked(state: &LobbyState) -> Option<usize> {
    let mut earliest = u64::max_value();
    let mut winner = None;

    for (slot, member) in state.clients.iter().enumerate() {
        if slot == state.leader_id {
            continue;
        }

        if let Some(member) = member {
            let join_time = member.state.lock().join_time;

            if join_time < earliest {
                earliest = join_time;
                winner = Some(slot);
            }
        }
    }

    winner
}

/// Removes a member. Returns true when the room should be destroyed (an
/// emptied game).
fn remove_client_locked(
    lobby: &Arc<Lobby>,
    state: &mut LobbyState,
    client: &Arc<Client>,
    client_id: usize,
) -> Result<bool, RoomError> {
    let occupant = state.clients[client_id].as_ref();

    if !occupant.map(|c| Arc::ptr_eq(c, client)).unwrap_or(false) {
        return Err(RoomError::Internal);
    }

    if client_id == state.leader_id {
        match elect_leader_locked(state) {
            Some(new_leader) => state.leader_id = new_leader,
            None => state.leader_id = 0,
        }
    }

    state.clients[client_id] = None;
    state.num_clients -= 1;

    if state.challenge {
        state.max_chal = find_max_challenge_locked(state);
    }

    let mut cstate = client.state.lock();

    if cstate
        .cur_lobby
        .as_ref()
        .map(|l| Arc::ptr_eq(l, lobby))
        .unwrap_or(false)
    {
        cstate.cur_lobby = None;
        cstate.client_id = 0;
    }

    Ok(lobby.is_game() && state.num_clients == 0)
}

/// Tears a room down after its last member left: frees the queued burst
/// traffic and unhooks it from the block and the ship's game counter.
pub fn destroy(lobby: &Arc<Lobby>) {
    {
        let mut state = lobby.lock();
        state.pkt_queue.clear();
    }

    if let Some(block) = lobby.block.upgrade() {
        if lobby.listed {
            block.remove_lobby(lobby.id);

            if lobby.is_game() {
                if let Some(ship) = block.ship.upgrade() {
                    ship.dec_games();
                }
            }
        }
    }
}

/// Adds the client to the first default lobby on its block with space. The
/// oldest handheld build only renders the first ten.
pub fn add_to_any(client: &Arc<Client>, block: &Arc<Block>) -> Result<Arc<Lobby>, RoomError> {
    let lobbies: Vec<Arc<Lobby>> = block.lobbies.lock().clone();

    for lobby in lobbies {
        if client.version == ClientVersion::DcV1 && lobby.id > 10 {
            continue;
        }

        if lobby.kind != LobbyKind::Default {
            continue;
        }

        let mut state = lobby.lock();

        if state.num_clients < lobby.capacity
            && add_client_locked(&lobby, &mut state, client).is_ok()
        {
            let slot = client.state.lock().client_id;
            let leader = state.leader_id;

            drop(client.send(&packets::assemble_lobby_join(
                form_for(client),
                lobby.id,
                slot as u8,
                leader as u8,
            )));

            announce_player_locked(&state, &lobby, client);

            return Ok(lobby.clone());
        }
    }

    Err(RoomError::Full)
}

fn announce_player_locked(state: &LobbyState, lobby: &Arc<Lobby>, client: &Arc<Client>) {
    let (slot, level, name) = {
        let cstate = client.state.lock();
        (
            cstate.client_id,
            cstate.player.level,
            cstate.player.name.clone(),
        )
    };

    let pkt = packets::assemble_lobby_add_player(
        HeaderForm::Dc,
        lobby.id,
        slot as u8,
        client.guildcard(),
        level,
        &name,
    );

    send_pkt_locked(state, Some(client), &pkt, false);
}

fn join_packet_locked(state: &LobbyState, lobby: &Arc<Lobby>, client: &Arc<Client>, slot: usize) -> Vec<u8> {
    if lobby.is_game() {
        packets::GameJoin {
            lobby_id: lobby.id,
            client_id: slot as u8,
            leader_id: state.leader_id as u8,
            difficulty: state.difficulty,
            battle: state.battle,
            challenge: state.challenge,
            episode: state.episode,
            section: state.section,
            event: state.event,
            rand_seed: state.rand_seed,
            maps: state.maps,
        }
        .assemble(form_for(client))
    } else {
        packets::assemble_lobby_join(
            form_for(client),
            lobby.id,
            slot as u8,
            state.leader_id as u8,
        )
    }
}

/// The admission gates, in the order clients learn about them.
fn admission_locked(
    target: &Arc<Lobby>,
    state: &LobbyState,
    limits: &dyn ItemLimits,
    client: &Arc<Client>,
) -> Result<(), RoomError> {
    if state.flags.contains(LobbyFlags::TEMP_UNAVAIL) {
        return Err(RoomError::Unavailable);
    }

    if state.flags.contains(LobbyFlags::BURSTING) {
        return Err(RoomError::BusyBurst);
    }

    if state.flags.contains(LobbyFlags::QUESTING) {
        return Err(RoomError::QuestActive);
    }

    if state.flags.contains(LobbyFlags::QUESTSEL) {
        return Err(RoomError::QuestBeingSelected);
    }

    let level = client.state.lock().player.level;

    if state.min_level > level + 1 {
        return Err(RoomError::LevelTooLow);
    }

    if state.max_level < level + 1 {
        return Err(RoomError::LevelTooHigh);
    }

    if client.version == ClientVersion::DcV1 && state.v2 {
        return Err(RoomError::VersionMismatch);
    }

    if target.is_game()
        && state.flags.contains(LobbyFlags::LEGIT_MODE)
        && !check_client_legit(state, limits, client)
    {
        return Err(RoomError::LegitFail);
    }

    Ok(())
}

/// Moves a client into the requested room, running every admission gate.
/// A client in no room at all is put into any default lobby instead.
pub fn change_lobby(
    client: &Arc<Client>,
    target: &Arc<Lobby>,
    limits: &dyn ItemLimits,
) -> Result<(), RoomError> {
    let current = match client.current_lobby() {
        Some(current) => current,
        None => {
            let block = target.block.upgrade().ok_or(RoomError::Internal)?;
            add_to_any(client, &block)?;
            return Ok(());
        }
    };

    let old_cid = client.state.lock().client_id;

    if Arc::ptr_eq(&current, target) {
        // Re-entering the same room: gates still apply, membership stays.
        let state = target.lock();
        admission_locked(target, &state, limits, client)?;

        let pkt = join_packet_locked(&state, target, client, old_cid);
        drop(client.send(&pkt));

        return Ok(());
    }

    // Both rooms lock in ascending id order.
    let (mut cur_state, mut tgt_state);

    if current.id < target.id {
        cur_state = current.lock();
        tgt_state = target.lock();
    } else {
        tgt_state = target.lock();
        cur_state = current.lock();
    }

    admission_locked(target, &tgt_state, limits, client)?;

    let slot = add_client_locked(target, &mut tgt_state, client)?;

    let destroy_old = remove_client_locked(&current, &mut cur_state, client, old_cid)?;

    // Tell the old room, then the mover, then the new room.
    let leave = packets::assemble_lobby_leave(
        HeaderForm::Dc,
        old_cid as u8,
        cur_state.leader_id as u8,
    );
    send_pkt_locked(&cur_state, None, &leave, false);

    let join = join_packet_locked(&tgt_state, target, client, slot);
    drop(client.send(&join));

    if target.is_game() {
        tgt_state.flags.insert(LobbyFlags::BURSTING);
        client.set_flag(ClientFlags::BURSTING);
    }

    announce_player_locked(&tgt_state, target, client);

    drop(cur_state);
    drop(tgt_state);

    if destroy_old {
        destroy(&current);
    }

    Ok(())
}

/// Removes a player who is leaving outright (disconnect, block change).
pub fn remove_player(client: &Arc<Client>) -> Result<(), RoomError> {
    let lobby = match client.current_lobby() {
        Some(lobby) => lobby,
        None => return Ok(()),
    };

    let destroy_lobby = {
        let mut state = lobby.lock();
        let client_id = client.state.lock().client_id;

        let destroy_lobby = remove_client_locked(&lobby, &mut state, client, client_id)?;

        let leave = packets::assemble_lobby_leave(
            HeaderForm::Dc,
            client_id as u8,
            state.leader_id as u8,
        );
        send_pkt_locked(&state, None, &leave, false);

        destroy_lobby
    };

    if destroy_lobby {
        destroy(&lobby);
    }

    Ok(())
}

/// Copies one in-room subcommand into the burst queue. Refused when the
/// room is not actually bursting, and only the three subcommand opcodes
/// ever queue.
pub fn enqueue_pkt_locked(
    state: &mut LobbyState,
    client: &Arc<Client>,
    opcode: u16,
    pkt: &[u8],
) -> Result<(), RoomError> {
    if !state.flags.contains(LobbyFlags::BURSTING) {
        return Err(RoomError::NotBursting);
    }

    if opcode != packets::TYPE_GAME_COMMAND0
        && opcode != packets::TYPE_GAME_COMMAND2
        && opcode != packets::TYPE_GAME_COMMANDD
    {
        return Err(RoomError::UnexpectedDuringBurst);
    }

    state.pkt_queue.push_back(QueuedPacket {
        src: client.clone(),
        opcode,
        pkt: pkt.to_vec(),
    });

    Ok(())
}

/// Ends a burst: clears the flag and replays the held-back subcommands in
/// arrival order through the normal dispatch. A dispatch failure aborts
/// the replay; the remaining entries are still dropped.
pub fn finish_burst(lobby: &Arc<Lobby>, client: &Arc<Client>) -> Result<(), RoomError> {
    let queue = {
        let mut state = lobby.lock();

        if !state.flags.contains(LobbyFlags::BURSTING) {
            return Err(RoomError::NotBursting);
        }

        state.flags.remove(LobbyFlags::BURSTING);
        std::mem::replace(&mut state.pkt_queue, VecDeque::new())
    };

    client.clear_flag(ClientFlags::BURSTING);

    let mut failed = false;

    for entry in queue {
        if failed {
            continue;
        }

        let result = match entry.opcode {
            packets::TYPE_GAME_COMMAND0 => subcmd::handle_bcast(&entry.src, lobby, &entry.pkt),
            packets::TYPE_GAME_COMMAND2 | packets::TYPE_GAME_COMMANDD => {
                subcmd::handle_one(&entry.src, lobby, &entry.pkt)
            }
            _ => Err(RoomError::UnexpectedDuringBurst),
        };

        if result.is_err() {
            failed = true;
        }
    }

    if failed {
        Err(RoomError::Internal)
    } else {
        Ok(())
    }
}

/// Runs a leader-initiated legit check over every member. On a full pass
/// the room enters legit mode and everyone hears about it; otherwise the
/// leader gets the bad news. Either way the check flags clear.
pub fn run_legit_check(lobby: &Arc<Lobby>, limits: &dyn ItemLimits) {
    let mut state = lobby.lock();

    state
        .flags
        .insert(LobbyFlags::LEGIT_CHECK | LobbyFlags::TEMP_UNAVAIL);
    state.legit_check_passed = 0;

    let members: Vec<Arc<Client>> = state.clients.iter().flatten().cloned().collect();

    for member in &members {
        if check_client_legit(&state, limits, member) {
            state.legit_check_passed += 1;
        }
    }

    finish_legit_check_locked(&mut state);
}

fn finish_legit_check_locked(state: &mut LobbyState) {
    if state.legit_check_passed == state.num_clients {
        state.flags.insert(LobbyFlags::LEGIT_MODE);

        for member in state.clients.iter().flatten() {
            drop(member.send(&packets::assemble_text(
                form_for(member),
                "\tE\tC7Legit mode active.",
            )));
        }
    } else if let Some(leader) = state.clients[state.leader_id].as_ref() {
        drop(leader.send(&packets::assemble_text(
            form_for(leader),
            "\tE\tC7Team legit check failed!",
        )));
    }

    state
        .flags
        .remove(LobbyFlags::LEGIT_CHECK | LobbyFlags::TEMP_UNAVAIL);
}

/// Builds the info-window text describing a room's members.
pub fn info_text(state: &LobbyState) -> String {
    let mut msg = String::new();

    if !state.passwd.is_empty() {
        msg.push_str("[Locked]\n");
    }

    for member in state.clients.iter().flatten() {
        let cstate = member.state.lock();

        msg.push_str(&format!(
            "{} L{}\n  {}    {}\n",
            cstate.player.name,
            cstate.player.level + 1,
            crate::client::CLASSES[(cstate.player.ch_class as usize) % crate::client::CLASSES.len()],
            MINI_LANGUAGE_CODES[(cstate.language as usize) % MINI_LANGUAGE_CODES.len()],
        ));
    }

    msg
}
