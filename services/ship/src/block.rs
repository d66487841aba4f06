//! Blocks: sharded partitions of a ship. Each block owns a set of rooms
//! and runs a dedicated thread with its own readiness loop; cross-block
//! traffic goes through the hub, never shared memory.

use crate::client::{Client, ClientFlags};
use crate::gate::GateCommand;
use crate::lobby::{self, Lobby, LobbyKind, RoomError};
use crate::packets;
use crate::ship::Ship;
use crate::script::{ScriptClient, ScriptEvent};
use keel::crypto::{Cipher, GcCipher, PcCipher};
use keel::logging::{self, Logger};
use keel::version::{CipherFamily, ClientVersion};
use keel::Guildcard;
use moor::endpoint::{Endpoint, Readiness};
use moor::error::{ErrorUtils, NetError, NetResult};
use moor::header::{HeaderForm, CLIENT_HEADER_SIZE};
use moor::session::{CipherPair, Session};
use parking_lot::Mutex;
use rand::RngCore;
use rand_mt::Mt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

// Short enough that packets queued cross-thread (hub deliveries) leave
// promptly even on an otherwise idle block.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Listener layout per block: one port per variant family.
const BLOCK_VARIANTS: [ClientVersion; 4] = [
    ClientVersion::DcV1,
    ClientVersion::Pc,
    ClientVersion::GcUs,
    ClientVersion::Ep3,
];

/// Shared block state: the room list and the client registry. The block's
/// own thread does almost all the mutation; the hub link only reads.
pub struct Block {
    pub b: u32,
    pub ship: Weak<Ship>,
    pub lobbies: Mutex<Vec<Arc<Lobby>>>,
    pub clients: Mutex<Vec<Arc<Client>>>,
}

impl Block {
    pub fn new(b: u32, ship: &Arc<Ship>) -> Arc<Block> {
        Arc::new(Block {
            b,
            ship: Arc::downgrade(ship),
            lobbies: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
        })
    }

    /// Creates the block's persistent default lobbies.
    pub fn setup_default_lobbies(self: &Arc<Block>, event: u8) {
        let mut lobbies = self.lobbies.lock();

        for id in 1..=lobby::DEFAULT_LOBBY_COUNT {
            lobbies.push(Lobby::new_default(self, id, event));
        }
    }

    pub fn get_lobby(&self, id: u32) -> Option<Arc<Lobby>> {
        self.lobbies.lock().iter().find(|l| l.id == id).cloned()
    }

    pub fn insert_lobby(&self, lobby: &Arc<Lobby>) {
        self.lobbies.lock().push(lobby.clone());
    }

    pub fn remove_lobby(&self, id: u32) {
        self.lobbies.lock().retain(|l| l.id != id);
    }

    /// First unused game id at or above `first`.
    pub fn next_game_id(&self, first: u32) -> u32 {
        let lobbies = self.lobbies.lock();
        let mut id = first;

        while lobbies.iter().any(|l| l.id == id) {
            id += 1;
        }

        id
    }

    pub fn find_client(&self, guildcard: Guildcard) -> Option<Arc<Client>> {
        self.clients
            .lock()
            .iter()
            .find(|client| client.guildcard() == guildcard)
            .cloned()
    }

    pub fn add_client(&self, client: &Arc<Client>) {
        self.clients.lock().push(client.clone());
    }

    pub fn remove_client(&self, client: &Arc<Client>) {
        self.clients.lock().retain(|c| !Arc::ptr_eq(c, client));
    }

    /// Count of listed games currently on this block.
    pub fn game_count(&self) -> usize {
        self.lobbies
            .lock()
            .iter()
            .filter(|l| l.kind != LobbyKind::Default)
            .count()
    }
}

/// The thread-owned side of a block: its readiness loop and slot table.
pub struct BlockRunner {
    ship: Arc<Ship>,
    block: Arc<Block>,
    endpoint: Endpoint,
    slots: Vec<Option<Arc<Client>>>,
    free: Vec<usize>,
    listeners: Vec<ClientVersion>,
    seed_rng: Mt,
    log: Logger,
}

impl BlockRunner {
    pub fn new(ship: Arc<Ship>, block: Arc<Block>) -> NetResult<BlockRunner> {
        let log = ship.log.new(logging::o!("block" => block.b));

        Ok(BlockRunner {
            ship,
            block,
            endpoint: Endpoint::new()?,
            slots: Vec::new(),
            free: Vec::new(),
            listeners: Vec::new(),
            seed_rng: Mt::new(rand::random::<u32>()),
            log,
        })
    }

    pub fn bind(&mut self) -> NetResult<()> {
        for version in BLOCK_VARIANTS.iter() {
            let port = self
                .ship
                .config
                .block_port(self.block.b, version.port_offset());

            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let listener = self.endpoint.add_listener(&addr)?;

            debug_assert_eq!(listener, self.listeners.len());
            self.listeners.push(*version);

            logging::info!(self.log, "block listening"; "port" => port, "variant" => ?version);
        }

        Ok(())
    }

    fn cipher_pair(version: ClientVersion, server_seed: u32, client_seed: u32) -> CipherPair {
        match version.cipher_family() {
            CipherFamily::Pc => CipherPair {
                recv: Cipher::Pc(PcCipher::new(client_seed)),
                send: Cipher::Pc(PcCipher::new(server_seed)),
            },
            CipherFamily::Gc => CipherPair {
                recv: Cipher::Gc(GcCipher::new(client_seed)),
                send: Cipher::Gc(GcCipher::new(server_seed)),
            },
        }
    }

    /// Installs a freshly accepted connection: welcome, ciphers, registry.
    pub fn attach(&mut self, session: Session, version: ClientVersion, addr: Ipv4Addr) -> usize {
        let mut session = session;

        let server_seed = self.seed_rng.next_u32();
        let client_seed = self.seed_rng.next_u32();

        drop(session.queue_plain(&packets::assemble_welcome(
            session.form(),
            server_seed,
            client_seed,
        )));
        session.install_ciphers(Self::cipher_pair(version, server_seed, client_seed));

        let client = Client::new(session, version, addr);

        self.block.add_client(&client);
        self.ship.inc_clients();

        self.ship.script.on_event(
            ScriptEvent::ClientBlockLogin,
            &ScriptClient::new(&client, true),
        );

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(client);
                slot
            }
            None => {
                self.slots.push(Some(client));
                self.slots.len() - 1
            }
        };

        slot
    }

    pub fn client(&self, slot: usize) -> Option<&Arc<Client>> {
        self.slots.get(slot).and_then(|slot| slot.as_ref())
    }

    fn send_txt(&self, client: &Arc<Client>, msg: &str) {
        drop(client.send(&packets::assemble_text(
            packets::header_form(client.version),
            msg,
        )));
    }

    fn room_error_text(err: RoomError) -> &'static str {
        match err {
            RoomError::Full => "\tE\tC4That game is full.",
            RoomError::Unavailable => "\tE\tC4That game is not available right now.",
            RoomError::BusyBurst => "\tE\tC4A player is bursting.\nTry again in a moment.",
            RoomError::QuestActive => "\tE\tC4A quest is in progress.",
            RoomError::QuestBeingSelected => "\tE\tC4A quest is being selected.",
            RoomError::LevelTooLow => "\tE\tC4Your level is too low.",
            RoomError::LevelTooHigh => "\tE\tC4Your level is too high.",
            RoomError::VersionMismatch => "\tE\tC4Your version can't join that game.",
            RoomError::LegitFail => "\tE\tC4You failed the legit check.",
            RoomError::NotBursting => "\tE\tC4No burst is in progress.",
            RoomError::UnexpectedDuringBurst => "\tE\tC4Hold on until the burst finishes.",
            RoomError::Internal => "\tE\tC4Something went wrong.",
        }
    }

    /// Dispatches one complete packet, already deciphered. The packet is
    /// normalised to the console header layout before the room machinery
    /// sees it.
    pub fn handle_packet(&mut self, slot: usize, pkt: &[u8]) -> NetResult<()> {
        let client = match self.client(slot) {
            Some(client) => client.clone(),
            None => return Ok(()),
        };

        let form = packets::header_form(client.version);
        let pkt = packets::convert_header(pkt, form, HeaderForm::Dc);
        let header = HeaderForm::Dc.parse(&pkt[..CLIENT_HEADER_SIZE]);

        logging::trace!(self.log, "block packet";
                        "slot" => slot,
                        "opcode" => header.opcode,
                        "guildcard" => client.guildcard());

        match header.opcode {
            packets::TYPE_BLOCK_LOGIN => self.handle_block_login(&client, &pkt),
            packets::TYPE_CHAR_DATA => self.handle_char_data(&client, &pkt),
            packets::TYPE_LOBBY_CHANGE => self.handle_lobby_change(&client, &pkt),
            packets::TYPE_GAME_CREATE => self.handle_game_create(&client, &pkt),
            packets::TYPE_GAME_COMMAND0
            | packets::TYPE_GAME_COMMAND2
            | packets::TYPE_GAME_COMMANDD => {
                if let Err(err) = crate::subcmd::handle_subcommand(&client, &pkt) {
                    if err == RoomError::UnexpectedDuringBurst {
                        self.send_txt(&client, Self::room_error_text(err));
                    }
                }
                Ok(())
            }
            packets::TYPE_DONE_BURST => self.handle_done_burst(&client),
            packets::TYPE_CHAT => self.handle_chat(&client, &pkt),
            packets::TYPE_AUTOREPLY_SET => {
                client.set_autoreply(&pkt[CLIENT_HEADER_SIZE..]);
                Ok(())
            }
            packets::TYPE_AUTOREPLY_CLEAR => {
                client.clear_autoreply();
                Ok(())
            }
            packets::TYPE_BLACKLIST => {
                let list = packets::parse_blacklist(&pkt)?;
                client.state.lock().blacklist = list;
                Ok(())
            }
            packets::TYPE_SIMPLE_MAIL => self.handle_mail(&client, &pkt),
            packets::TYPE_GUILD_SEARCH => self.handle_guild_search(&client, &pkt),
            packets::TYPE_INFO_REQ => self.handle_info_request(&client, &pkt),
            _ => {
                logging::debug!(self.log, "unhandled packet"; "opcode" => header.opcode);
                Ok(())
            }
        }
    }

    fn handle_block_login(&mut self, client: &Arc<Client>, pkt: &[u8]) -> NetResult<()> {
        let login = packets::BlockLogin::parse(pkt)?;

        client.set_guildcard(login.guildcard);
        client.set_flag(ClientFlags::LOGGED_IN);

        {
            let mut state = client.state.lock();
            state.language = login.language;
            state.player.name = login.char_name.clone();
        }

        logging::info!(self.log, "block login";
                       "guildcard" => login.guildcard,
                       "name" => &login.char_name);

        if !client.has_flag(ClientFlags::SENT_MOTD) {
            self.send_txt(client, "\tE\tC7Welcome aboard.");
            client.set_flag(ClientFlags::SENT_MOTD);
        }

        if let Err(err) = lobby::add_to_any(client, &self.block) {
            self.send_txt(client, Self::room_error_text(err));
            client.disconnect();
        }

        Ok(())
    }

    fn handle_char_data(&mut self, client: &Arc<Client>, pkt: &[u8]) -> NetResult<()> {
        let data = packets::CharData::parse(pkt)?;

        {
            let mut state = client.state.lock();
            state.player.name = data.name.clone();
            state.player.level = data.level;
            state.player.ch_class = data.ch_class;
            state.player.c_rank_times = data.c_rank_times;
            state.player.inventory = data
                .items
                .iter()
                .map(|&item| crate::client::InvItem { data: item })
                .collect();
            state.item_count = data.items.len() as u32;
        }

        // Mirror the record to the hub as the character backup.
        let mut blob = pkt[CLIENT_HEADER_SIZE..].to_vec();
        blob.resize(moor::gate::CHAR_DATA_SIZE, 0);

        self.ship.send_gate(GateCommand::CharBackup {
            guildcard: client.guildcard(),
            slot: 0,
            data: blob,
        });

        Ok(())
    }

    fn handle_lobby_change(&mut self, client: &Arc<Client>, pkt: &[u8]) -> NetResult<()> {
        let lobby_id = packets::parse_lobby_change(pkt)?;

        let target = match self.block.get_lobby(lobby_id) {
            Some(target) => target,
            None => {
                self.send_txt(client, "\tEThis game is no\nlonger active.");
                return Ok(());
            }
        };

        if let Err(err) = lobby::change_lobby(client, &target, self.ship.limits.as_ref()) {
            self.send_txt(client, Self::room_error_text(err));
        }

        Ok(())
    }

    fn handle_game_create(&mut self, client: &Arc<Client>, pkt: &[u8]) -> NetResult<()> {
        let create = packets::GameCreate::parse(pkt)?;

        let game = Lobby::new_game(
            &self.block,
            lobby::GameParams {
                name: create.name,
                passwd: create.passwd,
                difficulty: create.difficulty,
                battle: create.battle,
                challenge: create.challenge,
                v2: client.version == ClientVersion::DcV2,
                version: client.version,
                section: 0,
                event: self.ship.config.event,
                episode: create.episode,
            },
        );

        if let Err(err) = lobby::change_lobby(client, &game, self.ship.limits.as_ref()) {
            self.send_txt(client, Self::room_error_text(err));
            lobby::destroy(&game);
        }

        Ok(())
    }

    fn handle_done_burst(&mut self, client: &Arc<Client>) -> NetResult<()> {
        let current = match client.current_lobby() {
            Some(current) => current,
            None => return Ok(()),
        };

        if let Err(err) = lobby::finish_burst(&current, client) {
            self.send_txt(client, Self::room_error_text(err));
        }

        Ok(())
    }

    fn handle_chat(&mut self, client: &Arc<Client>, pkt: &[u8]) -> NetResult<()> {
        let text = String::from_utf8_lossy(&pkt[CLIENT_HEADER_SIZE..]).into_owned();
        let trimmed = text.trim_end_matches('\0');

        // The handful of chat commands the hub protocol backs.
        if let Some(rest) = trimmed.strip_prefix("/gm ") {
            let mut parts = rest.split_whitespace();

            if let (Some(username), Some(password)) = (parts.next(), parts.next()) {
                self.ship.send_gate(GateCommand::GmLogin {
                    guildcard: client.guildcard(),
                    block: self.block.b,
                    username: username.to_string(),
                    password: password.to_string(),
                });
            }

            return Ok(());
        }

        if trimmed.starts_with("/log") {
            if !client.local_gm() {
                self.send_txt(client, "\tE\tC4Nice try.");
                return Ok(());
            }

            let path = format!("packets-{}.log", client.guildcard());

            match std::fs::File::create(&path) {
                Ok(file) => {
                    client.session.lock().set_packet_log(file);
                    self.send_txt(client, "\tE\tC7Packet log opened.");
                }
                Err(err) => {
                    logging::warn!(self.log, "couldn't open a packet log";
                                   "path" => &path,
                                   "error" => %err);
                }
            }

            return Ok(());
        }

        if trimmed.starts_with("/restore") {
            self.ship.send_gate(GateCommand::CharRequest {
                guildcard: client.guildcard(),
                slot: 0,
            });

            return Ok(());
        }

        if let Some(rest) = trimmed.strip_prefix("/ban ") {
            if !client.local_root() {
                self.send_txt(client, "\tE\tC4Nice try.");
                return Ok(());
            }

            let mut parts = rest.splitn(2, ' ');

            if let Some(Ok(target)) = parts.next().map(str::parse::<u32>) {
                self.ship.send_gate(GateCommand::GuildcardBan {
                    req_gc: client.guildcard(),
                    target,
                    until: 0,
                    reason: parts.next().unwrap_or("").to_string(),
                });
            }

            return Ok(());
        }

        if let Some(rest) = trimmed.strip_prefix("/ipban ") {
            if !client.local_root() {
                self.send_txt(client, "\tE\tC4Nice try.");
                return Ok(());
            }

            let mut parts = rest.splitn(2, ' ');

            if let Some(Ok(addr)) = parts.next().map(str::parse::<Ipv4Addr>) {
                self.ship.send_gate(GateCommand::IpBan {
                    req_gc: client.guildcard(),
                    target: u32::from(addr),
                    until: 0,
                    reason: parts.next().unwrap_or("").to_string(),
                });
            }

            return Ok(());
        }

        if let Some(current) = client.current_lobby() {
            let state = current.lock();
            lobby::send_pkt_locked(&state, Some(client), pkt, true);
        }

        Ok(())
    }

    /// Info window query about one room.
    fn handle_info_request(&mut self, client: &Arc<Client>, pkt: &[u8]) -> NetResult<()> {
        let lobby_id = packets::parse_menu_select(pkt)?;

        let text = match self.block.get_lobby(lobby_id) {
            Some(target) => lobby::info_text(&target.lock()),
            None => "\tEThis game is no\nlonger active.".to_string(),
        };

        drop(client.send(&packets::assemble_info_reply(
            packets::header_form(client.version),
            &text,
        )));

        Ok(())
    }

    fn handle_mail(&mut self, client: &Arc<Client>, pkt: &[u8]) -> NetResult<()> {
        let target = packets::mail_target(pkt)?;
        let sender = client.guildcard();

        match self.ship.find_client(target) {
            Some(recipient) => {
                let blocked = {
                    let rstate = recipient.state.lock();
                    rstate.has_blacklisted(sender) || rstate.has_ignored(sender)
                };

                if blocked {
                    return Ok(());
                }

                let out = packets::convert_header(
                    pkt,
                    HeaderForm::Dc,
                    packets::header_form(recipient.version),
                );
                drop(recipient.send(&out));

                // A configured autoreply answers on the recipient's behalf.
                let autoreply = recipient.state.lock().autoreply.clone();

                if let Some(reply) = autoreply {
                    let text = String::from_utf8_lossy(&reply).into_owned();
                    self.send_txt(client, &text);
                }
            }
            None => {
                // Not on this ship: wrap it up for the hub. Handheld mail
                // travels in the handheld envelope.
                let cmd = if client.version.uses_pc_header() {
                    GateCommand::ForwardPc {
                        ship_id: 0,
                        inner: pkt.to_vec(),
                    }
                } else {
                    GateCommand::ForwardDc {
                        ship_id: 0,
                        inner: pkt.to_vec(),
                    }
                };

                self.ship.send_gate(cmd);
            }
        }

        Ok(())
    }

    fn handle_guild_search(&mut self, client: &Arc<Client>, pkt: &[u8]) -> NetResult<()> {
        let search = packets::GuildSearch::parse(pkt)?;

        match self.ship.find_client(search.target) {
            Some(found) => {
                let blocked = {
                    let fstate = found.state.lock();
                    fstate.has_blacklisted(search.searcher)
                };

                if blocked {
                    return Ok(());
                }

                // Room lock comes after the client lock is released; the
                // room machinery locks in the opposite order.
                let room = found
                    .current_lobby()
                    .map(|l| l.lock().name.clone())
                    .unwrap_or_default();

                let location =
                    format!("{},BLOCK{:02},{}", self.ship.config.name, self.block.b, room);

                drop(client.send(&packets::assemble_guild_reply(
                    packets::header_form(client.version),
                    search.searcher,
                    search.target,
                    &location,
                )));
            }
            None => {
                self.ship.send_gate(GateCommand::ForwardDc {
                    ship_id: 0,
                    inner: pkt.to_vec(),
                });
            }
        }

        Ok(())
    }

    fn detach(&mut self, slot: usize) {
        let client = match self.slots[slot].take() {
            Some(client) => client,
            None => return,
        };

        self.free.push(slot);

        // A client that vanishes mid-burst must not leave its room stuck:
        // end the burst and let the held-back traffic drain.
        if client.has_flag(ClientFlags::BURSTING) {
            if let Some(current) = client.current_lobby() {
                drop(lobby::finish_burst(&current, &client));
            }
        }

        drop(lobby::remove_player(&client));

        self.ship.script.on_event(
            ScriptEvent::ClientBlockLogout,
            &ScriptClient::new(&client, true),
        );

        {
            let mut session = client.session.lock();

            if session.is_attached() {
                drop(session.flush());
                drop(self.endpoint.deregister_session(&session));
            }
        }

        self.block.remove_client(&client);
        self.ship.dec_clients();

        logging::info!(self.log, "client left block"; "guildcard" => client.guildcard());
    }

    fn service_client(&mut self, slot: usize, now: Instant) {
        let received = match self.client(slot) {
            Some(client) => client.session.lock().receive(now),
            None => return,
        };

        if received.has_failed() {
            if let Some(client) = self.client(slot) {
                client.disconnect();
            }
            return;
        }

        loop {
            let pkt = match self.client(slot) {
                Some(client) => {
                    let mut session = client.session.lock();

                    match session.next_packet() {
                        Ok(pkt) => pkt,
                        Err(NetError::Wait) => break,
                        Err(_) => {
                            session.mark_disconnected();
                            break;
                        }
                    }
                }
                None => break,
            };

            if self.handle_packet(slot, &pkt).has_failed() {
                if let Some(client) = self.client(slot) {
                    client.disconnect();
                }
                break;
            }

            let gone = self
                .client(slot)
                .map(|client| client.is_disconnected())
                .unwrap_or(true);

            if gone {
                break;
            }
        }
    }

    fn flush_slot(&mut self, slot: usize) {
        let flushed = match self.client(slot) {
            Some(client) => {
                let mut session = client.session.lock();

                if session.is_attached() && session.has_pending() {
                    session.flush()
                } else {
                    return;
                }
            }
            None => return,
        };

        if flushed.has_failed() {
            if let Some(client) = self.client(slot) {
                client.disconnect();
            }
        }
    }

    fn harvest(&mut self) {
        let doomed: Vec<usize> = (0..self.slots.len())
            .filter(|&slot| {
                self.client(slot)
                    .map(|client| client.is_disconnected())
                    .unwrap_or(false)
            })
            .collect();

        for slot in doomed {
            self.detach(slot);
        }
    }

    /// The block thread's main loop.
    pub fn run(&mut self) -> NetResult<()> {
        loop {
            let ready = self.endpoint.poll(POLL_TIMEOUT)?;
            let now = Instant::now();

            for readiness in ready {
                match readiness {
                    Readiness::Accept { listener } => {
                        let version = self.listeners[listener];

                        while let Some((stream, peer)) = self.endpoint.accept(listener)? {
                            let peer_v4 = match peer.ip() {
                                IpAddr::V4(v4) => v4,
                                IpAddr::V6(_) => continue,
                            };

                            logging::info!(self.log, "accepted block connection";
                                           "peer" => %peer,
                                           "variant" => ?version);

                            let form = packets::header_form(version);
                            let session = Session::open(form, stream, peer);
                            let slot = self.attach(session, version, peer_v4);

                            let register = {
                                let client = self.client(slot).expect("Attached client vanished");
                                let session = client.session.lock();
                                self.endpoint.register_session(slot, &session)
                            };

                            if register.has_failed() {
                                if let Some(client) = self.client(slot) {
                                    client.disconnect();
                                }
                            }
                        }
                    }
                    Readiness::Session {
                        slot,
                        readable,
                        writable,
                    } => {
                        if readable {
                            self.service_client(slot, now);
                        }

                        if writable {
                            self.flush_slot(slot);
                        }
                    }
                }
            }

            for slot in 0..self.slots.len() {
                self.flush_slot(slot);
            }

            for slot in 0..self.slots.len() {
                if let Some(client) = self.client(slot) {
                    if client.session.lock().last_message_elapsed(now) >= IDLE_TIMEOUT {
                        client.disconnect();
                    }
                }
            }

            self.harvest();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_block, test_ship};
    use byteorder::{ByteOrder, LittleEndian};
    use keel::crypto::{Cipher, GcCipher, PcCipher};
    use std::sync::mpsc;

    /// A detached connection as the remote end sees it: tracks the slot
    /// and the stream that deciphers server-to-client traffic.
    struct WirePeer {
        slot: usize,
        form: HeaderForm,
        decrypt: Cipher,
    }

    impl WirePeer {
        fn drain(&mut self, runner: &BlockRunner) -> Vec<Vec<u8>> {
            let mut raw = runner
                .client(self.slot)
                .expect("Peer vanished")
                .session
                .lock()
                .drain_pending();

            self.decrypt.apply(&mut raw);

            let mut out = Vec::new();
            let mut rest = &raw[..];

            while rest.len() >= CLIENT_HEADER_SIZE {
                let header = self.form.parse(&rest[..CLIENT_HEADER_SIZE]);
                let len = self.form.padded_len(header.len);

                out.push(rest[..len].to_vec());
                rest = &rest[len..];
            }

            out
        }

        fn drain_opcodes(&mut self, runner: &BlockRunner) -> Vec<u16> {
            let form = self.form;

            self.drain(runner)
                .iter()
                .map(|pkt| form.parse(&pkt[..CLIENT_HEADER_SIZE]).opcode)
                .collect()
        }
    }

    fn make_runner() -> (Arc<Ship>, Arc<Block>, BlockRunner, mpsc::Receiver<GateCommand>) {
        let ship = test_ship();

        let (tx, rx) = mpsc::channel();
        ship.set_gate(tx);

        let block = test_block(&ship);
        let runner = BlockRunner::new(ship.clone(), block.clone()).unwrap();

        (ship, block, runner, rx)
    }

    fn attach_peer(runner: &mut BlockRunner, version: ClientVersion) -> WirePeer {
        let form = packets::header_form(version);
        let slot = runner.attach(Session::new(form), version, Ipv4Addr::LOCALHOST);

        // The plaintext welcome carries both seeds; everything after is
        // enciphered with the server seed.
        let raw = runner
            .client(slot)
            .unwrap()
            .session
            .lock()
            .drain_pending();

        let body = &raw[CLIENT_HEADER_SIZE..];
        let server_seed = LittleEndian::read_u32(&body[64..68]);

        let decrypt = match version.cipher_family() {
            CipherFamily::Pc => Cipher::Pc(PcCipher::new(server_seed)),
            CipherFamily::Gc => Cipher::Gc(GcCipher::new(server_seed)),
        };

        WirePeer {
            slot,
            form,
            decrypt,
        }
    }

    fn login(runner: &mut BlockRunner, peer: &WirePeer, guildcard: u32) {
        let pkt = packets::BlockLogin {
            guildcard,
            language: 1,
            char_name: format!("P{}", guildcard),
        }
        .assemble(peer.form);

        runner.handle_packet(peer.slot, &pkt).unwrap();
    }

    fn drain_gate(rx: &mpsc::Receiver<GateCommand>) -> Vec<GateCommand> {
        let mut out = Vec::new();

        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }

        out
    }

    #[test]
    fn test_block_login_lands_in_a_lobby() {
        let (ship, _block, mut runner, rx) = make_runner();

        let mut peer = attach_peer(&mut runner, ClientVersion::GcUs);
        login(&mut runner, &peer, 500);

        let client = runner.client(peer.slot).unwrap();

        assert_eq!(client.guildcard(), 500);
        assert!(client.has_flag(ClientFlags::LOGGED_IN));
        assert!(client.current_lobby().is_some());
        assert_eq!(ship.clients(), 1);

        let opcodes = peer.drain_opcodes(&runner);
        assert!(opcodes.contains(&packets::TYPE_TEXT_MSG));
        assert!(opcodes.contains(&packets::TYPE_LOBBY_JOIN));

        // The attach published a fresh counter to the hub.
        assert!(drain_gate(&rx)
            .iter()
            .any(|cmd| matches!(cmd, GateCommand::Counts { clients: 1, .. })));
    }

    #[test]
    fn test_game_create_moves_creator_in() {
        let (ship, _block, mut runner, _rx) = make_runner();

        let mut peer = attach_peer(&mut runner, ClientVersion::GcUs);
        login(&mut runner, &peer, 500);
        peer.drain(&runner);

        let create = packets::GameCreate {
            name: "forest run".to_string(),
            passwd: String::new(),
            difficulty: 0,
            battle: false,
            challenge: false,
            episode: 1,
        }
        .assemble(peer.form);

        runner.handle_packet(peer.slot, &create).unwrap();

        assert_eq!(ship.games(), 1);

        let client = runner.client(peer.slot).unwrap();
        let game = client.current_lobby().unwrap();
        assert!(game.is_game());
        assert_eq!(game.lock().name, "forest run");

        let opcodes = peer.drain_opcodes(&runner);
        assert!(opcodes.contains(&packets::TYPE_GAME_JOIN));
    }

    #[test]
    fn test_lobby_change_error_reported_in_chat() {
        let (_ship, block, mut runner, _rx) = make_runner();

        let mut peer = attach_peer(&mut runner, ClientVersion::GcUs);
        login(&mut runner, &peer, 500);
        peer.drain(&runner);

        // Mark a target lobby unavailable and try to enter it.
        let target = block.get_lobby(5).unwrap();
        target.lock().flags.insert(crate::lobby::LobbyFlags::TEMP_UNAVAIL);

        let change = packets::assemble_lobby_change(peer.form, 5);
        runner.handle_packet(peer.slot, &change).unwrap();

        let opcodes = peer.drain_opcodes(&runner);
        assert_eq!(opcodes, vec![packets::TYPE_TEXT_MSG]);

        // Still in the original lobby.
        let client = runner.client(peer.slot).unwrap();
        assert_eq!(client.current_lobby().unwrap().id, 1);
    }

    #[test]
    fn test_local_mail_delivery_and_blacklist() {
        let (_ship, _block, mut runner, _rx) = make_runner();

        let sender = attach_peer(&mut runner, ClientVersion::GcUs);
        let mut recipient = attach_peer(&mut runner, ClientVersion::GcUs);

        login(&mut runner, &sender, 500);
        login(&mut runner, &recipient, 501);
        recipient.drain(&runner);

        let mut body = vec![0u8; 24];
        LittleEndian::write_u32(&mut body[..4], 500);
        LittleEndian::write_u32(&mut body[4..8], 501);
        let mail = packets::assemble(HeaderForm::Dc, packets::TYPE_SIMPLE_MAIL, 0, &body);

        runner.handle_packet(sender.slot, &mail).unwrap();

        let opcodes = recipient.drain_opcodes(&runner);
        assert_eq!(opcodes, vec![packets::TYPE_SIMPLE_MAIL]);

        // Blacklisting the sender silences them.
        runner
            .client(recipient.slot)
            .unwrap()
            .state
            .lock()
            .blacklist[0] = 500;

        runner.handle_packet(sender.slot, &mail).unwrap();
        assert!(recipient.drain(&runner).is_empty());
    }

    #[test]
    fn test_offship_mail_forwarded_to_hub() {
        let (_ship, _block, mut runner, rx) = make_runner();

        let peer = attach_peer(&mut runner, ClientVersion::GcUs);
        login(&mut runner, &peer, 500);
        drain_gate(&rx);

        let mut body = vec![0u8; 24];
        LittleEndian::write_u32(&mut body[..4], 500);
        LittleEndian::write_u32(&mut body[4..8], 999);
        let mail = packets::assemble(HeaderForm::Dc, packets::TYPE_SIMPLE_MAIL, 0, &body);

        runner.handle_packet(peer.slot, &mail).unwrap();

        let forwarded = drain_gate(&rx);
        assert!(forwarded
            .iter()
            .any(|cmd| matches!(cmd, GateCommand::ForwardDc { .. })));
    }

    #[test]
    fn test_guild_search_local_reply() {
        let (_ship, _block, mut runner, _rx) = make_runner();

        let mut searcher = attach_peer(&mut runner, ClientVersion::GcUs);
        let found = attach_peer(&mut runner, ClientVersion::GcUs);

        login(&mut runner, &searcher, 500);
        login(&mut runner, &found, 501);
        searcher.drain(&runner);

        let search = packets::GuildSearch {
            searcher: 500,
            target: 501,
        }
        .assemble(searcher.form);

        runner.handle_packet(searcher.slot, &search).unwrap();

        let packets_out = searcher.drain(&runner);
        assert_eq!(packets_out.len(), 1);

        let header = searcher.form.parse(&packets_out[0][..CLIENT_HEADER_SIZE]);
        assert_eq!(header.opcode, packets::TYPE_GUILD_REPLY);

        // The location names this ship and block.
        let text = String::from_utf8_lossy(&packets_out[0][12..]).into_owned();
        assert!(text.contains("BLOCK01"));
    }

    #[test]
    fn test_gm_chat_command_reaches_hub() {
        let (_ship, _block, mut runner, rx) = make_runner();

        let peer = attach_peer(&mut runner, ClientVersion::GcUs);
        login(&mut runner, &peer, 500);
        drain_gate(&rx);

        let chat = packets::assemble(
            HeaderForm::Dc,
            packets::TYPE_CHAT,
            0,
            b"/gm operator hunter2\0\0\0\0",
        );
        runner.handle_packet(peer.slot, &chat).unwrap();

        let commands = drain_gate(&rx);
        let gm = commands.iter().find_map(|cmd| match cmd {
            GateCommand::GmLogin {
                guildcard,
                username,
                password,
                ..
            } => Some((*guildcard, username.clone(), password.clone())),
            _ => None,
        });

        assert_eq!(
            gm,
            Some((500, "operator".to_string(), "hunter2".to_string()))
        );
    }

    #[test]
    fn test_char_data_updates_player_and_backs_up() {
        let (_ship, _block, mut runner, rx) = make_runner();

        let peer = attach_peer(&mut runner, ClientVersion::GcUs);
        login(&mut runner, &peer, 500);
        drain_gate(&rx);

        let data = packets::CharData {
            name: "Rico".to_string(),
            level: 42,
            ch_class: 3,
            c_rank_times: [1, 1, 0, 0, 0, 0, 0, 0, 0],
            items: vec![[7, 0, 0, 0]],
        }
        .assemble(peer.form);

        runner.handle_packet(peer.slot, &data).unwrap();

        {
            let client = runner.client(peer.slot).unwrap();
            let state = client.state.lock();

            assert_eq!(state.player.name, "Rico");
            assert_eq!(state.player.level, 42);
            assert_eq!(state.player.inventory.len(), 1);
            assert_eq!(state.item_count, 1);
        }

        let backup = drain_gate(&rx).into_iter().find_map(|cmd| match cmd {
            GateCommand::CharBackup {
                guildcard, data, ..
            } => Some((guildcard, data)),
            _ => None,
        });

        let (guildcard, blob) = backup.expect("No character backup sent");
        assert_eq!(guildcard, 500);
        assert_eq!(blob.len(), moor::gate::CHAR_DATA_SIZE);
    }

    #[test]
    fn test_autoreply_and_blacklist_packets() {
        let (_ship, _block, mut runner, _rx) = make_runner();

        let peer = attach_peer(&mut runner, ClientVersion::GcUs);
        login(&mut runner, &peer, 500);

        let set = packets::assemble(
            HeaderForm::Dc,
            packets::TYPE_AUTOREPLY_SET,
            0,
            b"gone fishing\0\0\0\0",
        );
        runner.handle_packet(peer.slot, &set).unwrap();

        {
            let client = runner.client(peer.slot).unwrap();
            assert_eq!(
                client.state.lock().autoreply.as_deref(),
                Some(&b"gone fishing"[..])
            );
        }

        let clear = packets::assemble(HeaderForm::Dc, packets::TYPE_AUTOREPLY_CLEAR, 0, &[]);
        runner.handle_packet(peer.slot, &clear).unwrap();

        {
            let client = runner.client(peer.slot).unwrap();
            assert!(client.state.lock().autoreply.is_none());
        }

        let mut body = [0u8; 120];
        LittleEndian::write_u32(&mut body[..4], 42);
        let blacklist = packets::assemble(HeaderForm::Dc, packets::TYPE_BLACKLIST, 0, &body);
        runner.handle_packet(peer.slot, &blacklist).unwrap();

        {
            let client = runner.client(peer.slot).unwrap();
            assert!(client.state.lock().has_blacklisted(42));
        }
    }

    #[test]
    fn test_disconnect_harvest_detaches_everywhere() {
        let (ship, block, mut runner, _rx) = make_runner();

        let peer = attach_peer(&mut runner, ClientVersion::GcUs);
        login(&mut runner, &peer, 500);

        let client = runner.client(peer.slot).unwrap().clone();
        let lobby = client.current_lobby().unwrap();

        client.disconnect();
        runner.harvest();

        assert!(runner.client(peer.slot).is_none());
        assert!(block.find_client(500).is_none());
        assert_eq!(ship.clients(), 0);
        assert_eq!(lobby.lock().num_clients, 0);
        assert!(client.current_lobby().is_none());
    }
}
