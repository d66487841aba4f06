//! The ship's side of the hub link: one authenticated RC4 session carrying
//! counters, cross-ship mail and searches, character backups, GM
//! authentication and ban requests.

use crate::client::Client;
use crate::packets;
use crate::ship::Ship;
use keel::crypto::{derive_session_key, Cipher, Rc4Stream};
use keel::logging::{self, Logger};
use keel::Guildcard;
use moor::endpoint::{Endpoint, Readiness};
use moor::error::{NetError, NetResult};
use moor::gate::*;
use moor::header::HeaderForm;
use moor::session::{peek_header, CipherPair, Session};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Work other threads hand to the hub link.
pub enum GateCommand {
    Counts {
        clients: u16,
        games: u16,
    },
    ForwardDc {
        /// Ship id for the envelope; zero except for guild replies, which
        /// name the ship the original search came from.
        ship_id: u32,
        inner: Vec<u8>,
    },
    ForwardPc {
        ship_id: u32,
        inner: Vec<u8>,
    },
    CharBackup {
        guildcard: Guildcard,
        slot: u32,
        data: Vec<u8>,
    },
    CharRequest {
        guildcard: Guildcard,
        slot: u32,
    },
    GmLogin {
        guildcard: Guildcard,
        block: u32,
        username: String,
        password: String,
    },
    GuildcardBan {
        req_gc: Guildcard,
        target: Guildcard,
        until: u32,
        reason: String,
    },
    IpBan {
        req_gc: Guildcard,
        target: u32,
        until: u32,
        reason: String,
    },
}

/// Runs on its own thread; owns the single session to the hub.
pub struct GateLink {
    ship: Arc<Ship>,
    key: [u8; 128],
    rx: mpsc::Receiver<GateCommand>,
    pending: VecDeque<GateCommand>,
    derived_keys: Option<([u8; 64], [u8; 64])>,
    logged_in: bool,
    log: Logger,
}

impl GateLink {
    pub fn new(ship: Arc<Ship>, key: [u8; 128], rx: mpsc::Receiver<GateCommand>) -> GateLink {
        let log = ship.log.new(logging::o!("task" => "gate-link"));

        GateLink {
            ship,
            key,
            rx,
            pending: VecDeque::new(),
            derived_keys: None,
            logged_in: false,
            log,
        }
    }

    /// Spawns the link thread and wires its command channel into the ship.
    pub fn spawn(ship: Arc<Ship>, key: [u8; 128]) -> thread::JoinHandle<()> {
        let (tx, rx) = mpsc::channel();
        ship.set_gate(tx);

        let mut link = GateLink::new(ship, key, rx);

        thread::Builder::new()
            .name("gate-link".to_string())
            .spawn(move || link.run())
            .expect("Failed to spawn the hub link thread")
    }

    /// Connect-and-serve forever, with a delay between reconnects.
    pub fn run(&mut self) {
        loop {
            if let Err(err) = self.serve_once() {
                logging::warn!(self.log, "hub link dropped"; "error" => ?err);
            }

            self.logged_in = false;
            thread::sleep(RECONNECT_DELAY);
        }
    }

    fn serve_once(&mut self) -> NetResult<()> {
        let addr: SocketAddr = self.ship.config.gate_addr.parse()?;

        let mut session = Session::connect(HeaderForm::Gate, &addr)?;

        let mut endpoint = Endpoint::new()?;
        endpoint.register_session(0, &session)?;

        logging::info!(self.log, "connecting to hub"; "addr" => %addr);

        loop {
            let ready = endpoint.poll(POLL_TIMEOUT)?;
            let now = Instant::now();

            for readiness in ready {
                if let Readiness::Session { readable, writable, .. } = readiness {
                    if readable {
                        match session.receive(now) {
                            Ok(_) | Err(NetError::Wait) => (),
                            Err(err) => return Err(err),
                        }

                        loop {
                            match session.next_packet() {
                                Ok(pkt) => self.handle_packet(&mut session, &pkt)?,
                                Err(NetError::Wait) => break,
                                Err(err) => return Err(err),
                            }
                        }
                    }

                    if writable && session.has_pending() {
                        match session.flush() {
                            Ok(_) | Err(NetError::Wait) => (),
                            Err(err) => return Err(err),
                        }
                    }
                }
            }

            // Pull in work from the rest of the ship.
            while let Ok(cmd) = self.rx.try_recv() {
                self.pending.push_back(cmd);
            }

            if self.logged_in {
                while let Some(cmd) = self.pending.pop_front() {
                    let pkt = self.assemble_command(cmd);
                    session.queue_packet(&pkt)?;
                }
            }

            if session.has_pending() {
                match session.flush() {
                    Ok(_) | Err(NetError::Wait) => (),
                    Err(err) => return Err(err),
                }
            }

            if session.is_disconnected() {
                return Ok(());
            }
        }
    }

    fn assemble_command(&self, cmd: GateCommand) -> Vec<u8> {
        match cmd {
            GateCommand::Counts { clients, games } => Counts {
                ship_id: self.ship.config.key_idx,
                clients,
                games,
            }
            .assemble(),
            GateCommand::ForwardDc { ship_id, inner } => {
                Forward { ship_id, inner }.assemble(TYPE_DC)
            }
            GateCommand::ForwardPc { ship_id, inner } => {
                Forward { ship_id, inner }.assemble(TYPE_PC)
            }
            GateCommand::CharBackup {
                guildcard,
                slot,
                data,
            } => {
                let mut data = data;
                data.resize(CHAR_DATA_SIZE, 0);

                CharData {
                    guildcard,
                    slot,
                    data,
                }
                .assemble(0)
            }
            GateCommand::CharRequest { guildcard, slot } => {
                CharReq { guildcard, slot }.assemble()
            }
            GateCommand::GmLogin {
                guildcard,
                block,
                username,
                password,
            } => GmLogin {
                guildcard,
                block,
                username,
                password,
            }
            .assemble(),
            GateCommand::GuildcardBan {
                req_gc,
                target,
                until,
                reason,
            } => BanReq {
                req_gc,
                target,
                until,
                reason,
            }
            .assemble(TYPE_GCBAN),
            GateCommand::IpBan {
                req_gc,
                target,
                until,
                reason,
            } => BanReq {
                req_gc,
                target,
                until,
                reason,
            }
            .assemble(TYPE_IPBAN),
        }
    }

    fn handle_packet(&mut self, session: &mut Session, pkt: &[u8]) -> NetResult<()> {
        let header = peek_header(HeaderForm::Gate, pkt);

        match header.opcode {
            TYPE_LOGIN if header.flags & FLAG_RESPONSE == 0 => {
                // The hub's welcome: answer with our login, still in the
                // clear, and remember the nonces for the key derivation.
                let welcome = Welcome::parse(pkt)?;

                let login = ShipLogin {
                    proto_ver: PROTO_VER_CURRENT,
                    key_idx: self.ship.config.key_idx,
                    menu_code: self.ship.config.menu_code_packed(),
                    flags: self.ship.config.gate_flags(),
                    external: self.ship.config.external_addr,
                    internal: self.ship.config.internal_addr,
                    port: self.ship.config.base_port,
                    clients: self.ship.clients(),
                    games: self.ship.games(),
                    name: self.ship.config.name.clone(),
                };

                session.queue_plain(&login.assemble())?;

                self.install_keys_after_ack(welcome);
                Ok(())
            }
            TYPE_LOGIN => {
                let reply = ErrorReply::parse(pkt)?;

                if reply.code == ERR_NO_ERROR {
                    // Everything from here on is enciphered.
                    if let Some((recv_key, send_key)) = self.derived_keys.take() {
                        session.install_ciphers(CipherPair {
                            recv: Cipher::Rc4(Rc4Stream::new(&recv_key)),
                            send: Cipher::Rc4(Rc4Stream::new(&send_key)),
                        });
                    }

                    self.logged_in = true;
                    logging::info!(self.log, "hub accepted our login");
                } else {
                    logging::error!(self.log, "hub rejected our login"; "code" => reply.code);
                    session.mark_disconnected();
                }

                Ok(())
            }
            TYPE_STATUS => {
                let status = ShipStatus::parse(pkt)?;

                logging::debug!(self.log, "fleet update";
                                "ship" => &status.name,
                                "online" => status.online);
                self.ship.update_fleet(status);
                Ok(())
            }
            TYPE_COUNT => {
                let counts = Counts::parse(pkt)?;
                self.ship
                    .update_fleet_counts(counts.ship_id, counts.clients, counts.games);
                Ok(())
            }
            TYPE_PING => {
                if header.flags & FLAG_RESPONSE == 0 {
                    session.queue_packet(&assemble_ping(true))?;
                }
                Ok(())
            }
            TYPE_DC | TYPE_PC => self.handle_forward(pkt),
            TYPE_GMLOGIN if header.flags & FLAG_RESPONSE != 0 => {
                let reply = GmReply::parse(pkt)?;

                if let Some(client) = self.ship.find_client(reply.guildcard) {
                    if reply.allowed {
                        client.set_privilege(u32::from(reply.privilege));
                        self.notify(&client, "\tE\tC7GM privileges granted.");
                    }
                }

                Ok(())
            }
            TYPE_GMLOGIN => {
                let reply = ErrorReply::parse(pkt)?;

                logging::info!(self.log, "GM login refused"; "code" => reply.code);

                if reply.data.len() >= 4 {
                    let guildcard = u32::from_be_bytes([
                        reply.data[0],
                        reply.data[1],
                        reply.data[2],
                        reply.data[3],
                    ]);

                    if let Some(client) = self.ship.find_client(guildcard) {
                        self.notify(&client, "\tE\tC4GM authentication failed.");
                    }
                }

                Ok(())
            }
            TYPE_CDATA => {
                // A restored character backup on its way to a client.
                let cdata = moor::gate::CharData::parse(pkt)?;

                if let Some(client) = self.ship.find_client(cdata.guildcard) {
                    let out = packets::assemble(
                        packets::header_form(client.version),
                        packets::TYPE_CHAR_DATA,
                        0,
                        &cdata.data,
                    );
                    drop(client.send(&out));
                }

                Ok(())
            }
            TYPE_CREQ | TYPE_GCBAN | TYPE_IPBAN => {
                // Acknowledgements; nothing to do beyond logging failures.
                if header.flags & FLAG_FAILURE != 0 {
                    let reply = ErrorReply::parse(pkt)?;
                    logging::warn!(self.log, "hub request failed";
                                   "opcode" => header.opcode,
                                   "code" => reply.code);
                }

                Ok(())
            }
            _ => {
                logging::debug!(self.log, "unhandled hub packet"; "opcode" => header.opcode);
                Ok(())
            }
        }
    }

    /// Delivers a forwarded inner packet to whichever local player it
    /// addresses. Unknown targets are dropped; the origin ship fans out to
    /// the whole fleet and most ships will come up empty.
    fn handle_forward(&mut self, pkt: &[u8]) -> NetResult<()> {
        let fw = Forward::parse(pkt)?;

        let origin_ship = fw.ship_id;
        let inner = fw.inner;

        match inner.first().copied() {
            Some(SHIP_SIMPLE_MAIL_TYPE) => {
                let target = packets::mail_target(&inner)?;
                let sender = packets::mail_sender(&inner)?;

                if let Some(recipient) = self.ship.find_client(target) {
                    let blocked = {
                        let rstate = recipient.state.lock();
                        rstate.has_blacklisted(sender) || rstate.has_ignored(sender)
                    };

                    if !blocked {
                        let out = packets::convert_header(
                            &inner,
                            HeaderForm::Dc,
                            packets::header_form(recipient.version),
                        );
                        drop(recipient.send(&out));
                    }
                }

                Ok(())
            }
            Some(SHIP_GUILD_SEARCH_TYPE) => {
                let search = packets::GuildSearch::parse(&inner)?;

                if let Some(found) = self.ship.find_client(search.target) {
                    let blocked = found.state.lock().has_blacklisted(search.searcher);

                    if !blocked {
                        let room = found
                            .current_lobby()
                            .map(|l| l.lock().name.clone())
                            .unwrap_or_default();

                        let location = format!("{},{}", self.ship.config.name, room);

                        let reply = packets::assemble_guild_reply(
                            HeaderForm::Dc,
                            search.searcher,
                            search.target,
                            &location,
                        );

                        // Route the answer back through the hub to the
                        // ship the search came from.
                        self.ship.send_gate(GateCommand::ForwardDc {
                            ship_id: origin_ship,
                            inner: reply,
                        });
                    }
                }

                Ok(())
            }
            Some(SHIP_DC_GUILD_REPLY_TYPE) => {
                // A search we forwarded earlier found its player.
                if inner.len() >= 8 {
                    let searcher = u32::from_le_bytes([inner[4], inner[5], inner[6], inner[7]]);

                    if let Some(client) = self.ship.find_client(searcher) {
                        let out = packets::convert_header(
                            &inner,
                            HeaderForm::Dc,
                            packets::header_form(client.version),
                        );
                        drop(client.send(&out));
                    }
                }

                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn notify(&self, client: &Arc<Client>, msg: &str) {
        drop(client.send(&packets::assemble_text(
            packets::header_form(client.version),
            msg,
        )));
    }

    fn install_keys_after_ack(&mut self, welcome: Welcome) {
        // Hub-to-ship traffic is keyed off the ship nonce, ship-to-hub off
        // the gate nonce.
        let recv_key = derive_session_key(&self.key, welcome.ship_nonce);
        let send_key = derive_session_key(&self.key, welcome.gate_nonce);

        self.derived_keys = Some((recv_key, send_key));
    }
}
