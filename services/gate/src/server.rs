use crate::config::GateConfig;
use crate::ship::ShipConn;
use keel::crypto::{derive_session_key, password_hash, Cipher, Rc4Stream};
use keel::logging::{self, Logger};
use keel::privilege::Privilege;
use moor::endpoint::{Endpoint, Readiness};
use moor::error::{ErrorType, ErrorUtils, NetError, NetResult};
use moor::gate::*;
use moor::header::HeaderForm;
use moor::session::{peek_header, CipherPair, Session};
use ledger::{Backing, OnlineShipRow};
use rand::RngCore;
use rand_mt::Mt;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Every request the hub acknowledges leads with eight bytes of identifying
// payload (guildcard + slot/block/target); replies echo them back.
const ACK_DATA_RANGE: Range<usize> = 8..16;

const POLL_TIMEOUT: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(60);
const DEAD_INTERVAL: Duration = Duration::from_secs(180);

/// The hub. Single-threaded: one readiness loop over every ship session,
/// with no suspension inside handlers.
pub struct GateServer {
    endpoint: Endpoint,
    config: GateConfig,
    backing: Arc<dyn Backing>,

    ships: Vec<Option<ShipConn>>,
    free: Vec<usize>,

    nonce_rng: Mt,
    log: Logger,
}

impl GateServer {
    pub fn new(config: GateConfig, backing: Arc<dyn Backing>, log: &Logger) -> NetResult<GateServer> {
        Ok(GateServer {
            endpoint: Endpoint::new()?,
            config,
            backing,
            ships: Vec::new(),
            free: Vec::new(),
            nonce_rng: Mt::new(rand::random::<u32>()),
            log: log.new(logging::o!()),
        })
    }

    /// Binds the hub listener. Split from construction so the handler tests
    /// can run without touching the network.
    pub fn bind(&mut self) -> NetResult<usize> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = self.endpoint.add_listener(&addr)?;

        logging::info!(self.log, "hub listening"; "port" => self.config.port);
        Ok(listener)
    }

    fn next_nonce(&mut self) -> [u8; 4] {
        let mut nonce = [0u8; 4];

        for byte in nonce.iter_mut() {
            *byte = self.nonce_rng.next_u32() as u8;
        }

        nonce
    }

    /// Installs a new ship connection and sends the welcome carrying the
    /// key-mixing nonces. Returns the connection's slot.
    pub fn attach(&mut self, session: Session) -> usize {
        let gate_nonce = self.next_nonce();
        let ship_nonce = self.next_nonce();

        let mut conn = ShipConn::new(session, gate_nonce, ship_nonce);

        let welcome = Welcome {
            gate_nonce,
            ship_nonce,
        };
        drop(conn.session.queue_plain(&welcome.assemble()));

        match self.free.pop() {
            Some(slot) => {
                self.ships[slot] = Some(conn);
                slot
            }
            None => {
                self.ships.push(Some(conn));
                self.ships.len() - 1
            }
        }
    }

    pub fn ship(&self, slot: usize) -> Option<&ShipConn> {
        self.ships.get(slot).and_then(|conn| conn.as_ref())
    }

    pub fn ship_mut(&mut self, slot: usize) -> Option<&mut ShipConn> {
        self.ships.get_mut(slot).and_then(|conn| conn.as_mut())
    }

    fn disconnect_slot(&mut self, slot: usize) {
        if let Some(conn) = self.ship_mut(slot) {
            conn.session.mark_disconnected();
        }
    }

    /// Queues a packet to one ship, in the clear until its login completed.
    fn send_to(&mut self, slot: usize, pkt: &[u8]) -> NetResult<()> {
        let conn = match self.ship_mut(slot) {
            Some(conn) => conn,
            None => return Ok(()),
        };

        if conn.key_set {
            conn.session.queue_packet(pkt)
        } else {
            conn.session.queue_plain(pkt)
        }
    }

    fn send_error_to(
        &mut self,
        slot: usize,
        reply_to: u16,
        flags: u16,
        code: u32,
        data: &[u8],
    ) -> NetResult<()> {
        let reply = ErrorReply {
            code,
            data: data.to_vec(),
        };

        self.send_to(slot, &reply.assemble(reply_to, flags))
    }

    fn status_for(&self, slot: usize, online: bool) -> Option<ShipStatus> {
        let conn = self.ship(slot)?;

        Some(ShipStatus {
            ship_id: conn.key_idx,
            online,
            external: conn.external,
            internal: conn.internal,
            port: conn.port,
            flags: conn.flags,
            menu_code: conn.menu_code,
            name: conn.name.clone(),
        })
    }

    fn logged_in_slots(&self) -> Vec<usize> {
        (0..self.ships.len())
            .filter(|&slot| self.ship(slot).map(|conn| conn.key_set).unwrap_or(false))
            .collect()
    }

    /// Dispatches one complete packet from a ship. Errors out of here mark
    /// the connection for harvest at end-of-tick.
    pub fn handle_packet(&mut self, slot: usize, pkt: &[u8]) -> NetResult<()> {
        let header = peek_header(HeaderForm::Gate, pkt);

        logging::trace!(self.log, "hub packet";
                        "slot" => slot,
                        "opcode" => header.opcode,
                        "flags" => header.flags);

        match header.opcode {
            TYPE_LOGIN => {
                if header.flags & FLAG_RESPONSE == 0 {
                    logging::warn!(self.log, "ship sent a non-response login"; "slot" => slot);
                    return Err(NetError::Fatal(ErrorType::BadFrame));
                }

                self.handle_login(slot, pkt)
            }
            TYPE_COUNT => self.handle_count(slot, pkt),
            TYPE_DC => self.handle_dc(slot, pkt),
            TYPE_PC => self.handle_pc(slot, pkt),
            TYPE_PING => {
                if header.flags & FLAG_RESPONSE == 0 {
                    self.send_to(slot, &assemble_ping(true))
                } else {
                    // The receive path already refreshed last_message.
                    Ok(())
                }
            }
            TYPE_CDATA => self.handle_cdata(slot, pkt),
            TYPE_CREQ => self.handle_creq(slot, pkt),
            TYPE_GMLOGIN => self.handle_gmlogin(slot, pkt),
            TYPE_GCBAN | TYPE_IPBAN => self.handle_ban(slot, pkt, header.opcode),
            _ => Err(NetError::Fatal(ErrorType::BadFrame)),
        }
    }

    fn handle_login(&mut self, slot: usize, pkt: &[u8]) -> NetResult<()> {
        let login = ShipLogin::parse(pkt)?;

        if login.proto_ver < PROTO_VER_MINIMUM || login.proto_ver > PROTO_VER_MAXIMUM {
            logging::warn!(self.log, "invalid hub protocol version";
                           "slot" => slot,
                           "proto_ver" => login.proto_ver);
            self.send_error_to(
                slot,
                TYPE_LOGIN,
                FLAG_RESPONSE | FLAG_FAILURE,
                ERR_LOGIN_BAD_PROTO,
                &[],
            )?;
            self.disconnect_slot(slot);
            return Ok(());
        }

        let key_row = match self.backing.ship_key(login.key_idx) {
            Ok(row) => row,
            Err(err) => {
                logging::warn!(self.log, "key lookup failed"; "error" => %err);
                self.send_error_to(
                    slot,
                    TYPE_LOGIN,
                    FLAG_RESPONSE | FLAG_FAILURE,
                    ERR_BAD_ERROR,
                    &[],
                )?;
                self.disconnect_slot(slot);
                return Ok(());
            }
        };

        let key_row = match key_row {
            Some(row) => row,
            None => {
                logging::warn!(self.log, "unknown key index"; "key_idx" => login.key_idx);
                self.send_error_to(
                    slot,
                    TYPE_LOGIN,
                    FLAG_RESPONSE | FLAG_FAILURE,
                    ERR_LOGIN_BAD_KEY,
                    &[],
                )?;
                self.disconnect_slot(slot);
                return Ok(());
            }
        };

        if !menu_code_valid(login.menu_code) {
            logging::warn!(self.log, "bad menu code"; "key_idx" => login.key_idx);
            self.send_error_to(
                slot,
                TYPE_LOGIN,
                FLAG_RESPONSE | FLAG_FAILURE,
                ERR_LOGIN_BAD_MENU,
                &[],
            )?;
            self.disconnect_slot(slot);
            return Ok(());
        }

        if login.menu_code == 0 && !key_row.main_menu {
            logging::warn!(self.log, "ship not allowed on the main menu"; "key_idx" => login.key_idx);
            self.send_error_to(
                slot,
                TYPE_LOGIN,
                FLAG_RESPONSE | FLAG_FAILURE,
                ERR_LOGIN_INVAL_MENU,
                &[],
            )?;
            self.disconnect_slot(slot);
            return Ok(());
        }

        // Ship-to-hub traffic is keyed off the gate nonce, hub-to-ship off
        // the ship nonce.
        let (gate_nonce, ship_nonce) = {
            let conn = self.ship(slot).expect("Login for a vacated slot");
            (conn.gate_nonce, conn.ship_nonce)
        };

        let recv_key = derive_session_key(&key_row.rc4key, gate_nonce);
        let send_key = derive_session_key(&key_row.rc4key, ship_nonce);

        {
            let conn = self.ship_mut(slot).expect("Login for a vacated slot");
            conn.key_idx = login.key_idx;
            conn.proto_ver = login.proto_ver;
            conn.menu_code = login.menu_code;
            conn.flags = login.flags;
            conn.external = login.external;
            conn.internal = login.internal;
            conn.port = login.port;
            conn.clients = login.clients;
            conn.games = login.games;
            conn.name = login.name.clone();
        }

        let row = OnlineShipRow {
            ship_id: login.key_idx,
            name: login.name.clone(),
            players: login.clients,
            ip: login.external,
            port: login.port,
            int_ip: login.internal,
            gm_only: login.flags & SHIP_FLAG_GMONLY != 0,
            games: login.games,
            menu_code: login.menu_code,
        };

        if let Err(err) = self.backing.insert_online_ship(&row) {
            logging::warn!(self.log, "couldn't add ship to the online table";
                           "ship" => &login.name,
                           "error" => %err);
            self.send_error_to(
                slot,
                TYPE_LOGIN,
                FLAG_RESPONSE | FLAG_FAILURE,
                ERR_BAD_ERROR,
                &[],
            )?;
            self.disconnect_slot(slot);
            return Ok(());
        }

        // Announce the newcomer to the fleet and catch it up on everyone
        // already here. Its own copies still travel in the clear.
        let newcomer = self
            .status_for(slot, true)
            .expect("Status for a vacated slot")
            .assemble();

        for other in self.logged_in_slots() {
            self.send_to(other, &newcomer)?;
        }
        self.send_to(slot, &newcomer)?;

        for other in self.logged_in_slots() {
            if other != slot {
                let status = self
                    .status_for(other, true)
                    .expect("Status for a vacated slot")
                    .assemble();
                self.send_to(slot, &status)?;
            }
        }

        // The success acknowledgement is the last plaintext packet.
        self.send_error_to(slot, TYPE_LOGIN, FLAG_RESPONSE, ERR_NO_ERROR, &[])?;

        let conn = self.ship_mut(slot).expect("Login for a vacated slot");
        conn.session.install_ciphers(CipherPair {
            recv: Cipher::Rc4(Rc4Stream::new(&recv_key)),
            send: Cipher::Rc4(Rc4Stream::new(&send_key)),
        });
        conn.key_set = true;

        logging::info!(self.log, "ship logged in";
                       "ship" => &login.name,
                       "key_idx" => login.key_idx,
                       "clients" => login.clients,
                       "games" => login.games);

        Ok(())
    }

    fn handle_count(&mut self, slot: usize, pkt: &[u8]) -> NetResult<()> {
        let counts = Counts::parse(pkt)?;

        let key_idx = {
            let conn = match self.ship_mut(slot) {
                Some(conn) => conn,
                None => return Ok(()),
            };

            conn.clients = counts.clients;
            conn.games = counts.games;
            conn.key_idx
        };

        if let Err(err) = self
            .backing
            .update_ship_counts(key_idx, counts.clients, counts.games)
        {
            logging::warn!(self.log, "couldn't persist ship counters";
                           "key_idx" => key_idx,
                           "error" => %err);
        }

        let bcast = Counts {
            ship_id: key_idx,
            clients: counts.clients,
            games: counts.games,
        }
        .assemble();

        for other in self.logged_in_slots() {
            self.send_to(other, &bcast)?;
        }

        Ok(())
    }

    /// Console-family forward envelope: guild searches and simple mail fan
    /// out, guild replies unicast back to the ship named in the envelope.
    fn handle_dc(&mut self, slot: usize, pkt: &[u8]) -> NetResult<()> {
        let fw = Forward::parse(pkt)?;

        let origin_idx = match self.ship(slot) {
            Some(conn) => conn.key_idx,
            None => return Ok(()),
        };

        match fw.inner_opcode() {
            Some(SHIP_GUILD_SEARCH_TYPE) | Some(SHIP_SIMPLE_MAIL_TYPE) => {
                let out = Forward {
                    ship_id: u32::from(origin_idx),
                    inner: fw.inner,
                }
                .assemble(TYPE_DC);

                for other in self.logged_in_slots() {
                    if other == slot {
                        continue;
                    }

                    let proxy = self.ship(other).map(|conn| conn.is_proxy()).unwrap_or(true);

                    if !proxy {
                        self.send_to(other, &out)?;
                    }
                }

                Ok(())
            }
            Some(SHIP_DC_GUILD_REPLY_TYPE) => {
                let target = self
                    .logged_in_slots()
                    .into_iter()
                    .find(|&other| {
                        self.ship(other)
                            .map(|conn| u32::from(conn.key_idx) == fw.ship_id)
                            .unwrap_or(false)
                    });

                if let Some(target) = target {
                    let out = Forward {
                        ship_id: u32::from(origin_idx),
                        inner: fw.inner,
                    }
                    .assemble(TYPE_DC);

                    self.send_to(target, &out)?;
                }

                Ok(())
            }
            _ => {
                logging::debug!(self.log, "unknown inner opcode in forward";
                                "slot" => slot,
                                "opcode" => ?fw.inner_opcode());
                self.send_error_to(slot, TYPE_DC, FLAG_FAILURE, ERR_GAME_UNK_PACKET, pkt)
            }
        }
    }

    /// Handheld-family forward envelope: only simple mail crosses ships.
    fn handle_pc(&mut self, slot: usize, pkt: &[u8]) -> NetResult<()> {
        let fw = Forward::parse(pkt)?;

        let origin_idx = match self.ship(slot) {
            Some(conn) => conn.key_idx,
            None => return Ok(()),
        };

        match fw.inner_opcode() {
            Some(SHIP_SIMPLE_MAIL_TYPE) => {
                let out = Forward {
                    ship_id: u32::from(origin_idx),
                    inner: fw.inner,
                }
                .assemble(TYPE_PC);

                for other in self.logged_in_slots() {
                    if other == slot {
                        continue;
                    }

                    let proxy = self.ship(other).map(|conn| conn.is_proxy()).unwrap_or(true);

                    if !proxy {
                        self.send_to(other, &out)?;
                    }
                }

                Ok(())
            }
            _ => self.send_error_to(slot, TYPE_PC, FLAG_FAILURE, ERR_GAME_UNK_PACKET, pkt),
        }
    }

    fn handle_cdata(&mut self, slot: usize, pkt: &[u8]) -> NetResult<()> {
        let cdata = CharData::parse(pkt)?;
        let ack_data = &pkt[ACK_DATA_RANGE];

        if let Err(err) = self
            .backing
            .store_character(cdata.guildcard, cdata.slot, &cdata.data)
        {
            logging::warn!(self.log, "couldn't save character data";
                           "guildcard" => cdata.guildcard,
                           "slot" => cdata.slot,
                           "error" => %err);

            return self.send_error_to(
                slot,
                TYPE_CDATA,
                FLAG_RESPONSE | FLAG_FAILURE,
                ERR_BAD_ERROR,
                ack_data,
            );
        }

        self.send_error_to(slot, TYPE_CDATA, FLAG_RESPONSE, ERR_NO_ERROR, ack_data)
    }

    fn handle_creq(&mut self, slot: usize, pkt: &[u8]) -> NetResult<()> {
        let req = CharReq::parse(pkt)?;
        let ack_data = &pkt[ACK_DATA_RANGE];

        let data = match self.backing.fetch_character(req.guildcard, req.slot) {
            Ok(data) => data,
            Err(err) => {
                logging::warn!(self.log, "couldn't fetch character data";
                               "guildcard" => req.guildcard,
                               "slot" => req.slot,
                               "error" => %err);

                return self.send_error_to(
                    slot,
                    TYPE_CREQ,
                    FLAG_RESPONSE | FLAG_FAILURE,
                    ERR_BAD_ERROR,
                    ack_data,
                );
            }
        };

        match data {
            Some(data) => {
                let reply = CharData {
                    guildcard: req.guildcard,
                    slot: req.slot,
                    data,
                };

                self.send_to(slot, &reply.assemble(FLAG_RESPONSE))
            }
            None => self.send_error_to(
                slot,
                TYPE_CREQ,
                FLAG_RESPONSE | FLAG_FAILURE,
                ERR_CREQ_NO_DATA,
                ack_data,
            ),
        }
    }

    fn handle_gmlogin(&mut self, slot: usize, pkt: &[u8]) -> NetResult<()> {
        let req = GmLogin::parse(pkt)?;
        let ack_data = &pkt[ACK_DATA_RANGE];

        let account_id = match self.backing.account_id_for_guildcard(req.guildcard) {
            Ok(Some(id)) => id,
            Ok(None) => {
                logging::debug!(self.log, "GM login for unknown guildcard";
                                "guildcard" => req.guildcard);
                return self.send_error_to(
                    slot,
                    TYPE_GMLOGIN,
                    FLAG_FAILURE,
                    ERR_GMLOGIN_NO_ACC,
                    ack_data,
                );
            }
            Err(err) => {
                logging::warn!(self.log, "account lookup failed"; "error" => %err);
                return self.send_error_to(slot, TYPE_GMLOGIN, FLAG_FAILURE, ERR_BAD_ERROR, ack_data);
            }
        };

        let account = match self.backing.gm_account(account_id, &req.username) {
            Ok(Some(account)) => account,
            Ok(None) => {
                logging::info!(self.log, "failed GM login, not a GM";
                               "username" => &req.username,
                               "account_id" => account_id);
                return self.send_error_to(
                    slot,
                    TYPE_GMLOGIN,
                    FLAG_FAILURE,
                    ERR_GMLOGIN_NOT_GM,
                    ack_data,
                );
            }
            Err(err) => {
                logging::warn!(self.log, "GM lookup failed"; "error" => %err);
                return self.send_error_to(slot, TYPE_GMLOGIN, FLAG_FAILURE, ERR_BAD_ERROR, ack_data);
            }
        };

        let expected = password_hash(&req.password, &account.regtime);

        if account.password.to_lowercase() != expected {
            logging::info!(self.log, "failed GM login, bad password"; "account_id" => account_id);
            return self.send_error_to(slot, TYPE_GMLOGIN, FLAG_FAILURE, ERR_BAD_ERROR, ack_data);
        }

        let privilege = Privilege::from_bits_truncate(account.privlevel);

        if !privilege.is_sane() {
            logging::warn!(self.log, "nonsensical privileges on account";
                           "account_id" => account_id,
                           "privlevel" => account.privlevel);
            return self.send_error_to(slot, TYPE_GMLOGIN, FLAG_FAILURE, ERR_BAD_ERROR, ack_data);
        }

        let reply = GmReply {
            guildcard: req.guildcard,
            block: req.block,
            allowed: true,
            privilege: account.privlevel as u8,
        };

        self.send_to(slot, &reply.assemble())
    }

    fn handle_ban(&mut self, slot: usize, pkt: &[u8], ban_type: u16) -> NetResult<()> {
        let req = BanReq::parse(pkt)?;
        let ack_data = &pkt[ACK_DATA_RANGE];

        let requester = match self.backing.privlevel_for_guildcard(req.req_gc) {
            Ok(level) => level,
            Err(err) => {
                logging::warn!(self.log, "requester lookup failed"; "error" => %err);
                return self.send_error_to(slot, ban_type, FLAG_FAILURE, ERR_BAD_ERROR, ack_data);
            }
        };

        match requester {
            Some(level) if level > 2 => (),
            _ => {
                logging::info!(self.log, "ban request from non-GM"; "guildcard" => req.req_gc);
                return self.send_error_to(slot, ban_type, FLAG_FAILURE, ERR_BAN_NOT_GM, ack_data);
            }
        }

        let setby = self
            .backing
            .account_id_for_guildcard(req.req_gc)
            .unwrap_or(None)
            .unwrap_or(0);

        let ban_id = match self
            .backing
            .insert_ban(u64::from(req.until), setby, &req.reason)
        {
            Ok(id) => id,
            Err(err) => {
                logging::warn!(self.log, "couldn't insert ban"; "error" => %err);
                return self.send_error_to(slot, ban_type, FLAG_FAILURE, ERR_BAD_ERROR, ack_data);
            }
        };

        let joined = match ban_type {
            TYPE_GCBAN => self.backing.insert_guildcard_ban(ban_id, req.target),
            TYPE_IPBAN => self
                .backing
                .insert_ip_ban(ban_id, Ipv4Addr::from(req.target)),
            _ => {
                return self.send_error_to(slot, ban_type, FLAG_FAILURE, ERR_BAN_BAD_TYPE, ack_data)
            }
        };

        if let Err(err) = joined {
            logging::warn!(self.log, "couldn't insert ban joining row"; "error" => %err);
            return self.send_error_to(slot, ban_type, FLAG_FAILURE, ERR_BAD_ERROR, ack_data);
        }

        self.send_error_to(slot, ban_type, FLAG_RESPONSE, ERR_NO_ERROR, ack_data)
    }

    /// Runs the accept/dispatch loop forever.
    pub fn run(&mut self) -> NetResult<()> {
        loop {
            let ready = self.endpoint.poll(POLL_TIMEOUT)?;
            let now = Instant::now();

            for readiness in ready {
                match readiness {
                    Readiness::Accept { listener } => {
                        while let Some((stream, peer)) = self.endpoint.accept(listener)? {
                            logging::info!(self.log, "accepted ship connection"; "peer" => %peer);

                            let session = Session::open(HeaderForm::Gate, stream, peer);
                            let slot = self.attach(session);

                            let conn = self.ship(slot).expect("Attached ship vanished");
                            if self.endpoint.register_session(slot, &conn.session).has_failed() {
                                self.disconnect_slot(slot);
                            }
                        }
                    }
                    Readiness::Session {
                        slot,
                        readable,
                        writable,
                    } => {
                        if readable {
                            self.service_ship(slot, now);
                        }

                        if writable {
                            self.flush_slot(slot);
                        }
                    }
                }
            }

            for slot in 0..self.ships.len() {
                self.flush_slot(slot);
            }

            self.housekeeping(now);
            self.harvest();
        }
    }

    fn service_ship(&mut self, slot: usize, now: Instant) {
        let received = match self.ship_mut(slot) {
            Some(conn) => conn.session.receive(now),
            None => return,
        };

        if received.has_failed() {
            self.disconnect_slot(slot);
            return;
        }

        loop {
            let pkt = match self.ship_mut(slot) {
                Some(conn) => match conn.session.next_packet() {
                    Ok(pkt) => pkt,
                    Err(NetError::Wait) => break,
                    Err(_) => {
                        self.disconnect_slot(slot);
                        break;
                    }
                },
                None => break,
            };

            if self.handle_packet(slot, &pkt).has_failed() {
                self.disconnect_slot(slot);
                break;
            }

            let gone = self
                .ship(slot)
                .map(|conn| conn.session.is_disconnected())
                .unwrap_or(true);

            if gone {
                break;
            }
        }
    }

    fn flush_slot(&mut self, slot: usize) {
        let flushed = match self.ship_mut(slot) {
            Some(conn) if conn.session.is_attached() && conn.session.has_pending() => {
                conn.session.flush()
            }
            _ => return,
        };

        if flushed.has_failed() {
            self.disconnect_slot(slot);
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        for slot in 0..self.ships.len() {
            let action = match self.ship_mut(slot) {
                Some(conn) if conn.key_set => {
                    if conn.session.last_message_elapsed(now) >= DEAD_INTERVAL {
                        Some(true)
                    } else if conn.session.last_message_elapsed(now) >= PING_INTERVAL
                        && now.duration_since(conn.last_ping) >= PING_INTERVAL
                    {
                        conn.last_ping = now;
                        Some(false)
                    } else {
                        None
                    }
                }
                _ => None,
            };

            match action {
                Some(true) => {
                    logging::warn!(self.log, "dropping unresponsive ship"; "slot" => slot);
                    self.disconnect_slot(slot);
                }
                Some(false) => {
                    drop(self.send_to(slot, &assemble_ping(false)));
                }
                None => (),
            }
        }
    }

    /// End-of-tick disconnect harvest: collect first, remove after.
    pub fn harvest(&mut self) {
        let doomed: Vec<usize> = (0..self.ships.len())
            .filter(|&slot| {
                self.ship(slot)
                    .map(|conn| conn.session.is_disconnected())
                    .unwrap_or(false)
            })
            .collect();

        for slot in doomed {
            let mut conn = match self.ships[slot].take() {
                Some(conn) => conn,
                None => continue,
            };

            self.free.push(slot);

            if conn.session.is_attached() {
                // Best-effort delivery of any queued error reply.
                drop(conn.session.flush());
                drop(self.endpoint.deregister_session(&conn.session));
            }

            if !conn.key_set {
                continue;
            }

            logging::info!(self.log, "closing connection with ship"; "ship" => &conn.name);

            let status = ShipStatus {
                ship_id: conn.key_idx,
                online: false,
                external: conn.external,
                internal: conn.internal,
                port: conn.port,
                flags: conn.flags,
                menu_code: conn.menu_code,
                name: conn.name.clone(),
            }
            .assemble();

            for other in self.logged_in_slots() {
                drop(self.send_to(other, &status));
            }

            if let Err(err) = self.backing.remove_online_ship(conn.key_idx) {
                logging::error!(self.log, "couldn't clear ship from the online table";
                                "ship" => &conn.name,
                                "error" => %err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel::crypto::password_hash;
    use ledger::{AccountRow, MemoryBacking, ShipKeyRow};

    const KEY_IDX: u16 = 7;
    const KEY_MATERIAL: [u8; 128] = [0x42; 128];

    fn test_logger() -> Logger {
        Logger::root(logging::Discard, logging::o!())
    }

    fn seeded_backing() -> Arc<MemoryBacking> {
        let backing = MemoryBacking::new();

        backing.add_ship_key(ShipKeyRow {
            idx: KEY_IDX,
            rc4key: KEY_MATERIAL,
            main_menu: true,
        });
        backing.add_ship_key(ShipKeyRow {
            idx: KEY_IDX + 1,
            rc4key: KEY_MATERIAL,
            main_menu: true,
        });
        backing.add_ship_key(ShipKeyRow {
            idx: KEY_IDX + 2,
            rc4key: KEY_MATERIAL,
            main_menu: true,
        });

        backing
            .add_account(AccountRow {
                account_id: 10,
                username: "operator".to_string(),
                password: password_hash("p", "1234"),
                regtime: "1234".to_string(),
                privlevel: 3,
            });
        backing.add_guildcard(42, 10);

        Arc::new(backing)
    }

    fn make_server(backing: Arc<MemoryBacking>) -> GateServer {
        GateServer::new(GateConfig::default(), backing, &test_logger()).unwrap()
    }

    fn split_packets(mut bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();

        while bytes.len() >= 8 {
            let header = HeaderForm::Gate.parse(&bytes[..8]);
            let len = HeaderForm::Gate.padded_len(header.len);

            out.push(bytes[..len].to_vec());
            bytes = &bytes[len..];
        }

        out
    }

    fn login_packet(key_idx: u16, menu_code: u16, flags: u32) -> Vec<u8> {
        ShipLogin {
            proto_ver: PROTO_VER_CURRENT,
            key_idx,
            menu_code,
            flags,
            external: Ipv4Addr::new(203, 0, 113, 7),
            internal: Ipv4Addr::new(10, 0, 0, 10),
            port: 12000,
            clients: 0,
            games: 0,
            name: format!("TestShip{}", key_idx),
        }
        .assemble()
    }

    /// A connected test ship: tracks the slot plus the RC4 stream that
    /// decrypts hub-to-ship traffic (stateful, so it lives across drains).
    struct TestShip {
        slot: usize,
        rc4: Rc4Stream,
    }

    impl TestShip {
        fn drain(&mut self, server: &mut GateServer) -> Vec<Vec<u8>> {
            let mut raw = server
                .ship_mut(self.slot)
                .expect("Test ship vanished")
                .session
                .drain_pending();

            self.rc4.apply(&mut raw);
            split_packets(&raw)
        }
    }

    /// Attach and fully log in one test ship, draining the plaintext phase.
    fn login_ship(server: &mut GateServer, key_idx: u16, flags: u32) -> TestShip {
        let slot = server.attach(Session::new(HeaderForm::Gate));

        // Drop the welcome.
        server.ship_mut(slot).unwrap().session.drain_pending();

        server
            .handle_packet(slot, &login_packet(key_idx, 0, flags))
            .unwrap();

        let ship_nonce = server.ship(slot).unwrap().ship_nonce;

        // Drop the plaintext statuses + ack.
        server.ship_mut(slot).unwrap().session.drain_pending();

        assert!(server.ship(slot).unwrap().key_set);

        TestShip {
            slot,
            rc4: Rc4Stream::new(&derive_session_key(&KEY_MATERIAL, ship_nonce)),
        }
    }

    fn first_error_reply(packets: &[Vec<u8>], reply_to: u16) -> Option<(u16, ErrorReply)> {
        packets
            .iter()
            .map(|pkt| (peek_header(HeaderForm::Gate, pkt), pkt))
            .find(|(header, _)| header.opcode == reply_to)
            .map(|(header, pkt)| (header.flags, ErrorReply::parse(pkt).unwrap()))
    }

    #[test]
    fn test_welcome_carries_fresh_nonces() {
        let mut server = make_server(seeded_backing());

        let a = server.attach(Session::new(HeaderForm::Gate));
        let b = server.attach(Session::new(HeaderForm::Gate));

        let raw = server.ship_mut(a).unwrap().session.drain_pending();
        let welcome = Welcome::parse(&raw).unwrap();

        assert_eq!(welcome.gate_nonce, server.ship(a).unwrap().gate_nonce);
        assert_eq!(welcome.ship_nonce, server.ship(a).unwrap().ship_nonce);

        // Two connections never share nonce material.
        assert_ne!(
            server.ship(a).unwrap().gate_nonce,
            server.ship(b).unwrap().gate_nonce
        );
    }

    #[test]
    fn test_login_success_registers_ship() {
        let backing = seeded_backing();
        let mut server = make_server(backing.clone());

        let slot = server.attach(Session::new(HeaderForm::Gate));
        server.ship_mut(slot).unwrap().session.drain_pending();

        server
            .handle_packet(slot, &login_packet(KEY_IDX, 0, 0))
            .unwrap();

        assert!(server.ship(slot).unwrap().key_set);

        // Exactly one matching row in the online table.
        let ships = backing.online_ships().unwrap();
        assert_eq!(ships.len(), 1);
        assert_eq!(ships[0].ship_id, KEY_IDX);
        assert_eq!(ships[0].name, "TestShip7");
        assert_eq!(ships[0].port, 12000);

        // The plaintext tail: our own status plus the success ack.
        let packets = split_packets(&server.ship_mut(slot).unwrap().session.drain_pending());

        let status = packets
            .iter()
            .find(|pkt| peek_header(HeaderForm::Gate, pkt).opcode == TYPE_STATUS)
            .expect("No status broadcast");
        let status = ShipStatus::parse(status).unwrap();
        assert_eq!(status.ship_id, KEY_IDX);
        assert!(status.online);

        let (flags, ack) = first_error_reply(&packets, TYPE_LOGIN).expect("No login ack");
        assert_eq!(flags, FLAG_RESPONSE);
        assert_eq!(ack.code, ERR_NO_ERROR);
    }

    #[test]
    fn test_login_bad_proto_rejected() {
        let mut server = make_server(seeded_backing());

        let slot = server.attach(Session::new(HeaderForm::Gate));
        server.ship_mut(slot).unwrap().session.drain_pending();

        let mut login = ShipLogin::parse(&login_packet(KEY_IDX, 0, 0)).unwrap();
        login.proto_ver = PROTO_VER_MAXIMUM + 1;

        server.handle_packet(slot, &login.assemble()).unwrap();

        let packets = split_packets(&server.ship_mut(slot).unwrap().session.drain_pending());
        let (flags, reply) = first_error_reply(&packets, TYPE_LOGIN).unwrap();

        assert_eq!(flags, FLAG_RESPONSE | FLAG_FAILURE);
        assert_eq!(reply.code, ERR_LOGIN_BAD_PROTO);
        assert!(server.ship(slot).unwrap().session.is_disconnected());
    }

    #[test]
    fn test_login_unknown_key_rejected() {
        let mut server = make_server(seeded_backing());

        let slot = server.attach(Session::new(HeaderForm::Gate));
        server.ship_mut(slot).unwrap().session.drain_pending();

        server.handle_packet(slot, &login_packet(999, 0, 0)).unwrap();

        let packets = split_packets(&server.ship_mut(slot).unwrap().session.drain_pending());
        let (_, reply) = first_error_reply(&packets, TYPE_LOGIN).unwrap();

        assert_eq!(reply.code, ERR_LOGIN_BAD_KEY);
    }

    #[test]
    fn test_login_menu_code_checks() {
        let backing = seeded_backing();
        backing.add_ship_key(ShipKeyRow {
            idx: 50,
            rc4key: KEY_MATERIAL,
            main_menu: false,
        });

        let mut server = make_server(backing);

        // Non-alphabetic menu code.
        let slot = server.attach(Session::new(HeaderForm::Gate));
        server.ship_mut(slot).unwrap().session.drain_pending();
        server
            .handle_packet(slot, &login_packet(KEY_IDX, 0x0031, 0))
            .unwrap();

        let packets = split_packets(&server.ship_mut(slot).unwrap().session.drain_pending());
        assert_eq!(
            first_error_reply(&packets, TYPE_LOGIN).unwrap().1.code,
            ERR_LOGIN_BAD_MENU
        );

        // Main menu requested by a ship that isn't allowed there.
        let slot = server.attach(Session::new(HeaderForm::Gate));
        server.ship_mut(slot).unwrap().session.drain_pending();
        server.handle_packet(slot, &login_packet(50, 0, 0)).unwrap();

        let packets = split_packets(&server.ship_mut(slot).unwrap().session.drain_pending());
        assert_eq!(
            first_error_reply(&packets, TYPE_LOGIN).unwrap().1.code,
            ERR_LOGIN_INVAL_MENU
        );
    }

    #[test]
    fn test_traffic_encrypted_after_login() {
        let mut server = make_server(seeded_backing());
        let mut ship = login_ship(&mut server, KEY_IDX, 0);

        // A ping request gets a reply, enciphered with the ship-nonce key.
        server
            .handle_packet(ship.slot, &assemble_ping(false))
            .unwrap();

        let raw = server
            .ship(ship.slot)
            .unwrap()
            .session
            .has_pending();
        assert!(raw);

        let packets = ship.drain(&mut server);

        assert_eq!(packets.len(), 1);
        let header = peek_header(HeaderForm::Gate, &packets[0]);
        assert_eq!(header.opcode, TYPE_PING);
        assert_eq!(header.flags, FLAG_RESPONSE);
    }

    #[test]
    fn test_count_update_persists_and_rebroadcasts() {
        let backing = seeded_backing();
        let mut server = make_server(backing.clone());

        let mut first = login_ship(&mut server, KEY_IDX, 0);
        let mut second = login_ship(&mut server, KEY_IDX + 1, 0);

        // The first ship saw the second one's status arrive encrypted.
        let packets = first.drain(&mut server);
        assert!(packets
            .iter()
            .any(|pkt| peek_header(HeaderForm::Gate, pkt).opcode == TYPE_STATUS));

        let counts = Counts {
            ship_id: 0,
            clients: 55,
            games: 7,
        };
        server.handle_packet(first.slot, &counts.assemble()).unwrap();

        let ships = backing.online_ships().unwrap();
        let row = ships.iter().find(|row| row.ship_id == KEY_IDX).unwrap();
        assert_eq!(row.players, 55);
        assert_eq!(row.games, 7);

        // Both ships hear about it, tagged with the sender's real id.
        for ship in [&mut first, &mut second].iter_mut() {
            let packets = ship.drain(&mut server);
            let count_pkt = packets
                .iter()
                .find(|pkt| peek_header(HeaderForm::Gate, pkt).opcode == TYPE_COUNT)
                .expect("No counter broadcast");

            let parsed = Counts::parse(count_pkt).unwrap();
            assert_eq!(parsed.ship_id, KEY_IDX);
            assert_eq!(parsed.clients, 55);
        }
    }

    #[test]
    fn test_forward_fanout_skips_origin_and_proxies() {
        let mut server = make_server(seeded_backing());

        let mut origin = login_ship(&mut server, KEY_IDX, 0);
        let mut plain = login_ship(&mut server, KEY_IDX + 1, 0);
        let mut proxy = login_ship(&mut server, KEY_IDX + 2, SHIP_FLAG_PROXY);

        // Clear the status chatter from the logins.
        origin.drain(&mut server);
        plain.drain(&mut server);
        proxy.drain(&mut server);

        let mail = Forward {
            ship_id: 0,
            inner: vec![SHIP_SIMPLE_MAIL_TYPE, 0, 0x08, 0x00, 1, 2, 3, 4],
        };
        server
            .handle_packet(origin.slot, &mail.assemble(TYPE_DC))
            .unwrap();

        let delivered = plain.drain(&mut server);
        assert_eq!(delivered.len(), 1);

        let fw = Forward::parse(&delivered[0]).unwrap();
        assert_eq!(fw.ship_id, u32::from(KEY_IDX));
        assert_eq!(fw.inner_opcode(), Some(SHIP_SIMPLE_MAIL_TYPE));

        assert!(proxy.drain(&mut server).is_empty());
        assert!(origin.drain(&mut server).is_empty());
    }

    #[test]
    fn test_guild_reply_unicasts_to_named_ship() {
        let mut server = make_server(seeded_backing());

        let mut origin = login_ship(&mut server, KEY_IDX, 0);
        let mut target = login_ship(&mut server, KEY_IDX + 1, 0);
        let mut other = login_ship(&mut server, KEY_IDX + 2, 0);

        origin.drain(&mut server);
        target.drain(&mut server);
        other.drain(&mut server);

        let reply = Forward {
            ship_id: u32::from(KEY_IDX + 1),
            inner: vec![SHIP_DC_GUILD_REPLY_TYPE, 0, 0x08, 0x00, 9, 9, 9, 9],
        };
        server
            .handle_packet(origin.slot, &reply.assemble(TYPE_DC))
            .unwrap();

        let delivered = target.drain(&mut server);
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            Forward::parse(&delivered[0]).unwrap().inner_opcode(),
            Some(SHIP_DC_GUILD_REPLY_TYPE)
        );

        assert!(other.drain(&mut server).is_empty());
    }

    #[test]
    fn test_forward_unknown_opcode_warns_origin() {
        let mut server = make_server(seeded_backing());

        let mut origin = login_ship(&mut server, KEY_IDX, 0);
        let mut other = login_ship(&mut server, KEY_IDX + 1, 0);

        origin.drain(&mut server);
        other.drain(&mut server);

        let bogus = Forward {
            ship_id: 0,
            inner: vec![0xEE, 0, 0x08, 0x00, 0, 0, 0, 0],
        };
        server
            .handle_packet(origin.slot, &bogus.assemble(TYPE_DC))
            .unwrap();

        let packets = origin.drain(&mut server);
        let (flags, reply) = first_error_reply(&packets, TYPE_DC).unwrap();

        assert_eq!(flags, FLAG_FAILURE);
        assert_eq!(reply.code, ERR_GAME_UNK_PACKET);

        // Dropped silently for everyone else.
        assert!(other.drain(&mut server).is_empty());
    }

    #[test]
    fn test_character_backup_roundtrip() {
        let mut server = make_server(seeded_backing());
        let mut ship = login_ship(&mut server, KEY_IDX, 0);

        let blob: Vec<u8> = (0..CHAR_DATA_SIZE).map(|i| (i * 3) as u8).collect();

        let store = CharData {
            guildcard: 42,
            slot: 1,
            data: blob.clone(),
        };
        server
            .handle_packet(ship.slot, &store.assemble(0))
            .unwrap();

        let packets = ship.drain(&mut server);
        let (flags, ack) = first_error_reply(&packets, TYPE_CDATA).unwrap();
        assert_eq!(flags, FLAG_RESPONSE);
        assert_eq!(ack.code, ERR_NO_ERROR);

        let req = CharReq {
            guildcard: 42,
            slot: 1,
        };
        server.handle_packet(ship.slot, &req.assemble()).unwrap();

        let packets = ship.drain(&mut server);
        let reply = CharData::parse(&packets[0]).unwrap();

        assert_eq!(reply.guildcard, 42);
        assert_eq!(reply.slot, 1);
        assert_eq!(reply.data, blob);
    }

    #[test]
    fn test_character_request_missing_slot() {
        let mut server = make_server(seeded_backing());
        let mut ship = login_ship(&mut server, KEY_IDX, 0);

        let req = CharReq {
            guildcard: 42,
            slot: 3,
        };
        server.handle_packet(ship.slot, &req.assemble()).unwrap();

        let packets = ship.drain(&mut server);
        let (_, reply) = first_error_reply(&packets, TYPE_CREQ).unwrap();

        assert_eq!(reply.code, ERR_CREQ_NO_DATA);
    }

    #[test]
    fn test_gm_login_success() {
        let mut server = make_server(seeded_backing());
        let mut ship = login_ship(&mut server, KEY_IDX, 0);

        let req = GmLogin {
            guildcard: 42,
            block: 2,
            username: "operator".to_string(),
            password: "p".to_string(),
        };
        server.handle_packet(ship.slot, &req.assemble()).unwrap();

        let packets = ship.drain(&mut server);
        let reply = GmReply::parse(&packets[0]).unwrap();

        assert!(reply.allowed);
        assert_eq!(reply.privilege, 3);
        assert_eq!(reply.guildcard, 42);
        assert_eq!(reply.block, 2);
    }

    #[test]
    fn test_gm_login_wrong_password() {
        let mut server = make_server(seeded_backing());
        let mut ship = login_ship(&mut server, KEY_IDX, 0);

        let req = GmLogin {
            guildcard: 42,
            block: 2,
            username: "operator".to_string(),
            password: "wrong".to_string(),
        };
        server.handle_packet(ship.slot, &req.assemble()).unwrap();

        let packets = ship.drain(&mut server);
        let (flags, reply) = first_error_reply(&packets, TYPE_GMLOGIN).unwrap();

        assert_eq!(flags, FLAG_FAILURE);
        assert_eq!(reply.code, ERR_BAD_ERROR);
    }

    #[test]
    fn test_ban_requires_privilege() {
        let backing = seeded_backing();

        // An unprivileged account with its own guildcard.
        backing.add_account(AccountRow {
            account_id: 11,
            username: "pleb".to_string(),
            password: password_hash("x", "1"),
            regtime: "1".to_string(),
            privlevel: 1,
        });
        backing.add_guildcard(43, 11);

        let mut server = make_server(backing.clone());
        let mut ship = login_ship(&mut server, KEY_IDX, 0);

        let req = BanReq {
            req_gc: 43,
            target: 77,
            until: 0,
            reason: "nope".to_string(),
        };
        server
            .handle_packet(ship.slot, &req.assemble(TYPE_GCBAN))
            .unwrap();

        let packets = ship.drain(&mut server);
        assert_eq!(
            first_error_reply(&packets, TYPE_GCBAN).unwrap().1.code,
            ERR_BAN_NOT_GM
        );
        assert!(!backing.guildcard_banned(77, 100).unwrap());
    }

    #[test]
    fn test_ban_inserts_joining_rows() {
        let backing = seeded_backing();
        let mut server = make_server(backing.clone());
        let mut ship = login_ship(&mut server, KEY_IDX, 0);

        let req = BanReq {
            req_gc: 42,
            target: 77,
            until: 0,
            reason: "rmt spam".to_string(),
        };
        server
            .handle_packet(ship.slot, &req.assemble(TYPE_GCBAN))
            .unwrap();

        let packets = ship.drain(&mut server);
        assert_eq!(
            first_error_reply(&packets, TYPE_GCBAN).unwrap().1.code,
            ERR_NO_ERROR
        );
        assert!(backing.guildcard_banned(77, 100).unwrap());

        let ip_req = BanReq {
            req_gc: 42,
            target: u32::from(Ipv4Addr::new(198, 51, 100, 9)),
            until: 0,
            reason: "rmt spam".to_string(),
        };
        server
            .handle_packet(ship.slot, &ip_req.assemble(TYPE_IPBAN))
            .unwrap();

        assert!(backing
            .ip_banned(Ipv4Addr::new(198, 51, 100, 9), 100)
            .unwrap());
    }

    #[test]
    fn test_disconnect_clears_online_row_and_notifies_fleet() {
        let backing = seeded_backing();
        let mut server = make_server(backing.clone());

        let first = login_ship(&mut server, KEY_IDX, 0);
        let mut second = login_ship(&mut server, KEY_IDX + 1, 0);
        second.drain(&mut server);

        // The in-memory fleet and the online table agree.
        assert_eq!(backing.online_ships().unwrap().len(), 2);

        server
            .ship_mut(first.slot)
            .unwrap()
            .session
            .mark_disconnected();
        server.harvest();

        assert!(server.ship(first.slot).is_none());
        let ships = backing.online_ships().unwrap();
        assert_eq!(ships.len(), 1);
        assert_eq!(ships[0].ship_id, KEY_IDX + 1);

        // The survivor hears the offline status.
        let packets = second.drain(&mut server);
        let status = packets
            .iter()
            .find_map(|pkt| {
                let header = peek_header(HeaderForm::Gate, pkt);
                if header.opcode == TYPE_STATUS {
                    ShipStatus::parse(pkt).ok()
                } else {
                    None
                }
            })
            .expect("No offline status");

        assert_eq!(status.ship_id, KEY_IDX);
        assert!(!status.online);
    }
}
