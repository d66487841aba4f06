use crate::client::{LoginClient, LoginState};
use crate::config::LoginConfig;
use crate::packets::*;
use keel::addr::resolve;
use keel::crypto::{Cipher, GcCipher, PcCipher};
use keel::logging::{self, Logger};
use keel::time::timestamp_secs;
use keel::version::{CipherFamily, ClientVersion, LOGIN_PORTS, PORT_WEB};
use ledger::Backing;
use moor::endpoint::{Endpoint, Readiness};
use moor::error::{ErrorUtils, NetError, NetResult};
use moor::header::CLIENT_HEADER_SIZE;
use moor::session::{CipherPair, Session};
use rand::RngCore;
use rand_mt::Mt;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// What a listener index stands for.
#[derive(Debug, Copy, Clone)]
enum ListenerTag {
    Game(ClientVersion),
    Web,
}

/// The login daemon: authenticates arriving clients and redirects them to a
/// ship. Single-threaded cooperative, one readiness loop.
pub struct LoginServer {
    endpoint: Endpoint,
    config: LoginConfig,
    backing: Arc<dyn Backing>,

    clients: Vec<Option<LoginClient>>,
    free: Vec<usize>,
    listeners: Vec<ListenerTag>,

    seed_rng: Mt,
    log: Logger,
}

impl LoginServer {
    pub fn new(
        config: LoginConfig,
        backing: Arc<dyn Backing>,
        log: &Logger,
    ) -> NetResult<LoginServer> {
        Ok(LoginServer {
            endpoint: Endpoint::new()?,
            config,
            backing,
            clients: Vec::new(),
            free: Vec::new(),
            listeners: Vec::new(),
            seed_rng: Mt::new(rand::random::<u32>()),
            log: log.new(logging::o!()),
        })
    }

    /// Binds the per-variant listeners and the web counter port. The
    /// variant a client runs is inferred from which listener accepted it.
    pub fn bind(&mut self) -> NetResult<()> {
        for &port in LOGIN_PORTS.iter() {
            let version = ClientVersion::for_login_port(port)
                .expect("Login port table out of sync with the variant map");

            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let listener = self.endpoint.add_listener(&addr)?;

            debug_assert_eq!(listener, self.listeners.len());
            self.listeners.push(ListenerTag::Game(version));

            logging::info!(self.log, "listening"; "port" => port, "variant" => ?version);
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], PORT_WEB));
        let listener = self.endpoint.add_listener(&addr)?;

        debug_assert_eq!(listener, self.listeners.len());
        self.listeners.push(ListenerTag::Web);

        logging::info!(self.log, "listening"; "port" => PORT_WEB, "variant" => "web");
        Ok(())
    }

    /// Connected clients right now; the web port reports this.
    pub fn client_count(&self) -> u32 {
        self.clients.iter().filter(|slot| slot.is_some()).count() as u32
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

    /// Installs a new client: queues the plaintext welcome carrying both
    /// cipher seeds, then arms the ciphers for everything that follows.
    pub fn attach(&mut self, session: Session, version: ClientVersion, addr: Ipv4Addr) -> usize {
        let mut client = LoginClient::new(session, version, addr);

        let server_seed = self.seed_rng.next_u32();
        let client_seed = self.seed_rng.next_u32();

        let welcome = Welcome {
            server_seed,
            client_seed,
        };
        drop(client.session.queue_plain(&welcome.assemble(client.session.form())));

        client
            .session
            .install_ciphers(Self::cipher_pair(version, server_seed, client_seed));

        match self.free.pop() {
            Some(slot) => {
                self.clients[slot] = Some(client);
                slot
            }
            None => {
                self.clients.push(Some(client));
                self.clients.len() - 1
            }
        }
    }

    pub fn client(&self, slot: usize) -> Option<&LoginClient> {
        self.clients.get(slot).and_then(|client| client.as_ref())
    }

    pub fn client_mut(&mut self, slot: usize) -> Option<&mut LoginClient> {
        self.clients.get_mut(slot).and_then(|client| client.as_mut())
    }

    fn reject(&mut self, slot: usize, status: u32) -> NetResult<()> {
        let client = match self.client_mut(slot) {
            Some(client) => client,
            None => return Ok(()),
        };

        let form = client.session.form();
        client.session.queue_packet(&assemble_login_reply(form, status))?;
        client.session.mark_disconnected();

        Ok(())
    }

    /// Dispatches one complete, deciphered packet.
    pub fn handle_packet(&mut self, slot: usize, pkt: &[u8]) -> NetResult<()> {
        let client = match self.client(slot) {
            Some(client) => client,
            None => return Ok(()),
        };

        let header = client.session.form().parse(&pkt[..CLIENT_HEADER_SIZE]);

        match header.opcode {
            TYPE_LOGIN => self.handle_login(slot, pkt),
            // Menu traffic and everything else is out of a login server's
            // scope; clients get their redirect and move on.
            _ => Ok(()),
        }
    }

    fn handle_login(&mut self, slot: usize, pkt: &[u8]) -> NetResult<()> {
        let login = Login::parse(pkt)?;

        let (version, addr) = match self.client(slot) {
            Some(client) => (client.version, client.addr),
            None => return Ok(()),
        };

        let account = match self.backing.account_by_username(&login.username) {
            Ok(account) => account,
            Err(err) => {
                logging::warn!(self.log, "account lookup failed"; "error" => %err);
                return self.reject(slot, LOGIN_BAD_CREDENTIALS);
            }
        };

        let account = match account {
            Some(account) => account,
            None => {
                logging::info!(self.log, "login with unknown username";
                               "username" => &login.username);
                return self.reject(slot, LOGIN_BAD_CREDENTIALS);
            }
        };

        let expected = keel::crypto::password_hash(&login.password, &account.regtime);

        if account.password.to_lowercase() != expected {
            logging::info!(self.log, "login with bad password"; "username" => &login.username);
            return self.reject(slot, LOGIN_BAD_CREDENTIALS);
        }

        let now = timestamp_secs();

        match self.backing.guildcard_banned(login.guildcard, now) {
            Ok(false) => (),
            Ok(true) => {
                logging::info!(self.log, "login from banned guildcard";
                               "guildcard" => login.guildcard);
                return self.reject(slot, LOGIN_BANNED);
            }
            Err(err) => {
                logging::warn!(self.log, "ban lookup failed"; "error" => %err);
                return self.reject(slot, LOGIN_BAD_CREDENTIALS);
            }
        }

        match self.backing.ip_banned(addr, now) {
            Ok(false) => (),
            Ok(true) => {
                logging::info!(self.log, "login from banned address"; "addr" => %addr);
                return self.reject(slot, LOGIN_BANNED);
            }
            Err(err) => {
                logging::warn!(self.log, "ban lookup failed"; "error" => %err);
                return self.reject(slot, LOGIN_BAD_CREDENTIALS);
            }
        }

        // Pick a ship: the least loaded one the account may enter.
        let ships = match self.backing.online_ships() {
            Ok(ships) => ships,
            Err(err) => {
                logging::warn!(self.log, "ship list lookup failed"; "error" => %err);
                return self.reject(slot, LOGIN_NO_SHIPS);
            }
        };

        let ship = ships
            .iter()
            .filter(|ship| !ship.gm_only || account.privlevel > 0)
            .min_by_key(|ship| ship.players);

        let ship = match ship {
            Some(ship) => ship,
            None => {
                logging::info!(self.log, "no ships available"; "username" => &login.username);
                return self.reject(slot, LOGIN_NO_SHIPS);
            }
        };

        let target = resolve(
            addr,
            ship.ip,
            ship.int_ip,
            self.config.override_addr,
            self.config.local_addr,
            self.config.netmask,
        );
        let port = ship.port + version.port_offset();

        logging::info!(self.log, "redirecting client";
                       "username" => &login.username,
                       "guildcard" => login.guildcard,
                       "ship" => &ship.name,
                       "addr" => %target,
                       "port" => port);

        let client = self.client_mut(slot).expect("Login for a vacated slot");
        client.guildcard = login.guildcard;

        let form = client.session.form();
        client
            .session
            .queue_packet(&assemble_login_reply(form, LOGIN_OK))?;
        client.session.queue_packet(
            &Redirect {
                addr: target,
                port,
            }
            .assemble(form),
        )?;

        client.state = LoginState::Redirected;
        client.session.mark_disconnected();

        Ok(())
    }

    /// Drains and dispatches every complete packet buffered on one client.
    pub fn process_buffered(&mut self, slot: usize) {
        loop {
            let pkt = match self.client_mut(slot) {
                Some(client) => match client.session.next_packet() {
                    Ok(pkt) => pkt,
                    Err(NetError::Wait) => break,
                    Err(_) => {
                        client.session.mark_disconnected();
                        break;
                    }
                },
                None => break,
            };

            if self.handle_packet(slot, &pkt).has_failed() {
                if let Some(client) = self.client_mut(slot) {
                    client.session.mark_disconnected();
                }
                break;
            }

            let gone = self
                .client(slot)
                .map(|client| client.session.is_disconnected())
                .unwrap_or(true);

            if gone {
                break;
            }
        }
    }

    fn service_client(&mut self, slot: usize, now: Instant) {
        let received = match self.client_mut(slot) {
            Some(client) => client.session.receive(now),
            None => return,
        };

        if received.has_failed() {
            if let Some(client) = self.client_mut(slot) {
                client.session.mark_disconnected();
            }
            return;
        }

        self.process_buffered(slot);
    }

    fn flush_slot(&mut self, slot: usize) {
        let flushed = match self.client_mut(slot) {
            Some(client) if client.session.is_attached() && client.session.has_pending() => {
                client.session.flush()
            }
            _ => return,
        };

        if flushed.has_failed() {
            if let Some(client) = self.client_mut(slot) {
                client.session.mark_disconnected();
            }
        }
    }

    fn accept_all(&mut self, listener: usize) -> NetResult<()> {
        let tag = self.listeners[listener];

        while let Some((stream, peer)) = self.endpoint.accept(listener)? {
            let peer_v4 = match peer.ip() {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => {
                    // These clients never speak IPv6; drop the socket.
                    continue;
                }
            };

            match tag {
                ListenerTag::Web => {
                    // Report the client count and close; no session.
                    logging::debug!(self.log, "web counter query"; "peer" => %peer);

                    let mut stream = stream;
                    let count = self.client_count().to_le_bytes();
                    drop(stream.write(&count));
                }
                ListenerTag::Game(version) => {
                    logging::info!(self.log, "accepted connection";
                                   "peer" => %peer,
                                   "variant" => ?version);

                    let form = crate::packets::header_form(version);
                    let session = Session::open(form, stream, peer);
                    let slot = self.attach(session, version, peer_v4);

                    let client = self.client(slot).expect("Attached client vanished");
                    if self.endpoint.register_session(slot, &client.session).has_failed() {
                        if let Some(client) = self.client_mut(slot) {
                            client.session.mark_disconnected();
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn housekeeping(&mut self, now: Instant) {
        for slot in 0..self.clients.len() {
            if let Some(client) = self.client_mut(slot) {
                if client.session.last_message_elapsed(now) >= IDLE_TIMEOUT {
                    client.session.mark_disconnected();
                }
            }
        }
    }

    /// End-of-tick harvest of disconnected clients.
    pub fn harvest(&mut self) {
        let doomed: Vec<usize> = (0..self.clients.len())
            .filter(|&slot| {
                self.client(slot)
                    .map(|client| client.session.is_disconnected())
                    .unwrap_or(false)
            })
            .collect();

        for slot in doomed {
            let mut client = match self.clients[slot].take() {
                Some(client) => client,
                None => continue,
            };

            self.free.push(slot);

            if client.session.is_attached() {
                // Give the redirect or reject a chance to leave the box.
                drop(client.session.flush());
                drop(self.endpoint.deregister_session(&client.session));
            }

            logging::debug!(self.log, "connection closed";
                            "guildcard" => client.guildcard,
                            "state" => ?client.state);
        }
    }

    /// Runs the accept/auth/redirect loop forever.
    pub fn run(&mut self) -> NetResult<()> {
        loop {
            let ready = self.endpoint.poll(POLL_TIMEOUT)?;
            let now = Instant::now();

            for readiness in ready {
                match readiness {
                    Readiness::Accept { listener } => self.accept_all(listener)?,
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

            for slot in 0..self.clients.len() {
                self.flush_slot(slot);
            }

            self.housekeeping(now);
            self.harvest();
        }
    }
}
