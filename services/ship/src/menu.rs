//! The ship-menu loop, run by the accept thread: greets arriving clients
//! and redirects them onto the block they pick. Everything else a ship
//! menu could offer lives outside the room machinery and stays out.

use crate::client::{Client, ClientFlags};
use crate::config::BLOCK_PORT_STRIDE;
use crate::packets;
use crate::ship::Ship;
use crate::script::{ScriptClient, ScriptEvent};
use keel::addr::resolve;
use keel::crypto::{Cipher, GcCipher, PcCipher};
use keel::logging::{self, Logger};
use keel::version::{CipherFamily, ClientVersion};
use moor::endpoint::{Endpoint, Readiness};
use moor::error::{ErrorUtils, NetError, NetResult};
use moor::header::{HeaderForm, CLIENT_HEADER_SIZE};
use moor::session::{CipherPair, Session};
use rand::RngCore;
use rand_mt::Mt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

const MENU_VARIANTS: [ClientVersion; 4] = [
    ClientVersion::DcV1,
    ClientVersion::Pc,
    ClientVersion::GcUs,
    ClientVersion::Ep3,
];

pub struct MenuRunner {
    ship: Arc<Ship>,
    endpoint: Endpoint,
    slots: Vec<Option<Arc<Client>>>,
    free: Vec<usize>,
    listeners: Vec<ClientVersion>,
    seed_rng: Mt,
    log: Logger,
}

impl MenuRunner {
    pub fn new(ship: Arc<Ship>) -> NetResult<MenuRunner> {
        let log = ship.log.new(logging::o!("task" => "ship-menu"));

        Ok(MenuRunner {
            ship,
            endpoint: Endpoint::new()?,
            slots: Vec::new(),
            free: Vec::new(),
            listeners: Vec::new(),
            seed_rng: Mt::new(rand::random::<u32>()),
            log,
        })
    }

    pub fn bind(&mut self) -> NetResult<()> {
        for version in MENU_VARIANTS.iter() {
            let port = self.ship.config.base_port + version.port_offset();
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let listener = self.endpoint.add_listener(&addr)?;

            debug_assert_eq!(listener, self.listeners.len());
            self.listeners.push(*version);

            logging::info!(self.log, "ship menu listening"; "port" => port, "variant" => ?version);
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

    fn attach(&mut self, session: Session, version: ClientVersion, addr: Ipv4Addr) -> usize {
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
        client.set_flag(ClientFlags::TYPE_SHIP);

        self.ship.inc_clients();
        self.ship.script.on_event(
            ScriptEvent::ClientShipLogin,
            &ScriptClient::new(&client, false),
        );

        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(client);
                slot
            }
            None => {
                self.slots.push(Some(client));
                self.slots.len() - 1
            }
        }
    }

    fn client(&self, slot: usize) -> Option<&Arc<Client>> {
        self.slots.get(slot).and_then(|slot| slot.as_ref())
    }

    fn handle_packet(&mut self, slot: usize, pkt: &[u8]) -> NetResult<()> {
        let client = match self.client(slot) {
            Some(client) => client.clone(),
            None => return Ok(()),
        };

        let form = packets::header_form(client.version);
        let header = form.parse(&pkt[..CLIENT_HEADER_SIZE]);

        match header.opcode {
            packets::TYPE_BLOCK_LOGIN => {
                let login = packets::BlockLogin::parse(&packets::convert_header(
                    pkt,
                    form,
                    HeaderForm::Dc,
                ))?;

                client.set_guildcard(login.guildcard);
                client.set_flag(ClientFlags::LOGGED_IN);

                drop(client.send(&packets::assemble_text(
                    form,
                    &format!(
                        "\tE\tC7{}\n{} block(s) open.",
                        self.ship.config.name, self.ship.config.blocks
                    ),
                )));

                Ok(())
            }
            packets::TYPE_MENU_SELECT => {
                let choice = packets::parse_menu_select(&packets::convert_header(
                    pkt,
                    form,
                    HeaderForm::Dc,
                ))?;

                if choice == 0 || choice > self.ship.config.blocks {
                    drop(client.send(&packets::assemble_text(form, "\tE\tC4No such block.")));
                    return Ok(());
                }

                let config = &self.ship.config;
                let target = resolve(
                    client.addr,
                    config.external_addr,
                    config.internal_addr,
                    config.external_addr,
                    config.internal_addr,
                    config.netmask,
                );

                let port = config.base_port
                    + BLOCK_PORT_STRIDE * choice as u16
                    + client.version.port_offset();

                logging::info!(self.log, "sending client to block";
                               "guildcard" => client.guildcard(),
                               "block" => choice,
                               "port" => port);

                drop(client.send(&packets::assemble_redirect(form, target, port)));
                client.disconnect();

                Ok(())
            }
            _ => Ok(()),
        }
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
            if let Some(client) = self.slots[slot].take() {
                self.free.push(slot);

                self.ship.script.on_event(
                    ScriptEvent::ClientShipLogout,
                    &ScriptClient::new(&client, false),
                );

                let mut session = client.session.lock();

                if session.is_attached() {
                    drop(session.flush());
                    drop(self.endpoint.deregister_session(&session));
                }

                drop(session);
                self.ship.dec_clients();
            }
        }
    }

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

                            logging::info!(self.log, "accepted ship-menu connection";
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
