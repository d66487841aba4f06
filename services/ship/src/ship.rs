use crate::block::Block;
use crate::client::Client;
use crate::config::ShipConfig;
use crate::gate::GateCommand;
use crate::limits::ItemLimits;
use crate::script::ScriptHook;
use hashbrown::HashMap;
use keel::logging::{self, Logger};
use keel::Guildcard;
use moor::gate::ShipStatus;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc};

/// Another ship in the fleet, as reported by the hub.
pub struct FleetShip {
    pub status: ShipStatus,
    pub clients: u16,
    pub games: u16,
}

/// Process-wide ship state shared by the accept thread, the block threads
/// and the hub link.
pub struct Ship {
    pub config: ShipConfig,
    pub log: Logger,
    pub limits: Box<dyn ItemLimits>,
    pub script: Box<dyn ScriptHook>,

    client_count: AtomicU32,
    game_count: AtomicU32,

    pub blocks: Mutex<Vec<Arc<Block>>>,
    pub fleet: Mutex<HashMap<u16, FleetShip>>,

    gate_tx: Mutex<Option<mpsc::Sender<GateCommand>>>,
}

impl Ship {
    pub fn new(
        config: ShipConfig,
        limits: Box<dyn ItemLimits>,
        script: Box<dyn ScriptHook>,
        log: &Logger,
    ) -> Arc<Ship> {
        Arc::new(Ship {
            config,
            log: log.new(logging::o!()),
            limits,
            script,
            client_count: AtomicU32::new(0),
            game_count: AtomicU32::new(0),
            blocks: Mutex::new(Vec::new()),
            fleet: Mutex::new(HashMap::new()),
            gate_tx: Mutex::new(None),
        })
    }

    /// Wires up the hub link command channel once its thread is running.
    pub fn set_gate(&self, tx: mpsc::Sender<GateCommand>) {
        *self.gate_tx.lock() = Some(tx);
    }

    pub fn send_gate(&self, cmd: GateCommand) {
        let tx = self.gate_tx.lock();

        if let Some(tx) = tx.as_ref() {
            if tx.send(cmd).is_err() {
                logging::warn!(self.log, "hub link is down, dropping command");
            }
        }
    }

    pub fn clients(&self) -> u16 {
        self.client_count.load(Ordering::Relaxed) as u16
    }

    pub fn games(&self) -> u16 {
        self.game_count.load(Ordering::Relaxed) as u16
    }

    fn publish_counts(&self) {
        self.send_gate(GateCommand::Counts {
            clients: self.clients(),
            games: self.games(),
        });
    }

    pub fn inc_clients(&self) {
        self.client_count.fetch_add(1, Ordering::Relaxed);
        self.publish_counts();
    }

    pub fn dec_clients(&self) {
        self.client_count.fetch_sub(1, Ordering::Relaxed);
        self.publish_counts();
    }

    pub fn inc_games(&self) {
        self.game_count.fetch_add(1, Ordering::Relaxed);
        self.publish_counts();
    }

    pub fn dec_games(&self) {
        self.game_count.fetch_sub(1, Ordering::Relaxed);
        self.publish_counts();
    }

    /// Finds a connected player anywhere on this ship.
    pub fn find_client(&self, guildcard: Guildcard) -> Option<Arc<Client>> {
        if guildcard == 0 {
            return None;
        }

        let blocks = self.blocks.lock();

        for block in blocks.iter() {
            if let Some(client) = block.find_client(guildcard) {
                return Some(client);
            }
        }

        None
    }

    /// Applies a fleet status update from the hub.
    pub fn update_fleet(&self, status: ShipStatus) {
        let mut fleet = self.fleet.lock();

        if status.online {
            let entry = FleetShip {
                clients: 0,
                games: 0,
                status,
            };
            fleet.insert(entry.status.ship_id, entry);
        } else {
            fleet.remove(&status.ship_id);
        }
    }

    pub fn update_fleet_counts(&self, ship_id: u16, clients: u16, games: u16) {
        let mut fleet = self.fleet.lock();

        if let Some(entry) = fleet.get_mut(&ship_id) {
            entry.clients = clients;
            entry.games = games;
        }
    }
}
