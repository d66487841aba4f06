use clap::{App, Arg};
use keel::logging;
use std::process;
use std::thread;

mod block;
mod client;
mod config;
mod gate;
mod limits;
mod lobby;
mod menu;
mod packets;
mod script;
mod ship;
mod subcmd;

#[cfg(test)]
mod testutil;

use crate::block::{Block, BlockRunner};
use crate::config::ShipConfig;
use crate::gate::GateLink;
use crate::limits::PermissiveLimits;
use crate::menu::MenuRunner;
use crate::script::NoopHook;
use crate::ship::Ship;

fn main() {
    let matches = App::new("Ship Server")
        .version("0.1.0")
        .about("Hosts lobbies and games, relaying traffic between players.")
        .arg(Arg::with_name("CONFIG_FILE").help("Path to the config file"))
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .help("Log many messages that might help debug a problem"),
        )
        .arg(
            Arg::with_name("quiet")
                .long("quiet")
                .help("Only log warning and error messages"),
        )
        .arg(
            Arg::with_name("reallyquiet")
                .long("reallyquiet")
                .help("Only log error messages"),
        )
        .get_matches();

    let log = logging::init(logging::severity_from_flags(
        matches.is_present("verbose"),
        matches.is_present("quiet"),
        matches.is_present("reallyquiet"),
    ));

    let config = match matches.value_of("CONFIG_FILE") {
        Some(path) => ShipConfig::load(path),
        None => ShipConfig::default(),
    };

    let gate_key = config.gate_key_bytes();

    let ship = Ship::new(config, Box::new(PermissiveLimits), Box::new(NoopHook), &log);

    logging::info!(log, "bringing up ship";
                   "name" => &ship.config.name,
                   "blocks" => ship.config.blocks,
                   "base_port" => ship.config.base_port);

    // One thread per block, each with its own readiness loop and rooms.
    for b in 1..=ship.config.blocks {
        let block = Block::new(b, &ship);
        block.setup_default_lobbies(ship.config.event);
        ship.blocks.lock().push(block.clone());

        let mut runner = match BlockRunner::new(ship.clone(), block) {
            Ok(runner) => runner,
            Err(err) => {
                logging::error!(log, "block setup failed"; "block" => b, "error" => ?err);
                process::exit(1);
            }
        };

        if let Err(err) = runner.bind() {
            logging::error!(log, "cannot bind block ports"; "block" => b, "error" => ?err);
            process::exit(1);
        }

        thread::Builder::new()
            .name(format!("block-{:02}", b))
            .spawn(move || {
                if let Err(err) = runner.run() {
                    panic!("Block loop failed: {:?}", err);
                }
            })
            .expect("Failed to spawn a block thread");
    }

    // The hub link gets its own thread and reconnects on its own.
    let _gate = GateLink::spawn(ship.clone(), gate_key);

    // The accept thread doubles as the ship-menu loop.
    let mut menu = match MenuRunner::new(ship) {
        Ok(menu) => menu,
        Err(err) => {
            logging::error!(log, "ship menu setup failed"; "error" => ?err);
            process::exit(1);
        }
    };

    if let Err(err) = menu.bind() {
        logging::error!(log, "cannot bind the ship ports"; "error" => ?err);
        process::exit(1);
    }

    if let Err(err) = menu.run() {
        logging::error!(log, "ship menu loop failed"; "error" => ?err);
        process::exit(1);
    }
}
