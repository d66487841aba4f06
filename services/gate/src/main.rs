use clap::{App, Arg};
use keel::logging;
use ledger::memory::Seed;
use ledger::MemoryBacking;
use std::process;
use std::sync::Arc;

mod config;
mod server;
mod ship;

use crate::config::GateConfig;
use crate::server::GateServer;

fn main() {
    let matches = App::new("Fleet Hub")
        .version("0.1.0")
        .about("Central hub every game-hosting ship connects to.")
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
        Some(path) => GateConfig::load(path),
        None => GateConfig::default(),
    };

    let backing = match &config.seed_file {
        Some(path) => {
            let seed: Seed = serdeconv::from_toml_file(path).unwrap_or_else(|err| {
                logging::error!(log, "cannot load the seed file"; "path" => path, "error" => %err);
                process::exit(1);
            });

            Arc::new(MemoryBacking::from_seed(seed))
        }
        None => Arc::new(MemoryBacking::new()),
    };

    let mut server = match GateServer::new(config, backing, &log) {
        Ok(server) => server,
        Err(err) => {
            logging::error!(log, "hub setup failed"; "error" => ?err);
            process::exit(1);
        }
    };

    if let Err(err) = server.bind() {
        logging::error!(log, "cannot bind the hub port"; "error" => ?err);
        process::exit(1);
    }

    if let Err(err) = server.run() {
        logging::error!(log, "hub loop failed"; "error" => ?err);
        process::exit(1);
    }
}
