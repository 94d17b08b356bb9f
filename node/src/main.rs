use clap::{App, Arg};

use ember::logging;
use meshmap::replicator::Replicator;
use meshmap::store::MapStore;

mod config;

use crate::config::NodeConfig;

fn main() {
    let matches = App::new("meshmapd")
        .about("Replicated in-memory key/value map node")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Path to the TOML configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .default_value("info")
                .takes_value(true),
        )
        .get_matches();

    let log = logging::term_logger(matches.value_of("log-level").unwrap());

    let config = match matches.value_of("config") {
        Some(path) => NodeConfig::load(path),
        None => NodeConfig::default(),
    };

    let map = MapStore::new(config.node.identifier, config.node.entry_max_size);

    let mut replicator =
        Replicator::start(map, config.to_options(), &log).expect("Failed starting replication");

    replicator.wait();
}
