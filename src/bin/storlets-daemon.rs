#[macro_use] extern crate clap;

use clap::App;
use std::process;
use storlets::{
    daemon::{builtin_storlet, StorletDaemon},
    logging,
    sbus::SBus,
    server,
};

fn main() {
    let yaml = load_yaml!("storlets-daemon.yml");
    let matches = App::from_yaml(yaml).get_matches();

    let storlet_name = matches.value_of("storlet_name").unwrap();
    let pipe_path = matches.value_of("pipe_path").unwrap();
    let log_level = matches.value_of("log_level").unwrap();
    let container_id = matches.value_of("container_id").unwrap();
    logging::init(log_level, container_id);

    let pool_size: usize = match matches.value_of("pool_size").unwrap().parse() {
        Ok(size) if size > 0 => size,
        _ => {
            log::error!("pool size must be a positive integer");
            process::exit(1);
        }
    };
    let storlet = match builtin_storlet(storlet_name) {
        Some(storlet) => storlet,
        None => {
            log::error!("no storlet named {}", storlet_name);
            process::exit(1);
        }
    };

    let bus = match SBus::bind(pipe_path) {
        Ok(bus) => bus,
        Err(err) => {
            log::error!("failed to bind daemon endpoint {}: {}", pipe_path, err);
            process::exit(1);
        }
    };

    log::info!("storlet daemon {} serving {} with {} workers", storlet_name, pipe_path, pool_size);
    let mut daemon = StorletDaemon::new(storlet_name, storlet, pool_size);
    let result = server::main_loop(&bus, &mut daemon);
    daemon.shutdown();
    if let Err(err) = result {
        log::error!("storlet daemon {} failed: {}", storlet_name, err);
        process::exit(1);
    }
}
