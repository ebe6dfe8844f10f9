#[macro_use] extern crate clap;

use clap::{App, ArgMatches};
use std::{path::Path, process, str::FromStr, time::Duration};
use storlets::{
    factory::{self, DaemonFactory},
    launcher::DaemonLauncher,
    logging,
    sbus::SBus,
    server,
};

fn main() {
    let yaml = load_yaml!("storlets-factory.yml");
    let matches = App::from_yaml(yaml).get_matches();

    let pipe_path = matches.value_of("pipe_path").unwrap();
    let log_level = matches.value_of("log_level").unwrap();
    let container_id = matches.value_of("container_id").unwrap();
    logging::init(log_level, container_id);

    let mut launcher = DaemonLauncher::new(container_id);
    if let Some(path) = matches.value_of("daemon_binary") {
        launcher = launcher.native_binary(Path::new(path));
    }

    let startup_wait = seconds_value(&matches, "startup_wait", factory::DEFAULT_STARTUP_WAIT);
    let ping_interval = seconds_value(&matches, "ping_interval", factory::DEFAULT_PING_INTERVAL);
    let ping_attempts = parsed_value(&matches, "ping_attempts", factory::DEFAULT_PING_ATTEMPTS);

    let bus = match SBus::bind(pipe_path) {
        Ok(bus) => bus,
        Err(err) => {
            log::error!("failed to bind factory endpoint {}: {}", pipe_path, err);
            process::exit(1);
        }
    };

    let mut factory = DaemonFactory::new(launcher)
        .startup_wait(startup_wait)
        .ping_schedule(ping_attempts, ping_interval);
    let result = server::main_loop(&bus, &mut factory);
    drop(factory);
    match result {
        Ok(()) => log::info!("daemon factory for {} is done", container_id),
        Err(err) => {
            log::error!("daemon factory for {} failed: {}", container_id, err);
            process::exit(1);
        }
    }
}

fn parsed_value<T: FromStr>(matches: &ArgMatches, name: &str, default: T) -> T {
    match matches.value_of(name) {
        None => default,
        Some(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                log::error!("invalid value for --{}: {}", name.replace('_', "-"), value);
                process::exit(1);
            }
        },
    }
}

fn seconds_value(matches: &ArgMatches, name: &str, default: Duration) -> Duration {
    let seconds: f64 = parsed_value(matches, name, default.as_secs_f64());
    if seconds.is_finite() && seconds >= 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        log::error!("invalid value for --{}: {}", name.replace('_', "-"), seconds);
        process::exit(1);
    }
}
