#[macro_use] extern crate clap;

use clap::{App, ArgMatches};
use env_logger::{from_env, Env};
use std::{path::Path, process};
use storlets::{errors::ClientError, protocol::ServiceResponse, SBusClient};

fn main() {
    let yaml = load_yaml!("cli.yml");
    let matches = App::from_yaml(yaml).get_matches();

    let log_level = matches.value_of("log_level").unwrap();
    from_env(Env::default().default_filter_or(log_level)).init();

    let command = matches.value_of("command").unwrap();
    let pipe_path = matches.value_of("pipe_path").unwrap();
    if !Path::new(pipe_path).exists() {
        eprintln!("ERROR: Pipe file {} does not exist", pipe_path);
        process::exit(1);
    }

    log::debug!("sending {} to {}", command, pipe_path);
    let client = SBusClient::new(pipe_path);
    match send(&client, command, &matches) {
        Ok(response) => {
            println!("Response: {}: {}", response.status, response.message);
            if response.status {
                println!("OK");
            } else {
                eprintln!("ERROR: Got error response");
                process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("ERROR: {}", err);
            process::exit(1);
        }
    }
}

fn send(
    client: &SBusClient,
    command: &str,
    matches: &ArgMatches,
) -> Result<ServiceResponse, ClientError> {
    match command {
        "ping" => client.ping(),
        "halt" => client.halt(),
        "stop-daemons" => client.stop_daemons(),
        "stop-daemon" => client.stop_daemon(required(matches, "storlet_name")),
        "daemon-status" => client.daemon_status(required(matches, "storlet_name")),
        "cancel" => client.cancel(required(matches, "task_id")),
        _ => unreachable!("clap only accepts known commands"),
    }
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> &'a str {
    match matches.value_of(name) {
        Some(value) => value,
        None => {
            eprintln!("ERROR: --{} is required for this command", name.replace('_', "-"));
            process::exit(1);
        }
    }
}
