use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::{
    process::{Child, Command, ExitStatus},
    thread,
    time::{Duration, Instant},
};
use storlets::SBusClient;

fn sbus() -> Command {
    let mut command = Command::new(env!("CARGO"));
    command
        .arg("run")
        .arg("--quiet")
        .arg("-p")
        .arg("storlets-cli")
        .arg("--");
    command
}

struct Factory {
    child: Child,
    client: SBusClient,
}

impl Factory {
    fn start(pipe: &std::path::Path) -> Self {
        let child = Command::new(env!("CARGO_BIN_EXE_storlets-factory"))
            .arg(pipe)
            .arg("ERROR")
            .arg("AUTH_cli")
            .spawn()
            .unwrap();
        let client = SBusClient::new(pipe).with_timeout(Duration::from_secs(1));
        for _ in 0..200 {
            if client.ping().is_ok() {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        Factory { child, client }
    }

    fn wait_for_exit(&mut self) -> ExitStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            assert!(Instant::now() < deadline, "factory did not exit");
            thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for Factory {
    fn drop(&mut self) {
        let _ = self.client.halt();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn cli_no_args() {
    sbus()
        .assert()
        .failure()
        .stderr(predicate::str::contains("For more information try --help"))
        .stdout(predicate::str::is_empty());
}

#[test]
fn cli_help() {
    sbus()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("USAGE:"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn cli_unknown_command() {
    sbus()
        .arg("explode")
        .arg("/tmp/nothing")
        .assert()
        .failure()
        .stderr(predicate::str::contains("isn't a valid value"));
}

#[test]
fn cli_missing_pipe() {
    sbus()
        .arg("ping")
        .arg("/nonexistent/factory_pipe")
        .assert()
        .failure()
        .stderr(predicate::eq(
            "ERROR: Pipe file /nonexistent/factory_pipe does not exist\n",
        ))
        .stdout(predicate::str::is_empty());
}

#[test]
fn cli_ping_factory() {
    let dir = tempfile::tempdir().unwrap();
    let pipe = dir.path().join("factory_pipe");
    let _factory = Factory::start(&pipe);

    sbus()
        .arg("ping")
        .arg(&pipe)
        .assert()
        .success()
        .stdout(predicate::eq("Response: true: OK\nOK\n"));
}

#[test]
fn cli_failed_response() {
    let dir = tempfile::tempdir().unwrap();
    let pipe = dir.path().join("factory_pipe");
    let _factory = Factory::start(&pipe);

    sbus()
        .arg("daemon-status")
        .arg(&pipe)
        .arg("--storlet-name")
        .arg("identity")
        .assert()
        .failure()
        .stdout(predicate::eq(
            "Response: false: No running storlet daemons for identity\n",
        ))
        .stderr(predicate::str::contains("ERROR: Got error response"));
}

#[test]
fn factory_exits_cleanly_after_halt() {
    let dir = tempfile::tempdir().unwrap();
    let pipe = dir.path().join("factory_pipe");
    let mut factory = Factory::start(&pipe);

    sbus()
        .arg("halt")
        .arg(&pipe)
        .assert()
        .success()
        .stdout(predicate::str::ends_with("OK\n"));
    assert_eq!(factory.wait_for_exit().code(), Some(0));
}

#[test]
fn factory_exits_cleanly_after_stop_daemons() {
    let dir = tempfile::tempdir().unwrap();
    let pipe = dir.path().join("factory_pipe");
    let mut factory = Factory::start(&pipe);

    sbus()
        .arg("stop-daemons")
        .arg(&pipe)
        .assert()
        .success()
        .stdout(predicate::str::ends_with("OK\n"));
    assert_eq!(factory.wait_for_exit().code(), Some(0));
}

#[test]
fn factory_bind_failure() {
    Command::new(env!("CARGO_BIN_EXE_storlets-factory"))
        .arg("/nonexistent/dir/pipe")
        .arg("INFO")
        .arg("AUTH_test")
        .assert()
        .failure()
        .code(1);
}
