use std::{
    collections::BTreeMap,
    fs,
    os::unix::fs::PermissionsExt,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};
use storlets::{
    config::GatewayConfig,
    invocation::{StorletData, StorletRequest},
    errors::RuntimeError,
    runtime::{DaemonStatus, ProcessRestarter, RunTimePaths, RunTimeSandbox},
    SBusClient,
};
use tokio::runtime::Runtime;

const SCOPE: &str = "AUTH_test";

// one test at a time, the leak check counts descriptors of the whole process
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Configuration for a factory running as a local process, with the
/// sandbox side paths pointing at the host side directories
fn config(root: &Path) -> GatewayConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = GatewayConfig::default().host_root(root);
    let host_pipes = RunTimePaths::new(SCOPE, &config).host_pipe_dir();
    let host_storlets = RunTimePaths::new(SCOPE, &config).host_storlet_base_dir();
    let mut config = config
        .sandbox_pipe_dir(&host_pipes)
        .sandbox_storlet_dir(&host_storlets)
        .timeouts(
            Duration::from_millis(50),
            Duration::from_secs(20),
            Duration::from_secs(20),
        );
    config.storlet_daemon_thread_pool_size = 2;
    config.storlet_daemon_debug_level = "INFO".to_string();
    config.factory_binary = Some(env!("CARGO_BIN_EXE_storlets-factory").into());
    config
}

/// Only the default image is available, so every restart goes through the
/// fallback
fn sandbox_with(
    config: &GatewayConfig,
    restarter: ProcessRestarter,
) -> (RunTimeSandbox, Arc<ProcessRestarter>) {
    let restarter =
        Arc::new(restarter.available_images(vec![config.default_container_image_name.clone()]));
    (RunTimeSandbox::new(SCOPE, config, restarter.clone()), restarter)
}

/// A sandbox whose factory runs as a local process
fn sandbox(root: &Path) -> (RunTimeSandbox, Arc<ProcessRestarter>) {
    let config = config(root);
    sandbox_with(&config, ProcessRestarter::from_config(&config))
}

/// Put the request's storlet file into the host cache
fn cache(sandbox: &RunTimeSandbox, request: &StorletRequest, contents: &[u8]) {
    let cache_dir = sandbox.paths().host_storlet_cache_dir();
    fs::create_dir_all(&cache_dir).unwrap();
    fs::write(cache_dir.join(&request.storlet_id), contents).unwrap();
}

fn native_request(main: &str, body: &[u8]) -> StorletRequest {
    StorletRequest::new(format!("{}-1.0", main), StorletData::from_bytes(body.to_vec()))
        .storlet_main(main)
        .language("native", None)
}

fn open_fds() -> usize {
    fs::read_dir("/proc/self/fd").unwrap().count()
}

fn halt(sandbox: &RunTimeSandbox) {
    let _ = SBusClient::new(sandbox.paths().host_factory_pipe()).halt();
}

/// Live native daemons whose command line mentions `root`
fn daemon_processes(root: &Path) -> usize {
    let root = root.to_string_lossy();
    fs::read_dir("/proc")
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().parse::<u32>().is_ok())
        .filter_map(|entry| fs::read(entry.path().join("cmdline")).ok())
        .filter(|cmdline| {
            let args: Vec<String> = cmdline
                .split(|byte| *byte == 0)
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
                .collect();
            args[0].ends_with("storlets-daemon") && args.iter().any(|arg| arg.contains(&*root))
        })
        .count()
}

/// Wait a little for the daemon count to settle at `expected`
fn settled_daemon_processes(root: &Path, expected: usize) -> usize {
    let mut count = daemon_processes(root);
    for _ in 0..100 {
        if count == expected {
            break;
        }
        thread::sleep(Duration::from_millis(20));
        count = daemon_processes(root);
    }
    count
}

#[test]
fn activate_and_invoke() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let (sandbox, restarter) = sandbox(dir.path());

    Runtime::new().unwrap().block_on(async {
        assert!(!sandbox.ping().await);
        assert_eq!(
            sandbox.get_storlet_daemon_status("identity").await.unwrap(),
            DaemonStatus::Unreachable
        );

        let request = native_request("identity", b"hello storlets");
        cache(&sandbox, &request, b"identity");
        sandbox.activate(&request).await.unwrap();
        assert!(sandbox
            .paths()
            .host_storlet_dir("identity")
            .join("identity-1.0")
            .exists());
        assert_eq!(restarter.running(), 1);
        assert!(sandbox.ping().await);
        assert_eq!(
            sandbox.get_storlet_daemon_status("identity").await.unwrap(),
            DaemonStatus::Running
        );

        let mut user_metadata = BTreeMap::new();
        user_metadata.insert("color".to_string(), "blue".to_string());
        let response = sandbox
            .invoke(request.user_metadata(user_metadata))
            .await
            .unwrap();
        assert_eq!(response.metadata.get("color").map(String::as_str), Some("blue"));
        assert_eq!(
            response.metadata.get("execution-result").map(String::as_str),
            Some("identity")
        );
        assert_eq!(response.data.read_to_end().await.unwrap(), b"hello storlets");

        // running and current: nothing to do
        let request = native_request("identity", b"");
        assert!(!sandbox.update_from_cache(&request).await.unwrap());
        sandbox.activate(&request).await.unwrap();

        // refreshed code: the daemon is stopped and started again
        cache(&sandbox, &request, b"identity, refreshed");
        sandbox.activate(&request).await.unwrap();
        assert_eq!(
            sandbox.get_storlet_daemon_status("identity").await.unwrap(),
            DaemonStatus::Running
        );
        let response = sandbox.invoke(native_request("identity", b"again")).await.unwrap();
        assert_eq!(response.data.read_to_end().await.unwrap(), b"again");

        sandbox.stop_storlet_daemon("identity").await.unwrap();
        assert_eq!(
            sandbox.get_storlet_daemon_status("identity").await.unwrap(),
            DaemonStatus::NotRunning
        );
    });
    assert!(sandbox.paths().host_log_path("identity").exists());
    halt(&sandbox);
}

#[test]
fn unknown_storlet_is_unavailable() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let (sandbox, _restarter) = sandbox(dir.path());

    Runtime::new().unwrap().block_on(async {
        let request = native_request("nosuch", b"");
        assert!(matches!(
            sandbox.activate(&request).await,
            Err(RuntimeError::NotCached(_))
        ));
        cache(&sandbox, &request, b"nosuch");
        assert!(matches!(
            sandbox.activate(&request).await,
            Err(RuntimeError::StorletUnavailable(_))
        ));
        assert_eq!(
            sandbox.get_storlet_daemon_status("nosuch").await.unwrap(),
            DaemonStatus::NotRunning
        );
    });
    halt(&sandbox);
}

#[test]
fn concurrent_invocations_do_not_leak() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let (sandbox, _restarter) = sandbox(dir.path());
    let runtime = Runtime::new().unwrap();

    runtime.block_on(async {
        for main in &["identity", "half"] {
            let request = native_request(main, b"");
            cache(&sandbox, &request, main.as_bytes());
            sandbox.activate(&request).await.unwrap();
        }
    });

    let body: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 256) as u8).collect();
    let expected_half: Vec<u8> = body.iter().step_by(2).copied().collect();
    let baseline = open_fds();

    runtime.block_on(async {
        let identity = async {
            let response = sandbox.invoke(native_request("identity", &body)).await.unwrap();
            response.data.read_to_end().await.unwrap()
        };
        let half = async {
            let response = sandbox.invoke(native_request("half", &body)).await.unwrap();
            response.data.read_to_end().await.unwrap()
        };
        let (identity, half) = tokio::join!(identity, half);
        assert!(identity == body);
        assert!(half == expected_half);
    });

    // writer tasks finish on their own once the daemon has read everything
    let mut open = open_fds();
    for _ in 0..100 {
        if open <= baseline {
            break;
        }
        thread::sleep(Duration::from_millis(20));
        open = open_fds();
    }
    assert_eq!(open, baseline);
    halt(&sandbox);
}

#[test]
fn restart_stops_the_old_daemons() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let (sandbox, restarter) = sandbox(dir.path());
    let request = native_request("identity", b"");
    cache(&sandbox, &request, b"identity");
    let runtime = Runtime::new().unwrap();

    runtime.block_on(async {
        sandbox.activate(&request).await.unwrap();
    });
    assert_eq!(settled_daemon_processes(dir.path(), 1), 1);

    runtime.block_on(async {
        sandbox.restart().await.unwrap();
    });
    assert_eq!(restarter.running(), 1);
    assert_eq!(settled_daemon_processes(dir.path(), 0), 0);

    runtime.block_on(async {
        assert_eq!(
            sandbox.get_storlet_daemon_status("identity").await.unwrap(),
            DaemonStatus::NotRunning
        );
        sandbox.activate(&request).await.unwrap();
    });
    assert_eq!(settled_daemon_processes(dir.path(), 1), 1);

    drop(sandbox);
    drop(restarter);
    assert_eq!(settled_daemon_processes(dir.path(), 0), 0);
}

#[test]
fn slow_daemon_starts_within_the_ping_schedule() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();

    // takes longer than a plain client request may wait
    let script = dir.path().join("slow-daemon.sh");
    fs::write(
        &script,
        format!(
            "#!/bin/sh\nsleep 12\nexec {} \"$@\"\n",
            env!("CARGO_BIN_EXE_storlets-daemon")
        ),
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = config(dir.path());
    config.storlet_daemon_ping_attempts = 8;
    config.storlet_daemon_ping_interval = 2.0;
    assert!(config.daemon_start_timeout() > Duration::from_secs(12));
    let (sandbox, _restarter) =
        sandbox_with(&config, ProcessRestarter::from_config(&config).daemon_binary(&script));

    let request = native_request("identity", b"slow but steady");
    cache(&sandbox, &request, b"identity");
    Runtime::new().unwrap().block_on(async {
        sandbox.activate(&request).await.unwrap();
        assert_eq!(
            sandbox.get_storlet_daemon_status("identity").await.unwrap(),
            DaemonStatus::Running
        );
        let response = sandbox.invoke(request).await.unwrap();
        assert_eq!(response.data.read_to_end().await.unwrap(), b"slow but steady");
    });
    halt(&sandbox);
}
