//! Command lines for storlet daemon processes

use crate::errors::FactoryError;
use std::{
    env,
    path::{Path, PathBuf},
    process::Command,
};
use storlets_protocol::StartDaemonParams;

/// Knows how to start a daemon for each supported language
///
/// Every daemon gets the same trailing arguments: storlet name, endpoint
/// path, log level, pool size and the account id of the factory.
#[derive(Debug, Clone)]
pub struct DaemonLauncher {
    container_id: String,
    native_binary: PathBuf,
    java_binary: PathBuf,
    java_main_class: String,
    java_lib_dir: PathBuf,
    java_jars: Vec<String>,
    python_daemon: PathBuf,
    python_storlet_root: PathBuf,
}

impl DaemonLauncher {
    pub fn new<S: Into<String>>(container_id: S) -> Self {
        DaemonLauncher {
            container_id: container_id.into(),
            native_binary: default_native_binary(),
            java_binary: PathBuf::from("/usr/bin/java"),
            java_main_class: "org.openstack.storlet.daemon.SDaemon".to_string(),
            java_lib_dir: PathBuf::from("/usr/local/lib/storlets"),
            java_jars: [
                "logback-classic-1.1.2.jar",
                "logback-core-1.1.2.jar",
                "slf4j-api-1.7.7.jar",
                "json_simple-1.1.jar",
                "SBusJavaFacade.jar",
                "SCommon.jar",
                "SDaemon.jar",
            ]
            .iter()
            .map(|jar| jar.to_string())
            .collect(),
            python_daemon: PathBuf::from("/usr/local/libexec/storlets/storlets-daemon"),
            python_storlet_root: PathBuf::from("/home/swift"),
        }
    }

    /// Use a different binary for `native` daemons
    pub fn native_binary(mut self, path: &Path) -> Self {
        self.native_binary = path.to_path_buf();
        self
    }

    /// Build the command that starts the daemon described by `params`
    pub fn command(&self, params: &StartDaemonParams) -> Result<Command, FactoryError> {
        let mut command = match params.daemon_language.to_lowercase().as_str() {
            "native" => Command::new(&self.native_binary),
            "java" => self.java_command(params),
            "python" => self.python_command(params),
            other => return Err(FactoryError::UnsupportedLanguage(other.to_string())),
        };
        command
            .arg(&params.storlet_name)
            .arg(&params.uds_path)
            .arg(&params.log_level)
            .arg(params.pool_size.to_string())
            .arg(&self.container_id);
        Ok(command)
    }

    fn java_command(&self, params: &StartDaemonParams) -> Command {
        let java_dir = self.java_lib_dir.join("java");
        let mut classpath: Vec<String> = self
            .java_jars
            .iter()
            .map(|jar| java_dir.join(jar).to_string_lossy().into_owned())
            .collect();
        classpath.push(params.storlet_path.clone());
        let library_path = vec![
            self.java_lib_dir.to_string_lossy().into_owned(),
            java_dir.to_string_lossy().into_owned(),
        ];

        let mut command = Command::new(&self.java_binary);
        command
            .env("CLASSPATH", extend_env_path("CLASSPATH", classpath))
            .env("LD_LIBRARY_PATH", extend_env_path("LD_LIBRARY_PATH", library_path))
            .arg(&self.java_main_class);
        command
    }

    fn python_command(&self, params: &StartDaemonParams) -> Command {
        let storlet_dir = self.python_storlet_root.join(&params.storlet_name);
        let mut command = Command::new(python_interpreter(params.daemon_language_version.as_deref()));
        command
            .env(
                "PYTHONPATH",
                extend_env_path("PYTHONPATH", vec![storlet_dir.to_string_lossy().into_owned()]),
            )
            .arg(&self.python_daemon);
        command
    }
}

/// Interpreter for a requested python version; anything but a 3.x request
/// gets the legacy interpreter
pub fn python_interpreter(version: Option<&str>) -> PathBuf {
    let major = version
        .and_then(|version| version.parse::<f64>().ok())
        .map(|version| version.trunc() as u32)
        .unwrap_or(2);
    if major == 3 {
        PathBuf::from("/usr/bin/python3")
    } else {
        PathBuf::from("/usr/bin/python2.7")
    }
}

fn extend_env_path(name: &str, mut entries: Vec<String>) -> String {
    if let Ok(existing) = env::var(name) {
        if !existing.is_empty() {
            entries.insert(0, existing);
        }
    }
    entries.join(":")
}

fn default_native_binary() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("storlets-daemon")))
        .unwrap_or_else(|| PathBuf::from("storlets-daemon"))
}
