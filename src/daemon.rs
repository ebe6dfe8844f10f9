//! Worker daemon hosting one storlet
//!
//! Tasks run on their own threads. The command loop only hands out task ids,
//! tracks running tasks and raises cancel flags; it never waits on storlet
//! code except to respect the pool size.

use crate::{
    errors::StorletError,
    fdio,
    files::{StorletInputFile, StorletLogger, StorletOutputFile},
    server::{CommandHandler, CommandResponse, Request},
};
use std::{
    collections::HashMap,
    io,
    io::{Read, Write},
    os::unix::io::OwnedFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    thread::JoinHandle,
    time::Duration,
};
use storlets_protocol::{Command, Params, SBusFile};

/// Cooperative cancellation flag shared between the command loop and a task
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A compute unit hosted by a worker daemon
///
/// `inputs` holds the primary input followed by any extra inputs, in the
/// order the gateway sent them.
pub trait Storlet: Send + Sync {
    fn execute(
        &self,
        inputs: Vec<StorletInputFile>,
        output: StorletOutputFile,
        params: &Params,
        logger: &mut StorletLogger,
    ) -> Result<(), StorletError>;
}

/// Copies every input to the output, passing the first input's metadata on
pub struct IdentityStorlet;

impl Storlet for IdentityStorlet {
    fn execute(
        &self,
        mut inputs: Vec<StorletInputFile>,
        mut output: StorletOutputFile,
        params: &Params,
        logger: &mut StorletLogger,
    ) -> Result<(), StorletError> {
        logger.info("identity invoked");
        let mut metadata = inputs
            .first()
            .map(|input| input.metadata().clone())
            .unwrap_or_default();
        metadata.insert("execution-result".to_string(), "identity".to_string());
        if let Some(value) = params.get("test_param") {
            metadata.insert("test-param".to_string(), value.clone());
        }
        output.set_metadata(metadata)?;
        for input in inputs.iter_mut() {
            io::copy(input, &mut output)?;
        }
        output.flush()?;
        logger.info("identity done");
        Ok(())
    }
}

/// Copies every other byte of the first input
pub struct HalfStorlet;

impl Storlet for HalfStorlet {
    fn execute(
        &self,
        mut inputs: Vec<StorletInputFile>,
        mut output: StorletOutputFile,
        _params: &Params,
        logger: &mut StorletLogger,
    ) -> Result<(), StorletError> {
        logger.info("half invoked");
        let mut input = match inputs.drain(..).next() {
            Some(input) => input,
            None => return Err(StorletError::Failed("no input".to_string())),
        };
        output.set_metadata(input.metadata().clone())?;
        let mut keep = true;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let len = input.read(&mut buf)?;
            if len == 0 {
                break;
            }
            let mut half = Vec::with_capacity(len / 2 + 1);
            for byte in &buf[..len] {
                if keep {
                    half.push(*byte);
                }
                keep = !keep;
            }
            output.write_all(&half)?;
        }
        output.flush()?;
        Ok(())
    }
}

/// Look up a storlet compiled into this crate by its name, ignoring any
/// version or archive suffix (`identity-1.0.jar` finds `identity`)
pub fn builtin_storlet(name: &str) -> Option<Arc<dyn Storlet>> {
    let base = name
        .split(|c| c == '-' || c == '.')
        .next()
        .unwrap_or(name)
        .to_lowercase();
    match base.as_str() {
        "identity" | "echo" => Some(Arc::new(IdentityStorlet)),
        "half" => Some(Arc::new(HalfStorlet)),
        _ => None,
    }
}

struct Task {
    cancel: CancelFlag,
    thread: JoinHandle<()>,
}

/// Command handler for a worker daemon endpoint
pub struct StorletDaemon {
    storlet_name: String,
    storlet: Arc<dyn Storlet>,
    pool_size: usize,
    tasks: HashMap<String, Task>,
}

impl StorletDaemon {
    pub fn new<S: Into<String>>(storlet_name: S, storlet: Arc<dyn Storlet>, pool_size: usize) -> Self {
        StorletDaemon {
            storlet_name: storlet_name.into(),
            storlet,
            pool_size: pool_size.max(1),
            tasks: HashMap::new(),
        }
    }

    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn reap_finished(&mut self) {
        let finished: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.thread.is_finished())
            .map(|(task_id, _)| task_id.clone())
            .collect();
        for task_id in finished {
            if let Some(task) = self.tasks.remove(&task_id) {
                if task.thread.join().is_err() {
                    log::error!("task {} panicked", task_id);
                }
                log::debug!("task {} finished", task_id);
            }
        }
    }

    fn wait_for_slot(&mut self) {
        self.reap_finished();
        while self.tasks.len() >= self.pool_size {
            thread::sleep(Duration::from_millis(10));
            self.reap_finished();
        }
    }

    fn new_task_id(&self) -> String {
        loop {
            let task_id = format!("{:08x}", rand::random::<u32>());
            if !self.tasks.contains_key(&task_id) {
                return task_id;
            }
        }
    }

    fn execute(&mut self, request: Request) -> Result<String, StorletError> {
        let mut files = request.files.into_iter();
        let (task_id_out, input, data_out, metadata_out, logger_fd) = match (
            files.next(),
            files.next(),
            files.next(),
            files.next(),
            files.next(),
        ) {
            (Some(a), Some(b), Some(c), Some(d), Some(e)) => (a.fd, b, c.fd, d.fd, e.fd),
            _ => return Err(StorletError::Failed("missing descriptors".to_string())),
        };
        let extra_inputs: Vec<SBusFile<OwnedFd>> = files.collect();

        self.wait_for_slot();
        let task_id = self.new_task_id();
        let cancel = CancelFlag::default();

        let mut inputs = vec![StorletInputFile::from_sbus_file(input, cancel.clone())?];
        for extra in extra_inputs {
            inputs.push(StorletInputFile::from_sbus_file(extra, cancel.clone())?);
        }
        let output = StorletOutputFile::new(data_out, metadata_out, cancel.clone());
        let mut logger = StorletLogger::new(self.storlet_name.clone(), logger_fd);

        fdio::write_and_close(task_id_out, task_id.as_bytes())?;
        log::debug!("returning task_id {}", task_id);

        let storlet = self.storlet.clone();
        let params = request.params;
        let name = self.storlet_name.clone();
        let thread_task_id = task_id.clone();
        let thread = thread::Builder::new()
            .name(format!("task-{}", task_id))
            .spawn(move || {
                match storlet.execute(inputs, output, &params, &mut logger) {
                    Ok(()) => log::info!("{} task {} complete", name, thread_task_id),
                    Err(err) => {
                        log::error!("{} task {} failed: {}", name, thread_task_id, err);
                        logger.error(&err.to_string());
                    }
                }
            })?;
        self.tasks.insert(task_id.clone(), Task { cancel, thread });
        Ok(format!("task {} started", task_id))
    }

    fn cancel(&mut self, task_id: Option<&str>) -> Result<String, String> {
        self.reap_finished();
        let task_id = task_id.unwrap_or_default();
        match self.tasks.get(task_id) {
            Some(task) => {
                task.cancel.cancel();
                Ok(format!("Cancelled task {}", task_id))
            }
            None => Err(format!("Task id {} is not found", task_id)),
        }
    }

    /// Cancel whatever is still running and wait for the task threads
    pub fn shutdown(&mut self) {
        for (task_id, task) in self.tasks.drain() {
            task.cancel.cancel();
            if task.thread.join().is_err() {
                log::error!("task {} panicked", task_id);
            }
        }
    }
}

impl CommandHandler for StorletDaemon {
    fn handle(&mut self, request: Request) -> CommandResponse {
        self.reap_finished();
        match request.command {
            Command::Ping => CommandResponse::success("OK"),
            Command::Execute => self.execute(request).into(),
            Command::Cancel => self.cancel(request.task_id.as_deref()).into(),
            Command::DaemonStatus => CommandResponse::success(format!(
                "{} is running with {} tasks",
                self.storlet_name,
                self.running_tasks()
            )),
            Command::Halt | Command::StopDaemon => {
                CommandResponse::success(format!("{} is stopping", self.storlet_name)).and_stop()
            }
            other => CommandResponse::failure(format!(
                "Command {} is not allowed for this server",
                other
            )),
        }
    }
}

impl Drop for StorletDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

