use futures_util::stream::{self, StreamExt};
use std::{
    collections::BTreeMap,
    io,
    io::Write,
    os::unix::io::OwnedFd,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    thread::JoinHandle,
    time::Duration,
};
use storlets::{
    daemon::{IdentityStorlet, Storlet, StorletDaemon},
    errors::{InvocationError, StorletError},
    fdio,
    files::{StorletInputFile, StorletLogger, StorletOutputFile},
    invocation::{ExtraData, StorletData, StorletInvocationProtocol, StorletRequest},
    protocol::{Command, Params, SBusFile},
    sbus::SBus,
    server::{self, CommandHandler, CommandResponse, Request},
    SBusClient,
};
use tokio::runtime::Runtime;

const TIMEOUT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A worker daemon served from a thread of the test process
struct Worker<H> {
    path: PathBuf,
    thread: Option<JoinHandle<H>>,
}

impl<H: CommandHandler + Send + 'static> Worker<H> {
    fn serve(path: &Path, mut handler: H) -> Self {
        let bus = SBus::bind(path).unwrap();
        let thread = thread::spawn(move || {
            server::main_loop(&bus, &mut handler).unwrap();
            handler
        });
        Worker {
            path: path.to_path_buf(),
            thread: Some(thread),
        }
    }

    fn halt(mut self) -> H {
        SBusClient::new(&self.path).halt().unwrap();
        self.thread.take().unwrap().join().unwrap()
    }
}

fn identity_worker(path: &Path) -> Worker<StorletDaemon> {
    Worker::serve(path, StorletDaemon::new("identity", Arc::new(IdentityStorlet), 2))
}

fn metadata(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

#[test]
fn identity_round_trip_10mb() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let pipe = dir.path().join("identity");
    let worker = identity_worker(&pipe);

    let body: Vec<u8> = (0..10 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let mut params = Params::new();
    params.insert("test_param".to_string(), "42".to_string());
    let request = StorletRequest::new("identity-1.0.jar", StorletData::from_bytes(body.clone()))
        .params(params)
        .user_metadata(metadata(&[("color", "blue")]));

    let log_path = dir.path().join("logs").join("storlet_invoke.log");
    let protocol = StorletInvocationProtocol::new(request, &pipe, &log_path, TIMEOUT);
    let (response_metadata, output) = Runtime::new().unwrap().block_on(async {
        let response = protocol.communicate().await.unwrap();
        assert_eq!(response.task_id.len(), 8);
        assert_eq!(response.cancel.task_id(), response.task_id);
        let output = response.data.read_to_end().await.unwrap();
        (response.metadata, output)
    });

    assert_eq!(
        response_metadata,
        metadata(&[
            ("color", "blue"),
            ("execution-result", "identity"),
            ("test-param", "42"),
        ])
    );
    assert_eq!(output.len(), body.len());
    assert!(output == body);

    worker.halt();
    let log = std::fs::read_to_string(&log_path).unwrap();
    assert!(log.contains("identity INFO: identity invoked"));
}

#[test]
fn range_of_a_file() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let pipe = dir.path().join("identity");
    let worker = identity_worker(&pipe);

    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"abcdefghij").unwrap();
    let request = StorletRequest::new("identity", StorletData::Fd(OwnedFd::from(file))).range(2..6);
    let protocol =
        StorletInvocationProtocol::new(request, &pipe, dir.path().join("log"), TIMEOUT);
    let output = Runtime::new().unwrap().block_on(async {
        let response = protocol.communicate().await.unwrap();
        response.data.read_to_end().await.unwrap()
    });
    assert_eq!(output, b"cdef");
    worker.halt();
}

#[test]
fn extra_inputs_are_streamed() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let pipe = dir.path().join("identity");
    let worker = identity_worker(&pipe);

    let chunks: Vec<io::Result<Vec<u8>>> = vec![Ok(b"first ".to_vec()), Ok(b"input".to_vec())];
    let extra: Vec<io::Result<Vec<u8>>> = vec![Ok(b", second input".to_vec())];
    let request = StorletRequest::new("identity", StorletData::from_stream(stream::iter(chunks)))
        .extra_data(ExtraData {
            user_metadata: metadata(&[("part", "2")]),
            data: stream::iter(extra).boxed(),
        });
    let protocol =
        StorletInvocationProtocol::new(request, &pipe, dir.path().join("log"), TIMEOUT);
    let output = Runtime::new().unwrap().block_on(async {
        let response = protocol.communicate().await.unwrap();
        let mut output = Vec::new();
        let mut chunks = Box::pin(response.data.into_stream());
        while let Some(chunk) = chunks.next().await {
            output.extend_from_slice(&chunk.unwrap());
        }
        output
    });
    assert_eq!(output, b"first input, second input");
    worker.halt();
}

/// Accepts EXECUTE, hands out a task id, never produces output
#[derive(Default)]
struct StuckWorker {
    assign_task_ids: bool,
    held: Vec<SBusFile<OwnedFd>>,
    cancelled: Vec<String>,
}

impl CommandHandler for StuckWorker {
    fn handle(&mut self, request: Request) -> CommandResponse {
        match request.command {
            Command::Execute => {
                let mut files = request.files;
                if self.assign_task_ids {
                    fdio::write_and_close(files.remove(0).fd, b"deadbeef").unwrap();
                    self.held.extend(files);
                }
                CommandResponse::success("")
            }
            Command::Cancel => {
                self.cancelled.push(request.task_id.unwrap_or_default());
                CommandResponse::success("Cancelled")
            }
            Command::Halt => CommandResponse::success("bye").and_stop(),
            other => CommandResponse::failure(format!("unexpected {}", other)),
        }
    }
}

#[test]
fn timeout_cancels_exactly_once() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let pipe = dir.path().join("stuck");
    let worker = Worker::serve(
        &pipe,
        StuckWorker {
            assign_task_ids: true,
            ..StuckWorker::default()
        },
    );

    let request = StorletRequest::new("stuck", StorletData::from_bytes(b"input".to_vec()));
    let protocol = StorletInvocationProtocol::new(
        request,
        &pipe,
        dir.path().join("log"),
        Duration::from_millis(300),
    );
    let result = Runtime::new().unwrap().block_on(protocol.communicate());
    assert!(matches!(result, Err(InvocationError::Timeout)));

    let worker = worker.halt();
    assert_eq!(worker.cancelled, vec!["deadbeef".to_string()]);
}

#[test]
fn missing_task_id() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let pipe = dir.path().join("stuck");
    let worker = Worker::serve(&pipe, StuckWorker::default());

    let request = StorletRequest::new("stuck", StorletData::from_bytes(Vec::new()));
    let protocol = StorletInvocationProtocol::new(request, &pipe, dir.path().join("log"), TIMEOUT);
    let result = Runtime::new().unwrap().block_on(protocol.communicate());
    assert!(matches!(result, Err(InvocationError::NoTaskId)));
    assert!(worker.halt().cancelled.is_empty());
}

#[test]
fn no_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let request = StorletRequest::new("nobody", StorletData::from_bytes(Vec::new()));
    let protocol = StorletInvocationProtocol::new(
        request,
        dir.path().join("nobody"),
        dir.path().join("log"),
        TIMEOUT,
    );
    let result = Runtime::new().unwrap().block_on(protocol.communicate());
    assert!(matches!(result, Err(InvocationError::Transport(_))));
}

struct ChattyStorlet;

impl Storlet for ChattyStorlet {
    fn execute(
        &self,
        _inputs: Vec<StorletInputFile>,
        mut output: StorletOutputFile,
        _params: &Params,
        _logger: &mut StorletLogger,
    ) -> Result<(), StorletError> {
        output.set_metadata(metadata(&[("big", "x".repeat(5000).as_str())]))
    }
}

#[test]
fn oversized_metadata() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let pipe = dir.path().join("chatty");
    let worker = Worker::serve(&pipe, StorletDaemon::new("chatty", Arc::new(ChattyStorlet), 1));

    let request = StorletRequest::new("chatty", StorletData::from_bytes(Vec::new()));
    let protocol = StorletInvocationProtocol::new(request, &pipe, dir.path().join("log"), TIMEOUT);
    let result = Runtime::new().unwrap().block_on(protocol.communicate());
    assert!(matches!(result, Err(InvocationError::MetadataTooLarge(4096))));
    worker.halt();
}
