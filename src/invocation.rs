//! Gateway side of one storlet execution
//!
//! The protocol creates pipes for the output body, the output metadata and
//! the task id, sends EXECUTE to the storlet's worker endpoint with the
//! remote pipe ends attached, feeds any streamed input from a writer task and
//! hands the output back as a stream. Every wait is bounded; once the daemon
//! has assigned a task id, a timeout also cancels the task on the daemon.

use crate::{client::SBusClient, errors::InvocationError, fdio, sbus};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use std::{
    collections::BTreeMap,
    fs::File,
    io,
    ops::Range,
    os::unix::io::OwnedFd,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use storlets_protocol::{Command, Datagram, FdMetadata, FdType, Params};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::unix::pipe,
    task,
    task::JoinHandle,
    time::timeout,
};

/// Largest metadata blob a storlet may return
pub const MAX_METADATA_SIZE: usize = 4096;

/// Size of the chunks moved through input and output pipes
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Input body of a storlet request
pub enum StorletData {
    /// An open descriptor, passed to the daemon as is
    Fd(OwnedFd),
    /// Chunks streamed through a pipe by a writer task
    Stream(BoxStream<'static, io::Result<Vec<u8>>>),
}

impl StorletData {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let chunks: Vec<io::Result<Vec<u8>>> = bytes
            .chunks(CHUNK_SIZE)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        StorletData::Stream(stream::iter(chunks).boxed())
    }

    pub fn from_stream<S>(chunks: S) -> Self
    where
        S: Stream<Item = io::Result<Vec<u8>>> + Send + 'static,
    {
        StorletData::Stream(chunks.boxed())
    }
}

/// An additional input for multi-input storlets
pub struct ExtraData {
    pub user_metadata: BTreeMap<String, String>,
    pub data: BoxStream<'static, io::Result<Vec<u8>>>,
}

/// Everything needed to run one storlet over one object
pub struct StorletRequest {
    pub storlet_id: String,
    pub params: Params,
    pub user_metadata: BTreeMap<String, String>,
    pub data: StorletData,
    pub range: Option<Range<u64>>,
    pub extra_data: Vec<ExtraData>,
    pub storlet_main: String,
    pub language: String,
    pub language_version: Option<String>,
    pub dependencies: Vec<String>,
}

impl StorletRequest {
    pub fn new<S: Into<String>>(storlet_id: S, data: StorletData) -> Self {
        let storlet_id = storlet_id.into();
        StorletRequest {
            storlet_main: storlet_id.clone(),
            storlet_id,
            params: Params::new(),
            user_metadata: BTreeMap::new(),
            data,
            range: None,
            extra_data: Vec::new(),
            language: "java".to_string(),
            language_version: None,
            dependencies: Vec::new(),
        }
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn user_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.user_metadata = metadata;
        self
    }

    /// Only run over `range` of the input. Needs a seekable descriptor input.
    pub fn range(mut self, range: Range<u64>) -> Self {
        self.range = Some(range);
        self
    }

    pub fn extra_data(mut self, extra: ExtraData) -> Self {
        self.extra_data.push(extra);
        self
    }

    pub fn language<S: Into<String>>(mut self, language: S, version: Option<String>) -> Self {
        self.language = language.into();
        self.language_version = version;
        self
    }

    pub fn storlet_main<S: Into<String>>(mut self, main: S) -> Self {
        self.storlet_main = main.into();
        self
    }

    pub fn dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

struct CancelState {
    sent: AtomicBool,
    storlet_pipe_path: PathBuf,
    task_id: String,
}

/// Cancels a running task on its daemon, at most once
///
/// Clones share state; whichever fires first sends the CANCEL.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    fn new(storlet_pipe_path: &Path, task_id: String) -> Self {
        CancelToken {
            state: Arc::new(CancelState {
                sent: AtomicBool::new(false),
                storlet_pipe_path: storlet_pipe_path.to_path_buf(),
                task_id,
            }),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.state.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.sent.load(Ordering::SeqCst)
    }

    /// Ask the daemon to cancel the task. Does nothing if it was already asked.
    pub async fn cancel(self) {
        self.fire().await
    }

    async fn fire(&self) {
        if self.state.sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = SBusClient::new(&self.state.storlet_pipe_path);
        let task_id = self.state.task_id.clone();
        let result = task::spawn_blocking(move || client.cancel(&task_id)).await;
        match result {
            Ok(Ok(response)) if response.status => {
                log::info!("cancelled task {}", self.state.task_id)
            }
            Ok(Ok(response)) => log::warn!(
                "task {} timed out, but failed to get canceled: {}",
                self.state.task_id,
                response.message
            ),
            Ok(Err(err)) => log::warn!(
                "task {} timed out, but failed to get canceled: {}",
                self.state.task_id,
                err
            ),
            Err(err) => log::warn!("cancel task for {} failed: {}", self.state.task_id, err),
        }
    }
}

/// Output body of a running task
///
/// Single pass. Each read is bounded by the invocation timeout; a timeout
/// cancels the task.
pub struct StorletOutput {
    receiver: pipe::Receiver,
    timeout: Duration,
    cancel: CancelToken,
    done: bool,
}

impl StorletOutput {
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, InvocationError> {
        if self.done {
            return Ok(None);
        }
        let mut buf = vec![0u8; CHUNK_SIZE];
        match timeout(self.timeout, self.receiver.read(&mut buf)).await {
            Err(_) => {
                self.done = true;
                self.cancel.fire().await;
                Err(InvocationError::Timeout)
            }
            Ok(Ok(0)) => {
                self.done = true;
                Ok(None)
            }
            Ok(Ok(len)) => {
                buf.truncate(len);
                Ok(Some(buf))
            }
            Ok(Err(err)) => {
                self.done = true;
                Err(err.into())
            }
        }
    }

    pub async fn read_to_end(mut self) -> Result<Vec<u8>, InvocationError> {
        let mut bytes = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<u8>, InvocationError>> {
        stream::unfold(self, |mut output| async move {
            match output.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), output)),
                Ok(None) => None,
                Err(err) => Some((Err(err), output)),
            }
        })
    }
}

/// Result of a successful EXECUTE: metadata is complete, the body is ready
/// to be read
pub struct StorletResponse {
    pub task_id: String,
    pub metadata: BTreeMap<String, String>,
    pub data: StorletOutput,
    pub cancel: CancelToken,
}

/// Drives one storlet execution against a worker endpoint
pub struct StorletInvocationProtocol {
    request: StorletRequest,
    storlet_pipe_path: PathBuf,
    log_path: PathBuf,
    timeout: Duration,
}

impl StorletInvocationProtocol {
    pub fn new<P: AsRef<Path>, L: AsRef<Path>>(
        request: StorletRequest,
        storlet_pipe_path: P,
        log_path: L,
        timeout: Duration,
    ) -> Self {
        StorletInvocationProtocol {
            request,
            storlet_pipe_path: storlet_pipe_path.as_ref().to_path_buf(),
            log_path: log_path.as_ref().to_path_buf(),
            timeout,
        }
    }

    pub async fn communicate(self) -> Result<StorletResponse, InvocationError> {
        let StorletInvocationProtocol {
            request,
            storlet_pipe_path,
            log_path,
            timeout: limit,
        } = self;

        let log_fd = open_log(&log_path).await?;
        let (task_id_read, task_id_write) = fdio::pipe()?;
        let (data_read, data_write) = fdio::pipe()?;
        let (metadata_read, metadata_write) = fdio::pipe()?;

        let mut input_metadata =
            FdMetadata::new(FdType::InputObject).with_storage(request.user_metadata);
        if let Some(range) = &request.range {
            input_metadata = input_metadata
                .with_storlets_value("start", range.start.to_string())
                .with_storlets_value("end", range.end.to_string());
        }

        let mut writers = Vec::new();
        let input_fd = match request.data {
            StorletData::Fd(fd) => fd,
            StorletData::Stream(chunks) => {
                let (read, write) = fdio::pipe()?;
                writers.push((write, chunks));
                read
            }
        };

        let mut fds = vec![task_id_write, input_fd, data_write, metadata_write, log_fd];
        let mut metadata = vec![
            FdMetadata::new(FdType::OutputTaskId),
            input_metadata,
            FdMetadata::new(FdType::OutputObject),
            FdMetadata::new(FdType::OutputObjectMetadata),
            FdMetadata::new(FdType::Logger),
        ];
        for extra in request.extra_data {
            let (read, write) = fdio::pipe()?;
            fds.push(read);
            metadata.push(FdMetadata::new(FdType::InputObject).with_storage(extra.user_metadata));
            writers.push((write, extra.data));
        }

        let datagram = Datagram::new(Command::Execute, fds, metadata, Some(request.params), None)?;
        let endpoint = storlet_pipe_path.clone();
        // the datagram owns every remote side descriptor; they close when it drops
        task::spawn_blocking(move || sbus::send(&endpoint, &datagram)).await??;
        log::debug!("sent execute for {} to {:?}", request.storlet_id, storlet_pipe_path);

        let task_id = read_task_id(task_id_read, limit).await?;
        log::debug!("storlet {} running as task {}", request.storlet_id, task_id);
        let cancel = CancelToken::new(&storlet_pipe_path, task_id.clone());

        let mut handles = Vec::new();
        for (write, chunks) in writers {
            let sender = pipe::Sender::from_file(File::from(write))?;
            handles.push(tokio::spawn(write_input(sender, chunks, limit)));
        }

        match wait_for_output(metadata_read, data_read, limit).await {
            Ok((metadata, receiver)) => Ok(StorletResponse {
                task_id,
                metadata,
                data: StorletOutput {
                    receiver,
                    timeout: limit,
                    cancel: cancel.clone(),
                    done: false,
                },
                cancel,
            }),
            Err(err) => {
                abort_all(&handles);
                if let InvocationError::Timeout = err {
                    cancel.fire().await;
                }
                Err(err)
            }
        }
    }
}

async fn open_log(path: &Path) -> Result<OwnedFd, InvocationError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(OwnedFd::from(file.into_std().await))
}

async fn read_task_id(fd: OwnedFd, limit: Duration) -> Result<String, InvocationError> {
    let mut receiver = pipe::Receiver::from_file(File::from(fd))?;
    let mut bytes = Vec::new();
    let mut limited = (&mut receiver).take(64);
    match timeout(limit, limited.read_to_end(&mut bytes)).await {
        Err(_) => return Err(InvocationError::Timeout),
        Ok(result) => result?,
    };
    let task_id = String::from_utf8_lossy(&bytes).trim().to_string();
    if task_id.is_empty() {
        Err(InvocationError::NoTaskId)
    } else {
        Ok(task_id)
    }
}

async fn wait_for_output(
    metadata_fd: OwnedFd,
    data_fd: OwnedFd,
    limit: Duration,
) -> Result<(BTreeMap<String, String>, pipe::Receiver), InvocationError> {
    let mut metadata_receiver = pipe::Receiver::from_file(File::from(metadata_fd))?;
    let mut bytes = Vec::new();
    let mut limited = (&mut metadata_receiver).take(MAX_METADATA_SIZE as u64 + 1);
    match timeout(limit, limited.read_to_end(&mut bytes)).await {
        Err(_) => return Err(InvocationError::Timeout),
        Ok(result) => result?,
    };
    if bytes.len() > MAX_METADATA_SIZE {
        return Err(InvocationError::MetadataTooLarge(MAX_METADATA_SIZE));
    }
    let metadata: BTreeMap<String, String> = serde_json::from_slice(&bytes)?;

    let data_receiver = pipe::Receiver::from_file(File::from(data_fd))?;
    let ready = timeout(limit, data_receiver.readable()).await;
    match ready {
        Err(_) => Err(InvocationError::Timeout),
        Ok(result) => {
            result?;
            Ok((metadata, data_receiver))
        }
    }
}

async fn write_input(
    mut sender: pipe::Sender,
    mut chunks: BoxStream<'static, io::Result<Vec<u8>>>,
    limit: Duration,
) {
    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                log::warn!("input source failed: {}", err);
                return;
            }
        };
        match timeout(limit, sender.write_all(&chunk)).await {
            Err(_) => {
                log::warn!("timed out writing storlet input");
                return;
            }
            Ok(Err(err)) => {
                log::warn!("failed to write storlet input: {}", err);
                return;
            }
            Ok(Ok(())) => {}
        }
    }
    if let Err(err) = sender.flush().await {
        log::debug!("failed to flush storlet input: {}", err);
    }
}

fn abort_all(handles: &[JoinHandle<()>]) {
    for handle in handles {
        handle.abort();
    }
}
