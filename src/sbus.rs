//! Bus endpoints: datagrams with attached descriptors over Unix sockets
//!
//! Each connection carries exactly one datagram. The sender spreads its
//! descriptors over the first few writes of the encoded payload and hangs up;
//! the receiver reads to end of file and collects the descriptors that
//! arrived alongside.

use crate::{errors::TransportError, fdio};
use fd_queue::{DequeueFd, EnqueueFd, UnixStream};
use std::{
    fs,
    fs::Permissions,
    io,
    io::{Read, Write},
    os::unix::{
        fs::PermissionsExt,
        io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd},
        net,
    },
    path::{Path, PathBuf},
    time::Duration,
};
use storlets_protocol::{codec, Datagram, MAX_MESSAGE_LEN};

/// How long a receiver waits for a connected peer to finish its message
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long [send] waits for the peer to take the whole message
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Descriptors fd-queue attaches to a single write
pub const FDS_PER_WRITE: usize = 2;

/// A bound, listening endpoint
#[derive(Debug)]
pub struct SBus {
    listener: net::UnixListener,
    path: PathBuf,
}

impl SBus {
    /// Bind an endpoint at `path`, replacing any stale socket file left there
    ///
    /// The socket file is made world accessible; access control belongs to
    /// the directory it lives in.
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<Self, TransportError> {
        let path = path.as_ref();
        match fs::remove_file(path) {
            Ok(()) => log::debug!("removed stale endpoint {:?}", path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(endpoint_error(err, path)),
        }
        let listener = net::UnixListener::bind(path).map_err(|err| endpoint_error(err, path))?;
        fs::set_permissions(path, Permissions::from_mode(0o777))?;
        log::info!("listening on {:?}", path);
        Ok(SBus {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until a message is waiting, or until `timeout` passes
    ///
    /// Returns `false` on timeout. Nothing is consumed.
    pub fn listen(&self, timeout: Option<Duration>) -> Result<bool, TransportError> {
        Ok(fdio::poll_readable(self.listener.as_raw_fd(), timeout)?)
    }

    /// Accept and decode the next message
    ///
    /// Every descriptor received is close-on-exec and owned by the returned
    /// datagram, or closed before an error is returned. The flag is set
    /// after the descriptors arrive, so a process that spawns children from
    /// another thread while receiving can leak them into those children.
    pub fn receive(&self) -> Result<Datagram<OwnedFd>, TransportError> {
        let (stream, _) = self.listener.accept()?;
        stream.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
        let mut stream = unsafe { UnixStream::from_raw_fd(stream.into_raw_fd()) };

        let mut payload = Vec::new();
        let mut fds = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let read_result = stream.read(&mut chunk);
            // the stream queues only a couple of descriptors, drain after every read
            while let Some(fd) = stream.dequeue() {
                let fd = unsafe { OwnedFd::from_raw_fd(fd) };
                fdio::set_close_on_exec(fd.as_raw_fd())?;
                fds.push(fd);
            }
            match read_result {
                Ok(0) => break,
                Ok(len) => {
                    payload.extend_from_slice(&chunk[..len]);
                    if payload.len() > MAX_MESSAGE_LEN {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(io_error(err)),
            }
        }

        log::trace!("received {} bytes, {} fds", payload.len(), fds.len());
        Ok(codec::decode(&payload, fds)?)
    }
}

/// Send one datagram to the endpoint at `path`, returning the payload size
pub fn send<P: AsRef<Path>, F: AsRawFd>(
    path: P,
    datagram: &Datagram<F>,
) -> Result<usize, TransportError> {
    send_with_timeout(path, datagram, SEND_TIMEOUT)
}

pub fn send_with_timeout<P: AsRef<Path>, F: AsRawFd>(
    path: P,
    datagram: &Datagram<F>,
    timeout: Duration,
) -> Result<usize, TransportError> {
    let path = path.as_ref();
    let payload = codec::encode(datagram)?;
    log::debug!("<{} to {:?}", datagram.command(), path);

    let stream = net::UnixStream::connect(path).map_err(|err| endpoint_error(err, path))?;
    stream.set_write_timeout(Some(timeout))?;
    let mut stream = unsafe { UnixStream::from_raw_fd(stream.into_raw_fd()) };

    // each write carries at most FDS_PER_WRITE descriptors, so the first
    // writes send one payload byte apiece and the last one sends the rest
    let batches = datagram.fds().chunks(FDS_PER_WRITE);
    let last = batches.len().saturating_sub(1);
    let mut offset = 0;
    for (index, batch) in batches.enumerate() {
        for fd in batch {
            stream.enqueue(fd)?;
        }
        let end = if index == last {
            payload.len()
        } else {
            (offset + 1).min(payload.len())
        };
        if end == offset {
            return Err(TransportError::PartialWrite);
        }
        stream.write_all(&payload[offset..end]).map_err(io_error)?;
        offset = end;
    }
    if offset < payload.len() {
        stream.write_all(&payload[offset..]).map_err(io_error)?;
    }
    stream.flush().map_err(io_error)?;
    Ok(payload.len())
}

fn endpoint_error(err: io::Error, path: &Path) -> TransportError {
    match err.raw_os_error() {
        Some(libc::ENOENT) | Some(libc::ECONNREFUSED) => {
            TransportError::EndpointNotFound(path.to_path_buf())
        }
        Some(libc::EACCES) | Some(libc::EPERM) => {
            TransportError::PermissionDenied(path.to_path_buf())
        }
        _ => TransportError::IOError(err),
    }
}

fn io_error(err: io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout,
        io::ErrorKind::WriteZero => TransportError::PartialWrite,
        _ => TransportError::IOError(err),
    }
}
