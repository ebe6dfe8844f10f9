use crate::{Command, FdMetadata, FdType, ProtocolError, MAX_FDS};
use std::collections::BTreeMap;

/// Flat string parameters attached to a command
pub type Params = BTreeMap<String, String>;

/// Descriptor roles an EXECUTE datagram starts with, in order. Any further
/// descriptors must be additional inputs.
pub const EXECUTE_FD_TYPES: [FdType; 5] = [
    FdType::OutputTaskId,
    FdType::InputObject,
    FdType::OutputObject,
    FdType::OutputObjectMetadata,
    FdType::Logger,
];

/// One descriptor with its metadata, as handed out by [Datagram::into_parts]
#[derive(Debug)]
pub struct SBusFile<F> {
    pub fd: F,
    pub metadata: FdMetadata,
}

/// A command plus the descriptors that travel with it
///
/// Generic over the descriptor type: senders usually hold borrowed or raw
/// descriptors, receivers get owned ones. Every constructor checks that each
/// descriptor has exactly one metadata entry, and that the descriptor roles
/// fit the command.
#[derive(Debug)]
pub struct Datagram<F> {
    command: Command,
    fds: Vec<F>,
    metadata: Vec<FdMetadata>,
    params: Option<Params>,
    task_id: Option<String>,
}

impl<F> Datagram<F> {
    pub fn new(
        command: Command,
        fds: Vec<F>,
        metadata: Vec<FdMetadata>,
        params: Option<Params>,
        task_id: Option<String>,
    ) -> Result<Self, ProtocolError> {
        if fds.len() != metadata.len() {
            return Err(ProtocolError::LengthMismatch {
                fds: fds.len(),
                metadata: metadata.len(),
            });
        }
        if fds.len() > MAX_FDS {
            return Err(ProtocolError::TooManyFds(fds.len()));
        }
        check_fd_types(command, &metadata)?;
        Ok(Datagram {
            command,
            fds,
            metadata,
            params,
            task_id,
        })
    }

    /// Build a service datagram whose only descriptor is the reply channel
    pub fn service(
        command: Command,
        service_out: F,
        params: Option<Params>,
        task_id: Option<String>,
    ) -> Result<Self, ProtocolError> {
        Datagram::new(
            command,
            vec![service_out],
            vec![FdMetadata::new(FdType::ServiceOut)],
            params,
            task_id,
        )
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn fds(&self) -> &[F] {
        &self.fds
    }

    pub fn metadata(&self) -> &[FdMetadata] {
        &self.metadata
    }

    pub fn params(&self) -> Option<&Params> {
        self.params.as_ref()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .as_ref()
            .and_then(|params| params.get(key))
            .map(String::as_str)
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    /// First descriptor with the given role
    pub fn fd_of_type(&self, fdtype: FdType) -> Option<&F> {
        self.metadata
            .iter()
            .position(|metadata| metadata.fdtype == fdtype)
            .map(|index| &self.fds[index])
    }

    /// Take the datagram apart, pairing each descriptor with its metadata
    pub fn into_parts(self) -> (Command, Vec<SBusFile<F>>, Option<Params>, Option<String>) {
        let files = self
            .fds
            .into_iter()
            .zip(self.metadata.into_iter())
            .map(|(fd, metadata)| SBusFile { fd, metadata })
            .collect();
        (self.command, files, self.params, self.task_id)
    }
}

fn check_fd_types(command: Command, metadata: &[FdMetadata]) -> Result<(), ProtocolError> {
    let types: Vec<FdType> = metadata.iter().map(|metadata| metadata.fdtype).collect();
    let valid = match command {
        Command::Nop => true,
        Command::Execute => {
            types.len() >= EXECUTE_FD_TYPES.len()
                && types[..EXECUTE_FD_TYPES.len()] == EXECUTE_FD_TYPES
                && types[EXECUTE_FD_TYPES.len()..]
                    .iter()
                    .all(|fdtype| *fdtype == FdType::InputObject)
        }
        _ => types.first() == Some(&FdType::ServiceOut),
    };
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::FdTypeMismatch {
            command,
            found: types,
        })
    }
}
