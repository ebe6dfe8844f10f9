//! The file handles a storlet sees while running inside a worker daemon

use crate::{daemon::CancelFlag, errors::StorletError};
use std::{
    collections::BTreeMap,
    fs::File,
    io,
    io::{Read, Seek, SeekFrom, Write},
    os::unix::io::OwnedFd,
};
use storlets_protocol::SBusFile;

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Other, StorletError::Cancelled)
}

/// One input object, optionally limited to a byte range
///
/// Reads fail once the task has been cancelled.
pub struct StorletInputFile {
    reader: io::Take<File>,
    metadata: BTreeMap<String, String>,
    cancel: CancelFlag,
}

impl StorletInputFile {
    pub fn new(fd: OwnedFd, metadata: BTreeMap<String, String>, cancel: CancelFlag) -> Self {
        StorletInputFile {
            reader: File::from(fd).take(u64::MAX),
            metadata,
            cancel,
        }
    }

    /// Only bytes `start..end` of the underlying file are readable. The
    /// descriptor must be seekable.
    pub fn with_range(
        fd: OwnedFd,
        metadata: BTreeMap<String, String>,
        start: u64,
        end: u64,
        cancel: CancelFlag,
    ) -> io::Result<Self> {
        let mut file = File::from(fd);
        file.seek(SeekFrom::Start(start))?;
        Ok(StorletInputFile {
            reader: file.take(end.saturating_sub(start)),
            metadata,
            cancel,
        })
    }

    /// Wrap a received INPUT_OBJECT descriptor, honoring `start`/`end` hints
    pub fn from_sbus_file(file: SBusFile<OwnedFd>, cancel: CancelFlag) -> Result<Self, StorletError> {
        let SBusFile { fd, metadata } = file;
        let range = (metadata.storlets.get("start"), metadata.storlets.get("end"));
        match range {
            (Some(start), Some(end)) => {
                let start = parse_offset(start)?;
                let end = parse_offset(end)?;
                Ok(StorletInputFile::with_range(fd, metadata.storage, start, end, cancel)?)
            }
            _ => Ok(StorletInputFile::new(fd, metadata.storage, cancel)),
        }
    }

    /// Caller supplied metadata of the input object
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

fn parse_offset(value: &str) -> Result<u64, StorletError> {
    value
        .parse()
        .map_err(|_| StorletError::Failed(format!("invalid range offset {:?}", value)))
}

impl Read for StorletInputFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }
        self.reader.read(buf)
    }
}

/// The output object and its metadata channel
///
/// Metadata goes out first, exactly once; body writes before that fail.
pub struct StorletOutputFile {
    data: File,
    metadata_file: Option<File>,
    metadata: Option<BTreeMap<String, String>>,
    cancel: CancelFlag,
}

impl StorletOutputFile {
    pub fn new(data: OwnedFd, metadata: OwnedFd, cancel: CancelFlag) -> Self {
        StorletOutputFile {
            data: File::from(data),
            metadata_file: Some(File::from(metadata)),
            metadata: None,
            cancel,
        }
    }

    pub fn set_metadata(&mut self, metadata: BTreeMap<String, String>) -> Result<(), StorletError> {
        let mut file = self
            .metadata_file
            .take()
            .ok_or(StorletError::MetadataAlreadySet)?;
        file.write_all(&serde_json::to_vec(&metadata)?)?;
        self.metadata = Some(metadata);
        Ok(())
    }

    pub fn metadata(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata.as_ref()
    }
}

impl Write for StorletOutputFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }
        if self.metadata_file.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                StorletError::MetadataNotSet,
            ));
        }
        self.data.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.data.flush()
    }
}

/// Per-task log channel back to the gateway
pub struct StorletLogger {
    storlet_name: String,
    file: File,
}

impl StorletLogger {
    pub fn new<S: Into<String>>(storlet_name: S, fd: OwnedFd) -> Self {
        StorletLogger {
            storlet_name: storlet_name.into(),
            file: File::from(fd),
        }
    }

    fn emit(&mut self, level: &str, message: &str) {
        if let Err(err) = writeln!(self.file, "{} {}: {}", self.storlet_name, level, message) {
            log::warn!("storlet log for {} is unavailable: {}", self.storlet_name, err);
        }
    }

    pub fn debug(&mut self, message: &str) {
        self.emit("DEBUG", message)
    }

    pub fn info(&mut self, message: &str) {
        self.emit("INFO", message)
    }

    pub fn warn(&mut self, message: &str) {
        self.emit("WARN", message)
    }

    pub fn error(&mut self, message: &str) {
        self.emit("ERROR", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdio;
    use storlets_protocol::{FdMetadata, FdType};

    fn file_with(contents: &[u8]) -> OwnedFd {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(contents).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        OwnedFd::from(file)
    }

    fn read_all(fd: OwnedFd) -> Vec<u8> {
        let mut bytes = Vec::new();
        File::from(fd).read_to_end(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn range_input() {
        let metadata = FdMetadata::new(FdType::InputObject)
            .with_storlets_value("start", "3")
            .with_storlets_value("end", "8");
        let file = SBusFile {
            fd: file_with(b"0123456789"),
            metadata,
        };
        let mut input = StorletInputFile::from_sbus_file(file, CancelFlag::default()).unwrap();
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"34567");
    }

    #[test]
    fn cancelled_input() {
        let cancel = CancelFlag::default();
        let mut input = StorletInputFile::new(file_with(b"abc"), BTreeMap::new(), cancel.clone());
        cancel.cancel();
        let mut bytes = Vec::new();
        assert!(input.read_to_end(&mut bytes).is_err());
    }

    #[test]
    fn output_metadata_first_and_once() {
        let (data_read, data_write) = fdio::pipe().unwrap();
        let (md_read, md_write) = fdio::pipe().unwrap();
        let mut output = StorletOutputFile::new(data_write, md_write, CancelFlag::default());

        assert!(output.write_all(b"too early").is_err());
        let mut metadata = BTreeMap::new();
        metadata.insert("color".to_string(), "green".to_string());
        output.set_metadata(metadata.clone()).unwrap();
        assert!(matches!(
            output.set_metadata(metadata.clone()),
            Err(StorletError::MetadataAlreadySet)
        ));
        output.write_all(b"body").unwrap();
        assert_eq!(output.metadata(), Some(&metadata));
        drop(output);

        assert_eq!(read_all(md_read), br#"{"color":"green"}"#.to_vec());
        assert_eq!(read_all(data_read), b"body".to_vec());
    }

    #[test]
    fn logger_format() {
        let (read, write) = fdio::pipe().unwrap();
        let mut logger = StorletLogger::new("half", write);
        logger.info("invoked");
        logger.error("broken");
        drop(logger);
        assert_eq!(read_all(read), b"half INFO: invoked\nhalf ERROR: broken\n".to_vec());
    }
}
