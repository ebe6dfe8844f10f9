//! Byte encoding of a datagram
//!
//! The payload starts with three little-endian `u32` values: the number of
//! descriptors, the length of the metadata blob and the length of the command
//! blob. Both blobs are JSON. Metadata is an object keyed by descriptor index
//! (`"0"`, `"1"`, ...). The command blob holds `command`, and `params` and
//! `task_id` when present. Descriptors travel out of band.

use crate::{
    fdtype::RawFdMetadata, Command, Datagram, FdMetadata, Params, ProtocolError, MAX_MESSAGE_LEN,
};
use std::{
    collections::BTreeMap,
    convert::{TryFrom, TryInto},
};

pub const HEADER_LEN: usize = 12;

#[derive(Serialize, Deserialize, Debug)]
struct RawCommand {
    command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task_id: Option<String>,
}

pub fn encode<F>(datagram: &Datagram<F>) -> Result<Vec<u8>, ProtocolError> {
    let metadata: BTreeMap<String, RawFdMetadata> = datagram
        .metadata()
        .iter()
        .enumerate()
        .map(|(index, metadata)| (index.to_string(), RawFdMetadata::from(metadata)))
        .collect();
    let metadata = serde_json::to_vec(&metadata)?;
    let command = serde_json::to_vec(&RawCommand {
        command: datagram.command().as_str().to_string(),
        params: datagram.params().cloned(),
        task_id: datagram.task_id().map(str::to_string),
    })?;

    let total = HEADER_LEN + metadata.len() + command.len();
    if total > MAX_MESSAGE_LEN {
        return Err(ProtocolError::MessageTooLarge(total));
    }
    let mut bytes = Vec::with_capacity(total);
    bytes.extend_from_slice(&(datagram.fds().len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(command.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&metadata);
    bytes.extend_from_slice(&command);
    Ok(bytes)
}

pub fn decode<F>(bytes: &[u8], fds: Vec<F>) -> Result<Datagram<F>, ProtocolError> {
    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(ProtocolError::MessageTooLarge(bytes.len()));
    }
    if bytes.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated {
            expected: HEADER_LEN,
            found: bytes.len(),
        });
    }
    let n_files = header_field(bytes, 0);
    let metadata_len = header_field(bytes, 1);
    let command_len = header_field(bytes, 2);

    let expected = HEADER_LEN
        .checked_add(metadata_len)
        .and_then(|len| len.checked_add(command_len))
        .unwrap_or(usize::MAX);
    if bytes.len() < expected {
        return Err(ProtocolError::Truncated {
            expected,
            found: bytes.len(),
        });
    }
    if bytes.len() > expected {
        return Err(ProtocolError::TrailingBytes(bytes.len() - expected));
    }
    if n_files != fds.len() {
        return Err(ProtocolError::FdCountMismatch {
            expected: n_files,
            received: fds.len(),
        });
    }

    let metadata_blob = &bytes[HEADER_LEN..HEADER_LEN + metadata_len];
    let command_blob = &bytes[HEADER_LEN + metadata_len..];

    let raw_metadata: BTreeMap<String, RawFdMetadata> = if metadata_blob.is_empty() {
        BTreeMap::new()
    } else {
        serde_json::from_slice(metadata_blob)?
    };
    let metadata = metadata_in_order(raw_metadata)?;

    let raw_command: RawCommand = serde_json::from_slice(command_blob)?;
    let command: Command = raw_command.command.parse()?;

    Datagram::new(command, fds, metadata, raw_command.params, raw_command.task_id)
}

fn header_field(bytes: &[u8], index: usize) -> usize {
    let start = index * 4;
    let mut field = [0u8; 4];
    field.copy_from_slice(&bytes[start..start + 4]);
    u32::from_le_bytes(field).try_into().unwrap_or(usize::MAX)
}

fn metadata_in_order(
    raw: BTreeMap<String, RawFdMetadata>,
) -> Result<Vec<FdMetadata>, ProtocolError> {
    let count = raw.len();
    let mut slots: Vec<Option<FdMetadata>> = (0..count).map(|_| None).collect();
    for (key, value) in raw {
        let index: usize = key
            .parse()
            .map_err(|_| ProtocolError::InvalidMetadataIndex(key.clone()))?;
        if index >= count || slots[index].is_some() {
            return Err(ProtocolError::InvalidMetadataIndex(key));
        }
        slots[index] = Some(FdMetadata::try_from(value)?);
    }
    Ok(slots.into_iter().flatten().collect())
}
