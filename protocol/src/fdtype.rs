use crate::ProtocolError;
use std::{collections::BTreeMap, convert::TryFrom, fmt, str::FromStr};

/// Role of one descriptor inside a datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FdType {
    InputObject,
    OutputObject,
    OutputObjectMetadata,
    OutputTaskId,
    Logger,
    ServiceOut,
}

const ALL: [FdType; 6] = [
    FdType::InputObject,
    FdType::OutputObject,
    FdType::OutputObjectMetadata,
    FdType::OutputTaskId,
    FdType::Logger,
    FdType::ServiceOut,
];

impl FdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FdType::InputObject => "SBUS_FD_INPUT_OBJECT",
            FdType::OutputObject => "SBUS_FD_OUTPUT_OBJECT",
            FdType::OutputObjectMetadata => "SBUS_FD_OUTPUT_OBJECT_METADATA",
            FdType::OutputTaskId => "SBUS_FD_OUTPUT_TASK_ID",
            FdType::Logger => "SBUS_FD_LOGGER",
            FdType::ServiceOut => "SBUS_FD_SERVICE_OUT",
        }
    }
}

impl fmt::Display for FdType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FdType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL.iter()
            .find(|fdtype| fdtype.as_str() == s)
            .copied()
            .ok_or_else(|| ProtocolError::UnknownFdType(s.to_string()))
    }
}

const TYPE_KEY: &str = "type";

/// Description of one descriptor
///
/// The `storlets` map is reserved for the engine itself (byte range hints,
/// for example). The `storage` map is opaque metadata owned by the caller,
/// typically the user metadata of the object behind the descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdMetadata {
    pub fdtype: FdType,
    pub storlets: BTreeMap<String, String>,
    pub storage: BTreeMap<String, String>,
}

impl FdMetadata {
    pub fn new(fdtype: FdType) -> Self {
        FdMetadata {
            fdtype,
            storlets: BTreeMap::new(),
            storage: BTreeMap::new(),
        }
    }

    pub fn with_storage(mut self, storage: BTreeMap<String, String>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_storlets_value<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.storlets.insert(key.into(), value.into());
        self
    }
}

/// Shape of one metadata entry on the wire, with the type folded into the
/// `storlets` namespace
#[derive(Serialize, Deserialize, Debug, Default)]
pub(crate) struct RawFdMetadata {
    #[serde(default)]
    pub storlets: BTreeMap<String, String>,
    #[serde(default)]
    pub storage: BTreeMap<String, String>,
}

impl From<&FdMetadata> for RawFdMetadata {
    fn from(metadata: &FdMetadata) -> Self {
        let mut storlets = metadata.storlets.clone();
        storlets.insert(TYPE_KEY.to_string(), metadata.fdtype.as_str().to_string());
        RawFdMetadata {
            storlets,
            storage: metadata.storage.clone(),
        }
    }
}

impl TryFrom<RawFdMetadata> for FdMetadata {
    type Error = ProtocolError;

    fn try_from(raw: RawFdMetadata) -> Result<Self, Self::Error> {
        let mut storlets = raw.storlets;
        let fdtype = storlets
            .remove(TYPE_KEY)
            .ok_or(ProtocolError::MissingFdType)?
            .parse()?;
        Ok(FdMetadata {
            fdtype,
            storlets,
            storage: raw.storage,
        })
    }
}
