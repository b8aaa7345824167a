//! Fixed-length network identifiers.
//!
//! Every participant is addressed by a 33-byte identifier: 32 opaque bytes
//! followed by one type byte. A node and its co-located gateway share the
//! same 32 data bytes and differ only in the type byte, which is what lets
//! the directory keep the two lists positionally aligned.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of the opaque data portion of an identifier.
pub const ID_DATA_LEN: usize = 32;

/// Total identifier length: data bytes plus the trailing type byte.
pub const ID_LEN: usize = ID_DATA_LEN + 1;

/// The kind of participant an identifier refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IdType {
    Node,
    Gateway,
    Permissioning,
}

impl IdType {
    pub fn as_byte(self) -> u8 {
        match self {
            IdType::Node => 0,
            IdType::Gateway => 1,
            IdType::Permissioning => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<IdType> {
        match b {
            0 => Some(IdType::Node),
            1 => Some(IdType::Gateway),
            2 => Some(IdType::Permissioning),
            _ => None,
        }
    }
}

/// A 33-byte participant identifier with a trailing type tag.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    /// Build an identifier from its data bytes and type tag.
    pub fn new(data: [u8; ID_DATA_LEN], id_type: IdType) -> NodeId {
        let mut raw = [0u8; ID_LEN];
        raw[..ID_DATA_LEN].copy_from_slice(&data);
        raw[ID_DATA_LEN] = id_type.as_byte();
        NodeId(raw)
    }

    /// Parse a raw 33-byte identifier. Fails on a bad length or type byte.
    pub fn from_bytes(bytes: &[u8]) -> Result<NodeId, IdError> {
        if bytes.len() != ID_LEN {
            return Err(IdError::InvalidLength(bytes.len()));
        }
        IdType::from_byte(bytes[ID_DATA_LEN])
            .ok_or(IdError::InvalidType(bytes[ID_DATA_LEN]))?;
        let mut raw = [0u8; ID_LEN];
        raw.copy_from_slice(bytes);
        Ok(NodeId(raw))
    }

    /// The well-known identifier of the permissioning server itself, used as
    /// the author of synthesized round errors.
    pub fn permissioning() -> NodeId {
        NodeId::new([0u8; ID_DATA_LEN], IdType::Permissioning)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn id_type(&self) -> IdType {
        // The constructor rejects unknown tags, so this cannot miss.
        IdType::from_byte(self.0[ID_DATA_LEN]).unwrap_or(IdType::Node)
    }

    /// The same identifier retagged with a different type byte. Used to
    /// derive a node's gateway identifier.
    pub fn with_type(&self, id_type: IdType) -> NodeId {
        let mut raw = self.0;
        raw[ID_DATA_LEN] = id_type.as_byte();
        NodeId(raw)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<NodeId, IdError> {
        let bytes = hex::decode(s).map_err(|_| IdError::InvalidHex)?;
        NodeId::from_bytes(&bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<NodeId, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(D::Error::custom)
    }
}

/// Identifier of a single mixing round. Assigned sequentially starting at 1.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RoundId(pub u64);

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier must be {ID_LEN} bytes, found {0}")]
    InvalidLength(usize),
    #[error("unknown identifier type byte {0}")]
    InvalidType(u8),
    #[error("identifier is not valid hex")]
    InvalidHex,
}
