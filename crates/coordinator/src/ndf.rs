//! The network definition file and its signed, published forms.
//!
//! One canonical unpruned [`NetworkDefinition`] is maintained internally.
//! Publication derives two signed artifacts from it: the full NDF handed to
//! back-end servers, and a partial NDF with node addresses and certificates
//! stripped for clients. The node and gateway lists are positionally
//! co-indexed: entry i of each belongs to the same operator, which is why
//! pruning always removes the same index from both.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use mixnet_common::config::{GroupConfig, UdbConfig};
use mixnet_common::crypto::{self, CryptoError};
use mixnet_common::{IdType, NodeId};
use rsa::RsaPrivateKey;

#[derive(Debug, Error)]
pub enum NdfError {
    #[error("could not marshal network definition: {0}")]
    Marshal(#[from] serde_json::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("could not find node {0} in the network definition")]
    UnknownNode(NodeId),

    #[error("could not find gateway {0} in the network definition")]
    UnknownGateway(NodeId),

    #[error("node and gateway lists are not co-indexed: {nodes} nodes, {gateways} gateways")]
    Misaligned { nodes: usize, gateways: usize },
}

/// Publication status of a node entry.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Active,
    Stale,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: Option<NodeId>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub tls_certificate: String,
    #[serde(default)]
    pub status: EntryStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayEntry {
    pub id: Option<NodeId>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub tls_certificate: String,
}

/// Contact block for the permissioning server itself.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrationContact {
    pub address: String,
    #[serde(default)]
    pub tls_certificate: String,
}

/// The canonical directory of the network.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    /// Nanoseconds since the epoch; publication skips anything not strictly
    /// newer than what was last published.
    pub timestamp: u64,
    pub nodes: Vec<NodeEntry>,
    pub gateways: Vec<GatewayEntry>,
    pub registration: RegistrationContact,
    pub udb: UdbConfig,
    pub cmix: GroupConfig,
    pub e2e: GroupConfig,
}

impl NetworkDefinition {
    pub fn marshal(&self) -> Result<Vec<u8>, NdfError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn hash(&self) -> Result<[u8; 32], NdfError> {
        Ok(Sha256::digest(self.marshal()?).into())
    }

    /// The client-facing projection: node addresses and all certificates
    /// removed, everything else intact.
    pub fn strip(&self) -> NetworkDefinition {
        let mut stripped = self.clone();
        for node in &mut stripped.nodes {
            node.address.clear();
            node.tls_certificate.clear();
        }
        for gw in &mut stripped.gateways {
            gw.tls_certificate.clear();
        }
        stripped
    }

    /// Append a node and its co-located gateway, keeping the two lists
    /// positionally aligned.
    pub fn append_node(&mut self, node: NodeEntry, gateway: GatewayEntry) {
        self.nodes.push(node);
        self.gateways.push(gateway);
    }

    /// Update a node's advertised address in place.
    pub fn update_node_address(&mut self, id: NodeId, address: &str) -> Result<(), NdfError> {
        for entry in &mut self.nodes {
            if entry.id == Some(id) {
                entry.address = address.to_string();
                return Ok(());
            }
        }
        Err(NdfError::UnknownNode(id))
    }

    /// Update a gateway's advertised address in place. Takes the owning
    /// node's id and retags it.
    pub fn update_gateway_address(&mut self, node_id: NodeId, address: &str) -> Result<(), NdfError> {
        let gid = node_id.with_type(IdType::Gateway);
        for entry in &mut self.gateways {
            if entry.id == Some(gid) {
                entry.address = address.to_string();
                return Ok(());
            }
        }
        Err(NdfError::UnknownGateway(gid))
    }
}

/// A marshaled network definition with its RSA signature, as attached to
/// poll responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedNdfMessage {
    /// Base64 of the marshaled definition.
    pub ndf: String,
    /// Base64 of the RSA signature over the marshaled bytes.
    pub signature: String,
}

/// A published form of the NDF: the definition, its marshaled bytes, the
/// hash identifying this version, and the RSA signature.
#[derive(Clone, Debug)]
pub struct SignedNdf {
    pub ndf: NetworkDefinition,
    pub marshaled: Vec<u8>,
    pub hash: [u8; 32],
    pub signature: Vec<u8>,
}

impl SignedNdf {
    /// Placeholder handle used before the first publication.
    pub fn empty() -> SignedNdf {
        SignedNdf {
            ndf: NetworkDefinition::default(),
            marshaled: Vec::new(),
            hash: [0u8; 32],
            signature: Vec::new(),
        }
    }

    pub fn sign(ndf: NetworkDefinition, key: &RsaPrivateKey) -> Result<SignedNdf, NdfError> {
        let marshaled = ndf.marshal()?;
        let hash = Sha256::digest(&marshaled).into();
        let signature = crypto::rsa_sign_sha256(key, &marshaled)?;
        Ok(SignedNdf { ndf, marshaled, hash, signature })
    }

    /// Whether the caller-supplied hash matches this published version.
    pub fn compare_hash(&self, other: &[u8]) -> bool {
        !self.marshaled.is_empty() && self.hash.as_slice() == other
    }

    pub fn message(&self) -> SignedNdfMessage {
        use base64::Engine as _;
        let engine = base64::engine::general_purpose::STANDARD;
        SignedNdfMessage {
            ndf: engine.encode(&self.marshaled),
            signature: engine.encode(&self.signature),
        }
    }
}
