//! Node and client registration.
//!
//! Node registration consumes a one-time registration code, binds the
//! node's identity and certificates to it, creates the in-memory node
//! state and appends the node and its gateway to the canonical NDF.
//!
//! Client registration signs the client's public keys with the server's
//! RSA key; open (codeless) registrations are rate limited.

use std::path::Path;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use mixnet_common::crypto;
use mixnet_common::{IdType, NodeId};
use mixnet_storage::{ApplicationRecord, NodeRecord, Storage, StorageError};

use crate::error::StateError;
use crate::ndf::{GatewayEntry, NodeEntry};
use crate::ServerContext;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("registration code {0:?} is invalid or not currently enabled")]
    InvalidCode(String),

    #[error("node with registration code {0:?} has already been registered")]
    AlreadyRegistered(String),

    #[error("too many client registrations, try again later")]
    RateLimited,

    #[error("unable to sign client public key: {0}")]
    Signing(String),

    #[error("could not load registration codes: {0}")]
    Codes(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    State(#[from] StateError),
}

// ───────────────────────── node registration ─────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRegistrationRequest {
    pub id: NodeId,
    #[serde(default, with = "hex")]
    pub salt: Vec<u8>,
    pub registration_code: String,
    pub server_address: String,
    #[serde(default)]
    pub server_tls_cert: String,
    pub gateway_address: String,
    #[serde(default)]
    pub gateway_tls_cert: String,
    /// Hex of the node's Ed25519 public key, used to authenticate its
    /// polls from then on.
    pub public_key: String,
}

/// Handle a registration attempt by a node.
pub fn register_node(
    req: &NodeRegistrationRequest,
    ctx: &ServerContext,
) -> Result<(), RegistrationError> {
    // The code must exist and be unused.
    let record = ctx
        .storage
        .get_node(&req.registration_code)
        .map_err(|_| RegistrationError::InvalidCode(req.registration_code.clone()))?;
    if record.id.is_some() {
        return Err(RegistrationError::AlreadyRegistered(req.registration_code.clone()));
    }

    ctx.storage.register_node(
        req.id,
        &req.salt,
        &req.registration_code,
        &req.server_address,
        &req.server_tls_cert,
        &req.gateway_address,
        &req.gateway_tls_cert,
        &req.public_key,
    )?;

    ctx.state.node_map().add_node(
        req.id,
        &record.sequence,
        &req.server_address,
        &req.gateway_address,
    )?;

    // Append the node and its co-located gateway to the canonical NDF and
    // republish.
    ctx.state.with_internal_ndf(|ndf| {
        ndf.append_node(
            NodeEntry {
                id: Some(req.id),
                address: req.server_address.clone(),
                tls_certificate: req.server_tls_cert.clone(),
                status: Default::default(),
            },
            GatewayEntry {
                id: Some(req.id.with_type(IdType::Gateway)),
                address: req.gateway_address.clone(),
                tls_certificate: req.gateway_tls_cert.clone(),
            },
        );
    });
    ctx.state.update_output_ndf()?;

    info!(node = %req.id, code = %req.registration_code, "node registered");
    debug!(total = ctx.state.node_map().len(), "registered node count");
    Ok(())
}

// ───────────────────────── client registration ─────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientRegistrationRequest {
    /// PEM or hex text of the client's transmission public key.
    pub transmission_key: String,
    /// PEM or hex text of the client's reception public key.
    pub reception_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientRegistrationResponse {
    #[serde(with = "hex")]
    pub transmission_signature: Vec<u8>,
    #[serde(with = "hex")]
    pub reception_signature: Vec<u8>,
}

/// Handle a registration attempt by a client: sign both client keys with
/// the server key and return the signatures.
pub fn register_client(
    req: &ClientRegistrationRequest,
    ctx: &ServerContext,
) -> Result<ClientRegistrationResponse, RegistrationError> {
    if !ctx.client_limiter.try_acquire() {
        warn!("client registration rate limited");
        return Err(RegistrationError::RateLimited);
    }

    let transmission_signature =
        crypto::rsa_sign_sha256(ctx.state.rsa_private_key(), req.transmission_key.as_bytes())
            .map_err(|err| RegistrationError::Signing(err.to_string()))?;
    let reception_signature =
        crypto::rsa_sign_sha256(ctx.state.rsa_private_key(), req.reception_key.as_bytes())
            .map_err(|err| RegistrationError::Signing(err.to_string()))?;

    debug!("client registration complete");
    Ok(ClientRegistrationResponse { transmission_signature, reception_signature })
}

/// Windowed counter bounding open client registrations.
pub struct RateLimiter {
    cap: u32,
    window: std::time::Duration,
    inner: Mutex<(u32, Instant)>,
}

impl RateLimiter {
    pub fn new(cap: u32, window: std::time::Duration) -> RateLimiter {
        RateLimiter { cap, window, inner: Mutex::new((0, Instant::now())) }
    }

    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.1.elapsed() >= self.window {
            *inner = (0, Instant::now());
        }
        if inner.0 >= self.cap {
            return false;
        }
        inner.0 += 1;
        true
    }
}

// ───────────────────────── registration codes ─────────────────────────

/// One entry of the registration code file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationInfo {
    pub code: String,
    /// Ordering tag consumed by the teaming algorithm.
    #[serde(default)]
    pub order: String,
}

/// Load node registration codes from a JSON file.
pub fn load_registration_info(path: impl AsRef<Path>) -> Result<Vec<RegistrationInfo>, RegistrationError> {
    let data = std::fs::read(path.as_ref())
        .map_err(|err| RegistrationError::Codes(err.to_string()))?;
    serde_json::from_slice(&data).map_err(|err| RegistrationError::Codes(err.to_string()))
}

/// Seed storage with node registration codes. Individual failures are
/// logged and skipped so a partially seeded file does not abort startup.
pub fn populate_node_registration_codes(storage: &Storage, infos: &[RegistrationInfo]) {
    for (i, info) in infos.iter().enumerate() {
        let application_id = (i + 1) as u64;
        let result = storage.insert_application(
            ApplicationRecord { id: application_id, ..Default::default() },
            NodeRecord::unregistered(&info.code, &info.order, application_id),
        );
        if let Err(err) = result {
            warn!(code = %info.code, %err, "unable to populate node registration code");
        }
    }
}

/// Drop registered nodes back into the node map and NDF on restart.
pub fn restore_registered_nodes(ctx: &ServerContext) -> Result<usize, RegistrationError> {
    let mut restored = 0usize;
    for record in ctx.storage.get_nodes()? {
        let Some(id) = record.id else { continue };
        ctx.state.node_map().add_node(
            id,
            &record.sequence,
            &record.server_address,
            &record.gateway_address,
        )?;
        ctx.state.with_internal_ndf(|ndf| {
            ndf.append_node(
                NodeEntry {
                    id: Some(id),
                    address: record.server_address.clone(),
                    tls_certificate: record.node_certificate.clone(),
                    status: Default::default(),
                },
                GatewayEntry {
                    id: Some(id.with_type(IdType::Gateway)),
                    address: record.gateway_address.clone(),
                    tls_certificate: record.gateway_certificate.clone(),
                },
            );
        });
        restored += 1;
    }
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rate_limiter_caps_and_resets() {
        let limiter = RateLimiter::new(2, Duration::from_millis(20));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        std::thread::sleep(Duration::from_millis(25));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_load_registration_info() {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            tmp,
            r#"[{{"code": "alpha", "order": "0"}}, {{"code": "beta"}}]"#
        )
        .expect("write");
        let infos = load_registration_info(tmp.path()).expect("load");
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].code, "alpha");
        assert_eq!(infos[1].order, "");

        assert!(load_registration_info("/definitely/not/there.json").is_err());
    }

    #[test]
    fn test_populate_codes_skips_duplicates() {
        let storage = Storage::new_map();
        let infos = vec![
            RegistrationInfo { code: "a".to_string(), order: "0".to_string() },
            RegistrationInfo { code: "a".to_string(), order: "1".to_string() },
            RegistrationInfo { code: "b".to_string(), order: "2".to_string() },
        ];
        populate_node_registration_codes(&storage, &infos);
        assert!(storage.get_node("a").is_ok());
        assert!(storage.get_node("b").is_ok());
        // the duplicate did not clobber the original ordering tag
        assert_eq!(storage.get_node("a").expect("get").sequence, "0");
    }
}
