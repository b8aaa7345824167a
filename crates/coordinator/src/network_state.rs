//! The authoritative shared network state.
//!
//! One `NetworkState` is constructed at startup and threaded through every
//! component: it owns the node map, the round map, the round-update log,
//! the canonical NDF and its published forms, the prune set, and the
//! persisted round/update counters.
//!
//! Lock ordering, to keep the whole aggregate deadlock free:
//! polling lock → node map → round map → update log on the scheduling path,
//! and output NDF → internal NDF (read) → prune set (read) on the
//! publication path. The output lock is never taken while holding the
//! internal write lock.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::{SigningKey, VerifyingKey};
use parking_lot::{Mutex, RwLock};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, trace, warn};

use mixnet_common::crypto;
use mixnet_common::{NodeId, RoundId};
use mixnet_storage::{StateRecord, Storage, StorageError, ELLIPTIC_KEY, ROUND_ID_KEY, UPDATE_ID_KEY};

use crate::error::StateError;
use crate::ndf::{NdfError, NetworkDefinition, SignedNdf};
use crate::node_state::{NodeMap, UpdateNotification};
use crate::round_state::RoundMap;
use crate::update_log::UpdateLog;
use crate::wire::RoundInfo;

/// Size of the node update channel. A full buffer surfaces `BufferFull` to
/// the polling endpoint rather than blocking it.
pub const UPDATE_BUFFER_LENGTH: usize = 10_000;

/// Size of the round-adder channel feeding the gap-filling inserter.
const ROUND_ADDER_BUFFER: usize = 500;

struct PersistedIds {
    round_id: u64,
    update_id: u64,
}

struct OutputNdfs {
    full: Arc<SignedNdf>,
    partial: Arc<SignedNdf>,
}

pub struct NetworkState {
    rsa_private_key: RsaPrivateKey,
    rsa_public_key: RsaPublicKey,
    elliptic_key: SigningKey,

    nodes: NodeMap,
    rounds: RoundMap,
    round_updates: UpdateLog,

    update_tx: mpsc::Sender<UpdateNotification>,
    update_rx: Mutex<Option<mpsc::Receiver<UpdateNotification>>>,
    round_adder_tx: mpsc::Sender<RoundInfo>,

    /// Guards update/round id assignment so ids stay monotonic.
    ids: Mutex<PersistedIds>,

    geo_bins: HashMap<String, u8>,

    unpruned_ndf: RwLock<NetworkDefinition>,
    /// Node id to prune decision: true removes the node and its gateway
    /// from the published NDF, false keeps it but marks it stale.
    prune_list: RwLock<HashMap<NodeId, bool>>,
    /// Disabled nodes always stay in the NDF as stale entries, regardless
    /// of what the metric tracker computes.
    disabled_nodes: RwLock<HashSet<NodeId>>,
    output_ndf: RwLock<OutputNdfs>,

    address_space_size: AtomicU32,
    ndf_ready: AtomicBool,

    full_ndf_output_path: PathBuf,
    signed_partial_ndf_output_path: PathBuf,

    storage: Storage,
}

impl NetworkState {
    /// Build the network state, restoring persisted counters and the
    /// elliptic key, and bootstrapping the update log with its dummy entry
    /// on first start.
    pub async fn new(
        rsa_private_key: RsaPrivateKey,
        address_space_size: u32,
        full_ndf_output_path: impl Into<PathBuf>,
        signed_partial_ndf_output_path: impl Into<PathBuf>,
        geo_bins: HashMap<String, u8>,
        storage: Storage,
    ) -> Result<Arc<NetworkState>, StateError> {
        let (update_tx, update_rx) = mpsc::channel(UPDATE_BUFFER_LENGTH);
        let (round_adder_tx, round_adder_rx) = mpsc::channel(ROUND_ADDER_BUFFER);

        let update_id = load_persisted_id(&storage, UPDATE_ID_KEY)?;
        let round_id = load_persisted_id(&storage, ROUND_ID_KEY)?;
        let elliptic_key = load_or_create_elliptic_key(&storage)?;

        let rsa_public_key = RsaPublicKey::from(&rsa_private_key);
        let state = Arc::new(NetworkState {
            rsa_private_key,
            rsa_public_key,
            elliptic_key,
            nodes: NodeMap::new(),
            rounds: RoundMap::new(),
            round_updates: UpdateLog::new(),
            update_tx,
            update_rx: Mutex::new(Some(update_rx)),
            round_adder_tx,
            ids: Mutex::new(PersistedIds { round_id, update_id }),
            geo_bins,
            unpruned_ndf: RwLock::new(NetworkDefinition::default()),
            prune_list: RwLock::new(HashMap::new()),
            disabled_nodes: RwLock::new(HashSet::new()),
            output_ndf: RwLock::new(OutputNdfs {
                full: Arc::new(SignedNdf::empty()),
                partial: Arc::new(SignedNdf::empty()),
            }),
            address_space_size: AtomicU32::new(address_space_size),
            ndf_ready: AtomicBool::new(false),
            full_ndf_output_path: full_ndf_output_path.into(),
            signed_partial_ndf_output_path: signed_partial_ndf_output_path.into(),
            storage,
        });

        tokio::spawn(Arc::clone(&state).round_adder_routine(round_adder_rx));

        // Update ids live in the uint space, so id 0 doubles as "no updates
        // known" to pollers. Burn id 1 on a dummy entry at first start and
        // wait for it to be durably observed before anything else can append.
        if update_id == 0 {
            state.set_persisted_id(UPDATE_ID_KEY, 0)?;
            state.add_round_update(RoundInfo::dummy())?;
            while state.round_updates.last_update_id() != 1 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        if round_id == 0 {
            state.ids.lock().round_id = 1;
            state.set_persisted_id(ROUND_ID_KEY, 1)?;
        }

        Ok(state)
    }

    // ── round updates (the append side of the log) ──

    /// Append a round info to the update log: assign the next update id
    /// under the id mutex, then sign and insert off-thread. Signing is
    /// parallelized per update; the adder task re-orders the results so the
    /// durable sequence stays gapless and id-ordered.
    pub fn add_round_update(&self, info: RoundInfo) -> Result<(), StateError> {
        let mut info = info;
        {
            let mut ids = self.ids.lock();
            ids.update_id += 1;
            info.update_id = ids.update_id;
            self.set_persisted_id(UPDATE_ID_KEY, ids.update_id)?;
        }

        let rsa_key = self.rsa_private_key.clone();
        let elliptic_key = self.elliptic_key.clone();
        let adder_tx = self.round_adder_tx.clone();
        tokio::spawn(async move {
            let digest = info.signing_digest();
            match crypto::rsa_sign_sha256(&rsa_key, &digest) {
                Ok(signature) => info.rsa_signature = signature,
                Err(err) => {
                    // An unsigned entry would leave the log inconsistent
                    // for every reader, so there is nothing to recover.
                    error!(update_id = info.update_id, round_id = %info.id, %err,
                        "could not sign round update");
                    std::process::abort();
                }
            }
            info.eddsa_signature = crypto::eddsa_sign(&elliptic_key, &digest);

            trace!(?info, "signed round info");
            info!(round_id = %info.id, state = %info.state, "round state updated");

            if adder_tx.send(info).await.is_err() {
                error!("round adder channel closed");
            }
        });
        Ok(())
    }

    /// Single consumer of signed updates. Signing finishes in submission
    /// order only by luck, so out-of-order arrivals are parked by id and
    /// drained sequentially once the gap closes.
    async fn round_adder_routine(self: Arc<Self>, mut rx: mpsc::Receiver<RoundInfo>) {
        let mut future_updates: HashMap<u64, RoundInfo> = HashMap::new();
        let mut next_id: u64 = 0;

        while let Some(info) = rx.recv().await {
            let update_id = info.update_id;

            if next_id % 100 == 0 {
                debug!(queued = future_updates.len(), "round adder future-update queue");
            }

            // Late but already in order: insert immediately.
            if update_id < next_id {
                self.round_updates.add_round_info(Arc::new(info));
                continue;
            }

            if next_id == 0 {
                next_id = update_id;
            }

            future_updates.insert(update_id, info);
            while let Some(ready) = future_updates.remove(&next_id) {
                self.round_updates.add_round_info(Arc::new(ready));
                next_id += 1;
            }
        }
    }

    /// All updates with id strictly greater than `since`, in id order.
    pub fn get_updates(&self, since: u64) -> Vec<Arc<RoundInfo>> {
        self.round_updates.get_updates(since)
    }

    pub fn last_update_id(&self) -> u64 {
        self.round_updates.last_update_id()
    }

    // ── node update channel ──

    /// Enqueue a node state change for the scheduler. Never blocks; a full
    /// buffer is surfaced to the caller. Dropping the rejected notification
    /// releases its polling guard.
    pub fn send_update_notification(&self, nun: UpdateNotification) -> Result<(), StateError> {
        self.update_tx.try_send(nun).map_err(|err| match err {
            TrySendError::Full(_) => StateError::BufferFull,
            TrySendError::Closed(_) => StateError::UpdateChannelClosed,
        })
    }

    /// Hand the single update receiver to the scheduler. Returns `None` on
    /// the second call.
    pub fn take_update_receiver(&self) -> Option<mpsc::Receiver<UpdateNotification>> {
        self.update_rx.lock().take()
    }

    // ── persisted counters ──

    /// Next round id to use. Persists the follow-up value so a restart
    /// resumes after the last handed-out id. Intended to be called only
    /// from the serial scheduling thread.
    pub fn increment_round_id(&self) -> Result<RoundId, StateError> {
        let mut ids = self.ids.lock();
        let id = ids.round_id;
        ids.round_id += 1;
        self.set_persisted_id(ROUND_ID_KEY, ids.round_id)?;
        Ok(RoundId(id))
    }

    pub fn round_id(&self) -> u64 {
        self.ids.lock().round_id
    }

    pub fn update_id(&self) -> u64 {
        self.ids.lock().update_id
    }

    fn set_persisted_id(&self, key: &str, value: u64) -> Result<(), StorageError> {
        self.storage.upsert_state(StateRecord {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    // ── NDF ──

    /// Replace the canonical unpruned NDF, stamping its timestamp.
    pub fn update_internal_ndf(&self, ndf: NetworkDefinition) {
        let mut ndf = ndf;
        ndf.timestamp = crate::now_nanos();
        *self.unpruned_ndf.write() = ndf;
    }

    /// Mutate the canonical unpruned NDF under its write lock. The
    /// timestamp is stamped after the closure so the publication path sees
    /// the mutation as new.
    pub fn with_internal_ndf<F>(&self, f: F)
    where
        F: FnOnce(&mut NetworkDefinition),
    {
        let mut guard = self.unpruned_ndf.write();
        f(&mut guard);
        guard.timestamp = crate::now_nanos();
    }

    pub fn get_unpruned_ndf(&self) -> NetworkDefinition {
        self.unpruned_ndf.read().clone()
    }

    /// Derive, sign and publish the full and partial NDFs from the current
    /// canonical NDF, applying the prune set, then write both output files.
    /// Skipped when the canonical NDF is not strictly newer than the last
    /// published one. File write failures are logged, not fatal.
    pub fn update_output_ndf(&self) -> Result<(), StateError> {
        let mut output = self.output_ndf.write();

        let loaded = self.unpruned_ndf.read().clone();
        if !output.full.marshaled.is_empty() && loaded.timestamp <= output.full.ndf.timestamp {
            warn!(
                loaded = loaded.timestamp,
                published = output.full.ndf.timestamp,
                "skipping NDF publication: canonical NDF is not newer"
            );
            return Ok(());
        }

        if loaded.nodes.len() != loaded.gateways.len() {
            return Err(StateError::Ndf(NdfError::Misaligned {
                nodes: loaded.nodes.len(),
                gateways: loaded.gateways.len(),
            }));
        }

        let mut new_ndf = loaded;
        {
            let prune_list = self.prune_list.read();
            let mut i = 0;
            while i < new_ndf.nodes.len() {
                let Some(id) = new_ndf.nodes[i].id else {
                    i += 1;
                    continue;
                };
                match prune_list.get(&id) {
                    Some(true) => {
                        // Pruning removes the same index from both lists to
                        // preserve positional correspondence.
                        new_ndf.nodes.remove(i);
                        new_ndf.gateways.remove(i);
                    }
                    Some(false) => {
                        new_ndf.nodes[i].status = crate::ndf::EntryStatus::Stale;
                        i += 1;
                    }
                    None => {
                        new_ndf.nodes[i].status = crate::ndf::EntryStatus::Active;
                        i += 1;
                    }
                }
            }
        }

        let full = SignedNdf::sign(new_ndf.clone(), &self.rsa_private_key)?;
        let partial = SignedNdf::sign(new_ndf.strip(), &self.rsa_private_key)?;
        output.full = Arc::new(full);
        output.partial = Arc::new(partial);

        if let Err(err) = write_atomic(&self.full_ndf_output_path, &output.full.marshaled) {
            error!(%err, path = %self.full_ndf_output_path.display(),
                "unable to output full NDF JSON file");
        }

        match serde_json::to_vec(&output.partial.message()) {
            Ok(partial_message) => {
                use base64::Engine as _;
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(&partial_message);
                if let Err(err) =
                    write_atomic(&self.signed_partial_ndf_output_path, encoded.as_bytes())
                {
                    error!(%err, path = %self.signed_partial_ndf_output_path.display(),
                        "unable to output signed partial NDF file");
                }
            }
            Err(err) => error!(%err, "unable to marshal signed partial NDF"),
        }

        info!(hash = %hex::encode(output.full.hash), "full NDF updated");
        Ok(())
    }

    pub fn get_full_ndf(&self) -> Arc<SignedNdf> {
        Arc::clone(&self.output_ndf.read().full)
    }

    pub fn get_partial_ndf(&self) -> Arc<SignedNdf> {
        Arc::clone(&self.output_ndf.read().partial)
    }

    /// Count of nodes that will appear non-pruned: total minus prune set.
    pub fn count_active_nodes(&self) -> usize {
        let unpruned = self.unpruned_ndf.read();
        let prune_list = self.prune_list.read();
        unpruned.nodes.len().saturating_sub(prune_list.len())
    }

    // ── prune set ──

    /// Replace the prune set, re-merging disabled nodes, which always stay
    /// present-but-stale.
    pub fn set_pruned_nodes(&self, pruned: HashMap<NodeId, bool>) {
        let mut prune_list = self.prune_list.write();
        *prune_list = pruned;
        for id in self.disabled_nodes.read().iter() {
            prune_list.insert(*id, false);
        }
    }

    /// Merge ids into the prune set as kept-but-stale without clearing
    /// existing decisions.
    pub fn set_pruned_nodes_no_reset(&self, ids: &[NodeId]) {
        let mut prune_list = self.prune_list.write();
        for id in ids {
            prune_list.insert(*id, false);
        }
    }

    /// Mark a single node for removal from the NDF.
    pub fn set_pruned_node(&self, id: NodeId) {
        self.prune_list.write().insert(id, true);
    }

    pub fn is_pruned(&self, id: NodeId) -> bool {
        self.prune_list.read().contains_key(&id)
    }

    /// Install the disabled-nodes list and fold it into the prune set.
    pub fn set_disabled_nodes(&self, ids: Vec<NodeId>) {
        {
            let mut disabled = self.disabled_nodes.write();
            *disabled = ids.iter().copied().collect();
        }
        self.set_pruned_nodes_no_reset(&ids);
    }

    // ── accessors ──

    pub fn node_map(&self) -> &NodeMap {
        &self.nodes
    }

    pub fn round_map(&self) -> &RoundMap {
        &self.rounds
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn geo_bins(&self) -> &HashMap<String, u8> {
        &self.geo_bins
    }

    pub fn address_space_size(&self) -> u32 {
        self.address_space_size.load(Ordering::Relaxed)
    }

    pub fn set_address_space_size(&self, size: u32) {
        self.address_space_size.store(size, Ordering::Relaxed);
    }

    pub fn is_ndf_ready(&self) -> bool {
        self.ndf_ready.load(Ordering::Acquire)
    }

    pub fn set_ndf_ready(&self) {
        self.ndf_ready.store(true, Ordering::Release);
    }

    pub fn rsa_private_key(&self) -> &RsaPrivateKey {
        &self.rsa_private_key
    }

    pub fn rsa_public_key(&self) -> &RsaPublicKey {
        &self.rsa_public_key
    }

    pub fn elliptic_public_key(&self) -> VerifyingKey {
        self.elliptic_key.verifying_key()
    }
}

fn load_persisted_id(storage: &Storage, key: &str) -> Result<u64, StateError> {
    match storage.get_state_value(key) {
        Ok(value) => value
            .parse::<u64>()
            .map_err(|_| StorageError::Backend(format!("unparsable {key}: {value}")).into()),
        Err(StorageError::NotFound(_)) => Ok(0),
        Err(err) => Err(err.into()),
    }
}

fn load_or_create_elliptic_key(storage: &Storage) -> Result<SigningKey, StateError> {
    match storage.get_state_value(ELLIPTIC_KEY) {
        Ok(stored) => {
            let bytes = crypto::keypair_bytes_from_hex(&stored)
                .map_err(StateError::Signing)?;
            Ok(crypto::signing_key_from_bytes(&bytes).map_err(StateError::Signing)?)
        }
        Err(StorageError::NotFound(_)) => {
            let keypair = crypto::generate_elliptic_key_bytes();
            storage.upsert_state(StateRecord {
                key: ELLIPTIC_KEY.to_string(),
                value: crypto::keypair_bytes_to_hex(&keypair),
            })?;
            Ok(crypto::signing_key_from_bytes(&keypair).map_err(StateError::Signing)?)
        }
        Err(err) => Err(err.into()),
    }
}

/// Write-then-rename so readers of the output paths never see a torn file.
fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = match path.file_name() {
        Some(name) => {
            let mut tmp_name = name.to_os_string();
            tmp_name.push(".tmp");
            path.with_file_name(tmp_name)
        }
        None => return Err(std::io::Error::other("output path has no file name")),
    };
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}
