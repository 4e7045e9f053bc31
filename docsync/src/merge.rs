//! Pluggable merge engines.
//!
//! A merge engine folds an incoming update into a room's accumulated state.
//! The hub never looks inside the bytes: it hands updates to the engine in
//! arrival order and stores whatever comes back.
//!
//! Contract for every engine:
//! - merging the same set of updates in any order yields the same state
//!   (commutative, associative)
//! - re-applying an update already contained in the state is harmless
//! - the empty byte string is the empty state

use std::collections::BTreeSet;
use std::sync::Arc;

use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::config::MergeKind;

/// Merge errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    /// The accumulated state could not be decoded
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The incoming update could not be decoded or applied
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
}

/// Folds updates into state.
pub trait MergeEngine: Send + Sync {
    /// Apply `update` to `state`, returning the new state.
    fn merge(&self, state: &[u8], update: &[u8]) -> Result<Vec<u8>, MergeError>;

    /// Join two states into one containing both.
    fn combine(&self, left: &[u8], right: &[u8]) -> Result<Vec<u8>, MergeError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Engine selected by configuration.
pub fn engine_for(kind: MergeKind) -> Arc<dyn MergeEngine> {
    match kind {
        MergeKind::Yrs => Arc::new(YrsMerge),
        MergeKind::UpdateSet => Arc::new(UpdateSetMerge),
    }
}

/// Yrs-backed engine: state and updates are Yrs v1 updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct YrsMerge;

impl YrsMerge {
    fn apply(doc: &Doc, bytes: &[u8]) -> Result<(), String> {
        if bytes.is_empty() {
            return Ok(());
        }
        let update = Update::decode_v1(bytes).map_err(|e| e.to_string())?;
        let mut txn = doc.transact_mut();
        txn.apply_update(update).map_err(|e| e.to_string())
    }

    fn encode(doc: &Doc) -> Vec<u8> {
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

impl MergeEngine for YrsMerge {
    fn merge(&self, state: &[u8], update: &[u8]) -> Result<Vec<u8>, MergeError> {
        if update.is_empty() {
            return Err(MergeError::InvalidUpdate("empty update".into()));
        }
        let doc = Doc::new();
        Self::apply(&doc, state).map_err(MergeError::InvalidState)?;
        Self::apply(&doc, update).map_err(MergeError::InvalidUpdate)?;
        Ok(Self::encode(&doc))
    }

    fn combine(&self, left: &[u8], right: &[u8]) -> Result<Vec<u8>, MergeError> {
        if right.is_empty() {
            return Ok(left.to_vec());
        }
        if left.is_empty() {
            return Ok(right.to_vec());
        }
        let doc = Doc::new();
        Self::apply(&doc, left).map_err(MergeError::InvalidState)?;
        Self::apply(&doc, right).map_err(MergeError::InvalidState)?;
        Ok(Self::encode(&doc))
    }

    fn name(&self) -> &'static str {
        "yrs"
    }
}

/// Grow-only set of opaque updates.
///
/// State layout: `[len: u32 BE][bytes]` per distinct update, sorted
/// lexicographically. The canonical order makes the encoding byte-identical
/// for any permutation of the same updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct UpdateSetMerge;

impl UpdateSetMerge {
    /// Decode a state into its member updates.
    pub fn members(state: &[u8]) -> Result<BTreeSet<Vec<u8>>, MergeError> {
        let mut members = BTreeSet::new();
        let mut rest = state;
        while !rest.is_empty() {
            if rest.len() < 4 {
                return Err(MergeError::InvalidState("truncated length prefix".into()));
            }
            let mut len_buf = [0u8; 4];
            len_buf.copy_from_slice(&rest[..4]);
            let len = u32::from_be_bytes(len_buf) as usize;
            rest = &rest[4..];
            if rest.len() < len {
                return Err(MergeError::InvalidState(format!(
                    "member of {len} bytes overruns state"
                )));
            }
            members.insert(rest[..len].to_vec());
            rest = &rest[len..];
        }
        Ok(members)
    }

    fn encode(members: &BTreeSet<Vec<u8>>) -> Vec<u8> {
        let size = members.iter().map(|m| 4 + m.len()).sum();
        let mut out = Vec::with_capacity(size);
        for member in members {
            out.extend_from_slice(&(member.len() as u32).to_be_bytes());
            out.extend_from_slice(member);
        }
        out
    }
}

impl MergeEngine for UpdateSetMerge {
    fn merge(&self, state: &[u8], update: &[u8]) -> Result<Vec<u8>, MergeError> {
        if update.is_empty() {
            return Err(MergeError::InvalidUpdate("empty update".into()));
        }
        if update.len() > u32::MAX as usize {
            return Err(MergeError::InvalidUpdate("update too large".into()));
        }
        let mut members = Self::members(state)?;
        members.insert(update.to_vec());
        Ok(Self::encode(&members))
    }

    fn combine(&self, left: &[u8], right: &[u8]) -> Result<Vec<u8>, MergeError> {
        let mut members = Self::members(left)?;
        members.extend(Self::members(right)?);
        Ok(Self::encode(&members))
    }

    fn name(&self) -> &'static str {
        "update-set"
    }
}
