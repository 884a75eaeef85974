//! # Substrate: pin/release accounting for large cached values
//!
//! Scores and sub-models are conceptually lazy, partitioned values on an
//! execution substrate. The driver must materialize (pin) each one before
//! reading it and release it exactly once when a replacement has been
//! pinned. This module is the registry that enforces that discipline:
//! every pin yields a [`ResourceHandle`], releasing a handle twice is a
//! hard error rather than a silent no-op, and live-handle/byte accounting
//! makes leaks observable in tests.
//!
//! Two storage kinds exist. `Broadcast` values are replicated to every
//! worker (global parameter blocks); `Partitioned` values are sharded
//! (per-entity blocks, scores). A sub-model may hold both; release order
//! is broadcast first, then partitioned.

use ahash::AHashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Storage class of a pinned value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StorageKind {
    /// Replicated to every worker.
    Broadcast,
    /// Sharded across workers.
    Partitioned,
}

/// Size and kind of one storage block a value owns. Sub-models report
/// these so the driver can pin and release them in a uniform loop.
#[derive(Debug, Clone, Copy)]
pub struct StorageDescriptor {
    pub kind: StorageKind,
    pub approx_bytes: usize,
}

/// Proof of a live pin. Obtained from [`Substrate::pin`], consumed by
/// [`Substrate::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceHandle {
    id: u64,
    kind: StorageKind,
}

impl ResourceHandle {
    pub fn kind(&self) -> StorageKind {
        self.kind
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// The handle was already released (or never issued). Double release
    /// is a logic error in the caller's pin/release sequencing.
    #[error("storage handle {id} ({label:?}) released twice")]
    AlreadyReleased { id: u64, label: String },
}

#[derive(Debug)]
struct PinRecord {
    label: String,
    kind: StorageKind,
    approx_bytes: usize,
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    live: AHashMap<u64, PinRecord>,
    released: AHashMap<u64, String>,
    release_log: Vec<ReleaseEvent>,
}

/// One release, in the order it happened. The log lets tests assert the
/// broadcast-before-partitioned ordering the driver promises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseEvent {
    pub label: String,
    pub kind: StorageKind,
}

/// The pin/release registry. One per run; shared by reference.
#[derive(Debug, Default)]
pub struct Substrate {
    registry: Mutex<Registry>,
}

impl Substrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialize a value and pin its storage. The label names the value
    /// in logs and leak reports (e.g. `train_score/global`).
    pub fn pin(&self, label: &str, descriptor: StorageDescriptor) -> ResourceHandle {
        let mut reg = self.registry.lock().unwrap();
        let id = reg.next_id;
        reg.next_id += 1;
        reg.live.insert(
            id,
            PinRecord {
                label: label.to_owned(),
                kind: descriptor.kind,
                approx_bytes: descriptor.approx_bytes,
            },
        );
        log::debug!(
            "pinned {label} ({:?}, ~{} bytes) as handle {id}",
            descriptor.kind,
            descriptor.approx_bytes
        );
        ResourceHandle {
            id,
            kind: descriptor.kind,
        }
    }

    /// Release a pinned value's storage. Exactly once per handle.
    pub fn release(&self, handle: ResourceHandle) -> Result<(), StoreError> {
        let mut reg = self.registry.lock().unwrap();
        match reg.live.remove(&handle.id) {
            Some(record) => {
                log::debug!(
                    "released {} ({:?}, ~{} bytes), handle {}",
                    record.label,
                    record.kind,
                    record.approx_bytes,
                    handle.id
                );
                reg.release_log.push(ReleaseEvent {
                    label: record.label.clone(),
                    kind: record.kind,
                });
                reg.released.insert(handle.id, record.label);
                Ok(())
            }
            None => {
                let label = reg
                    .released
                    .get(&handle.id)
                    .cloned()
                    .unwrap_or_else(|| "<unknown>".to_owned());
                Err(StoreError::AlreadyReleased {
                    id: handle.id,
                    label,
                })
            }
        }
    }

    /// Number of currently pinned values.
    pub fn live_handles(&self) -> usize {
        self.registry.lock().unwrap().live.len()
    }

    /// Total approximate bytes currently pinned.
    pub fn pinned_bytes(&self) -> usize {
        self.registry
            .lock()
            .unwrap()
            .live
            .values()
            .map(|r| r.approx_bytes)
            .sum()
    }

    /// Every release so far, oldest first.
    pub fn release_log(&self) -> Vec<ReleaseEvent> {
        self.registry.lock().unwrap().release_log.clone()
    }

    /// Labels of everything still pinned, for leak reporting.
    pub fn live_labels(&self) -> Vec<String> {
        let reg = self.registry.lock().unwrap();
        let mut labels: Vec<String> = reg.live.values().map(|r| r.label.clone()).collect();
        labels.sort();
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: StorageDescriptor = StorageDescriptor {
        kind: StorageKind::Broadcast,
        approx_bytes: 64,
    };

    #[test]
    fn pin_then_release_balances() {
        let substrate = Substrate::new();
        let h = substrate.pin("weights", SMALL);
        assert_eq!(substrate.live_handles(), 1);
        assert_eq!(substrate.pinned_bytes(), 64);
        substrate.release(h).unwrap();
        assert_eq!(substrate.live_handles(), 0);
        assert_eq!(substrate.pinned_bytes(), 0);
    }

    #[test]
    fn double_release_is_an_error() {
        let substrate = Substrate::new();
        let h = substrate.pin("weights", SMALL);
        substrate.release(h).unwrap();
        let err = substrate.release(h).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyReleased { .. }));
        assert!(err.to_string().contains("weights"));
    }

    #[test]
    fn live_labels_reports_leaks() {
        let substrate = Substrate::new();
        let _held = substrate.pin(
            "train_score/global",
            StorageDescriptor {
                kind: StorageKind::Partitioned,
                approx_bytes: 128,
            },
        );
        assert_eq!(substrate.live_labels(), vec!["train_score/global"]);
    }

    #[test]
    fn release_log_records_events_in_order() {
        let substrate = Substrate::new();
        let partitioned = substrate.pin(
            "model/per-user",
            StorageDescriptor {
                kind: StorageKind::Partitioned,
                approx_bytes: 256,
            },
        );
        let broadcast = substrate.pin("model/per-user", SMALL);
        substrate.release(broadcast).unwrap();
        substrate.release(partitioned).unwrap();
        let kinds: Vec<StorageKind> = substrate.release_log().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![StorageKind::Broadcast, StorageKind::Partitioned]);
        assert!(
            substrate
                .release_log()
                .iter()
                .all(|e| e.label == "model/per-user")
        );
    }
}
