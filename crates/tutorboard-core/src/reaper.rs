//! Periodic removal of expired ephemeral objects.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::crdt::{Collection, DocChange, Origin, SharedDocument, StoreResult};
use crate::object::ObjectId;

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 2_000;

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Deletes ephemeral objects whose `expires_at` has passed.
///
/// Deletes go through the store's normal path with [`Origin::Reaper`], so
/// they replicate to every peer.
#[derive(Debug, Clone)]
pub struct EphemeralReaper {
    interval_ms: u64,
    last_sweep: Option<u64>,
}

impl Default for EphemeralReaper {
    fn default() -> Self {
        Self::new(DEFAULT_SWEEP_INTERVAL_MS)
    }
}

impl EphemeralReaper {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_sweep: None,
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// True if a sweep is due at `now`.
    pub fn should_sweep(&self, now: u64) -> bool {
        match self.last_sweep {
            Some(last) => now.saturating_sub(last) >= self.interval_ms,
            None => true,
        }
    }

    /// Ids of ephemeral objects expired at `now`.
    pub fn expired_candidates(&self, store: &SharedDocument, now: u64) -> Vec<ObjectId> {
        store
            .objects(Collection::Ephemeral)
            .into_values()
            .filter(|object| object.is_expired(now))
            .map(|object| object.id)
            .collect()
    }

    /// Delete the candidates that are still expired.
    ///
    /// Each entry is re-read inside the commit; one whose TTL was refreshed
    /// (or that was already deleted) since the scan is left alone.
    pub fn reap(
        &self,
        store: &mut SharedDocument,
        candidates: &[ObjectId],
        now: u64,
    ) -> StoreResult<Vec<DocChange>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let changes = store.transact(Origin::Reaper, |tx| {
            for id in candidates {
                match tx.get(Collection::Ephemeral, id) {
                    Some(object) if object.is_expired(now) => {
                        tx.delete(Collection::Ephemeral, id)?;
                    }
                    Some(_) => log::debug!("Skipping refreshed ephemeral {}", id),
                    None => {}
                }
            }
            Ok(())
        })?;
        if !changes.is_empty() {
            log::debug!("Reaped {} ephemeral objects", changes.len());
        }
        Ok(changes)
    }

    /// Scan and reap in one go.
    pub fn sweep(&mut self, store: &mut SharedDocument, now: u64) -> StoreResult<Vec<DocChange>> {
        self.last_sweep = Some(now);
        let candidates = self.expired_candidates(store, now);
        self.reap(store, &candidates, now)
    }

    /// Sweep only if the interval has elapsed.
    pub fn maybe_sweep(
        &mut self,
        store: &mut SharedDocument,
        now: u64,
    ) -> StoreResult<Vec<DocChange>> {
        if self.should_sweep(now) {
            self.sweep(store, now)
        } else {
            Ok(Vec::new())
        }
    }
}
