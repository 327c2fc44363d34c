use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::clock::{self, SharedClock};
use crate::model::DeltaRecord;

/// Hold/suppression windows for a consolidation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTuning {
    /// How long a fresh create is held before release. Default: 40s.
    #[serde(default = "default_shortlived", with = "humantime_serde")]
    pub shortlived: Duration,
    /// How long a deleted entity stays blacklisted. Default: 10m.
    #[serde(default = "default_delete_blacklist", with = "humantime_serde")]
    pub delete_blacklist: Duration,
    /// How long a plain update is held for consolidation. Default: 40s.
    #[serde(default = "default_update_consolidate", with = "humantime_serde")]
    pub update_consolidate: Duration,
}

fn default_shortlived() -> Duration {
    Duration::from_secs(40)
}

fn default_delete_blacklist() -> Duration {
    Duration::from_secs(600)
}

fn default_update_consolidate() -> Duration {
    Duration::from_secs(40)
}

/// Longest accepted hold or suppression window.
pub const MAX_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A queue tuning value outside the accepted range.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TuningError {
    #[error("{0} must be positive")]
    Zero(&'static str),

    #[error("{field} must be at most {max:?}")]
    TooLong { field: &'static str, max: Duration },
}

impl QueueTuning {
    /// Checks every window against `(0, MAX_WINDOW]`. `update_consolidate`
    /// may be zero, which releases updates on the next drain.
    pub fn validate(&self) -> Result<(), TuningError> {
        if self.shortlived.is_zero() {
            return Err(TuningError::Zero("shortlived"));
        }
        if self.delete_blacklist.is_zero() {
            return Err(TuningError::Zero("delete_blacklist"));
        }
        for (field, window) in [
            ("shortlived", self.shortlived),
            ("delete_blacklist", self.delete_blacklist),
            ("update_consolidate", self.update_consolidate),
        ] {
            if window > MAX_WINDOW {
                return Err(TuningError::TooLong {
                    field,
                    max: MAX_WINDOW,
                });
            }
        }
        Ok(())
    }
}

impl Default for QueueTuning {
    fn default() -> Self {
        Self {
            shortlived: default_shortlived(),
            delete_blacklist: default_delete_blacklist(),
            update_consolidate: default_update_consolidate(),
        }
    }
}

/// A record waiting for release, with the time its first version arrived.
#[derive(Debug, Clone)]
struct HeldEntry {
    first_seen: SystemTime,
    record: DeltaRecord,
}

/// Counters describing the outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Records returned, including link records split into group B.
    pub released: usize,
    /// Entities created and deleted inside the hold window.
    pub shortlived: usize,
    /// Held records dropped because their entity was blacklisted.
    pub suppressed: usize,
    /// Blacklist entries that aged out.
    pub expired: usize,
}

/// Ordered output of a drain: apply `creates`, then `links`, then `updates`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Release {
    /// Group A: records creating an entity, minus same-batch references.
    pub creates: Vec<DeltaRecord>,
    /// Group B: references between entities created in the same batch.
    pub links: Vec<DeltaRecord>,
    /// Group C: plain updates and deletes.
    pub updates: Vec<DeltaRecord>,
}

impl Release {
    pub fn len(&self) -> usize {
        self.creates.len() + self.links.len() + self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens the three groups in apply order.
    pub fn into_ordered(self) -> Vec<DeltaRecord> {
        let mut ordered = self.creates;
        ordered.reserve(self.links.len() + self.updates.len());
        ordered.extend(self.links);
        ordered.extend(self.updates);
        ordered
    }
}

/// Diagnostic view of one queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    pub held: usize,
    pub blacklisted: Vec<String>,
    pub last_release_unix: Option<f64>,
    pub released_total: u64,
}

/// Holds, merges and time-gates delta records for one target system.
///
/// At most one record is held per target id. Records are merged on append
/// and released by [`drain`](Self::drain) once their hold window passes:
///
/// * creates are held for `shortlived`; a create that is deleted before
///   release is dropped entirely and its id blacklisted;
/// * deletes are released immediately and blacklist their id;
/// * anything for a blacklisted id is dropped until `delete_blacklist`
///   has elapsed;
/// * plain updates are held for `update_consolidate`.
pub struct ConsolidationQueue {
    tuning: QueueTuning,
    clock: SharedClock,
    held: HashMap<String, HeldEntry>,
    blacklist: HashMap<String, SystemTime>,
    last_release: Option<SystemTime>,
    released_total: u64,
}

impl ConsolidationQueue {
    pub fn new(tuning: QueueTuning, clock: SharedClock) -> Self {
        Self {
            tuning,
            clock,
            held: HashMap::new(),
            blacklist: HashMap::new(),
            last_release: None,
            released_total: 0,
        }
    }

    pub fn tuning(&self) -> QueueTuning {
        self.tuning
    }

    /// Replaces the hold windows. Already-held records use the new values
    /// on the next drain.
    pub fn set_tuning(&mut self, tuning: QueueTuning) {
        self.tuning = tuning;
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn is_blacklisted(&self, target_id: &str) -> bool {
        self.blacklist.contains_key(target_id)
    }

    pub fn last_release(&self) -> Option<SystemTime> {
        self.last_release
    }

    /// Forgets every held record and blacklist entry.
    pub fn reset(&mut self) {
        self.held.clear();
        self.blacklist.clear();
    }

    /// Adds a record, merging it into any record already held for the same
    /// target id. `None` is accepted and ignored so mapper output can be
    /// passed straight through.
    pub fn append(&mut self, record: Option<DeltaRecord>) {
        let Some(record) = record else {
            return;
        };

        if let Some(entry) = self.held.get_mut(&record.target_id) {
            entry.record.merge_from(record);
            return;
        }

        let first_seen = self.clock.now();
        self.held
            .insert(record.target_id.clone(), HeldEntry { first_seen, record });
    }

    /// Releases every record whose hold window has passed, grouped in
    /// apply order.
    pub fn drain_release(&mut self) -> (Release, DrainStats) {
        let now = self.clock.now();
        let mut stats = DrainStats {
            expired: self.expire_blacklist(now),
            ..DrainStats::default()
        };

        // Created and deleted while held: never reaches the model.
        let shortlived: Vec<String> = self
            .held
            .iter()
            .filter(|(_, entry)| entry.record.creates() && entry.record.deletes())
            .map(|(id, _)| id.clone())
            .collect();
        stats.shortlived = shortlived.len();
        for id in shortlived {
            self.blacklist.insert(id, now);
        }

        let before = self.held.len();
        let blacklist = &self.blacklist;
        self.held.retain(|id, _| !blacklist.contains_key(id));
        stats.suppressed = (before - self.held.len()).saturating_sub(stats.shortlived);

        let mut due = Vec::new();
        for (id, entry) in &self.held {
            let release_at = if entry.record.deletes() {
                Some(now)
            } else if entry.record.creates() {
                entry.first_seen.checked_add(self.tuning.shortlived)
            } else {
                entry.first_seen.checked_add(self.tuning.update_consolidate)
            };

            // An unrepresentable release time is never due.
            if release_at.is_some_and(|at| at <= now) {
                due.push(id.clone());
            }
        }

        let mut release = Release::default();
        for id in due {
            let Some(entry) = self.held.remove(&id) else {
                continue;
            };
            if entry.record.deletes() {
                self.blacklist.insert(id, now);
            }
            if entry.record.creates() {
                release.creates.push(entry.record);
            } else {
                release.updates.push(entry.record);
            }
        }

        split_same_batch_references(&mut release);

        stats.released = release.len();
        if stats.released > 0 {
            self.last_release = Some(now);
            self.released_total += stats.released as u64;
        }

        if stats.released > 0 || stats.shortlived > 0 || stats.suppressed > 0 {
            debug!(
                released = stats.released,
                shortlived = stats.shortlived,
                suppressed = stats.suppressed,
                expired = stats.expired,
                held = self.held.len(),
                "drained consolidation queue",
            );
        }

        (release, stats)
    }

    /// Releases due records as one list in apply order (A, then B, then C).
    pub fn drain(&mut self) -> Vec<DeltaRecord> {
        self.drain_release().0.into_ordered()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut blacklisted: Vec<String> = self.blacklist.keys().cloned().collect();
        blacklisted.sort();
        QueueSnapshot {
            held: self.held.len(),
            blacklisted,
            last_release_unix: self.last_release.map(clock::unix_secs),
            released_total: self.released_total,
        }
    }

    fn expire_blacklist(&mut self, now: SystemTime) -> usize {
        let window = self.tuning.delete_blacklist;
        let before = self.blacklist.len();
        self.blacklist
            .retain(|_, added| clock::elapsed_since(now, *added) <= window);
        before - self.blacklist.len()
    }
}

/// Moves references between records created in the same batch out of
/// group A into separate link records in group B, so every create lands
/// before anything points at it.
fn split_same_batch_references(release: &mut Release) {
    if release.creates.len() < 2 {
        return;
    }

    let created: HashSet<String> = release
        .creates
        .iter()
        .map(|record| record.target_id.clone())
        .collect();
    let created: HashSet<&str> = created.iter().map(String::as_str).collect();

    for record in &mut release.creates {
        if let Some(linked) = record.extract_references_to(&created) {
            release.links.push(linked);
        }
    }
}
