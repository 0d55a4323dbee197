//! Keep-the-newest-N retention shared by every pruning target

use crate::error::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Number of most-recent entries to keep. Zero or negative disables pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetentionPolicy {
    pub keep: i64,
}

impl RetentionPolicy {
    pub fn new(keep: i64) -> Self {
        Self { keep }
    }

    pub fn is_enabled(&self) -> bool {
        self.keep > 0
    }
}

/// A collection that can be listed, ordered and pruned
#[async_trait]
pub trait RetentionTarget: Send + Sync {
    type Entry: Send + Sync;
    type Key: Ord + Send;

    /// Short name used in logs
    fn target_name(&self) -> &str;

    /// Entries carrying this target's prefix, in the store's listing order
    async fn list(&self) -> Result<Vec<Self::Entry>>;

    fn ordering_key(&self, entry: &Self::Entry) -> Self::Key;

    fn label(&self, entry: &Self::Entry) -> String;

    async fn delete(&self, entry: &Self::Entry) -> Result<()>;
}

/// What a pruning pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneResult {
    /// Labels of deleted entries, oldest first
    pub deleted: Vec<String>,
    pub retained: usize,
    /// Entries whose deletion failed, with the error message
    pub failed: Vec<(String, String)>,
    /// Pruning was disabled for this target
    pub skipped: bool,
}

/// Returns the entries that fall outside the newest `keep`, oldest first.
///
/// Ties keep their input order since the sort is stable. Nothing is
/// returned when `keep <= 0` or the collection already fits.
pub fn select_expired<T, K, F>(mut entries: Vec<T>, keep: i64, key: F) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    if keep <= 0 {
        return Vec::new();
    }
    let keep = usize::try_from(keep).unwrap_or(usize::MAX);
    if entries.len() <= keep {
        return Vec::new();
    }

    entries.sort_by_key(|e| key(e));
    let expired = entries.len() - keep;
    entries.truncate(expired);
    entries
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPruner {
    policy: RetentionPolicy,
}

impl RetentionPruner {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Deletes everything but the newest `keep` entries of `target`.
    ///
    /// Listing errors propagate. A failed delete is recorded and the
    /// remaining expired entries are still attempted.
    pub async fn prune<T: RetentionTarget>(&self, target: &T) -> Result<PruneResult> {
        if !self.policy.is_enabled() {
            debug!(retention_target = target.target_name(), "Retention disabled, skipping prune");
            return Ok(PruneResult {
                skipped: true,
                ..PruneResult::default()
            });
        }

        let entries = target.list().await?;
        let total = entries.len();
        let expired = select_expired(entries, self.policy.keep, |e| target.ordering_key(e));

        let mut result = PruneResult {
            retained: total - expired.len(),
            ..PruneResult::default()
        };

        for entry in &expired {
            let label = target.label(entry);
            match target.delete(entry).await {
                Ok(()) => {
                    debug!(retention_target = target.target_name(), entry = %label, "Deleted expired entry");
                    result.deleted.push(label);
                }
                Err(e) => {
                    warn!(retention_target = target.target_name(), entry = %label, error = %e, "Failed to delete expired entry");
                    result.failed.push((label, e.to_string()));
                }
            }
        }

        info!(
            retention_target = target.target_name(),
            keep = self.policy.keep,
            total = total,
            deleted = result.deleted.len(),
            failed = result.failed.len(),
            "Retention applied"
        );

        Ok(result)
    }
}
