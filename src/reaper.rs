use crate::errors::AppError;
use crate::repository::BatchRepository;
use chrono::{TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Marks batches that never finished as errored.
///
/// Providers may never call back for some items; without this sweep such a
/// batch would stay `processing` forever.
pub struct StaleBatchReaper {
    store: Arc<dyn BatchRepository>,
    max_age: TimeDelta,
}

impl StaleBatchReaper {
    pub fn new(store: Arc<dyn BatchRepository>, max_age_hours: u64) -> Self {
        Self {
            store,
            max_age: i64::try_from(max_age_hours)
                .ok()
                .and_then(TimeDelta::try_hours)
                .unwrap_or(TimeDelta::MAX),
        }
    }

    fn reason(&self) -> String {
        format!(
            "batch expired: not completed within {} hours",
            self.max_age.num_hours()
        )
    }

    /// Run one sweep. Returns the ids of the batches it expired.
    pub async fn sweep(&self) -> Result<Vec<String>, AppError> {
        let Some(cutoff) = Utc::now().checked_sub_signed(self.max_age) else {
            // No batch can be older than the representable range.
            return Ok(Vec::new());
        };
        let expired = self
            .store
            .expire_stale_batches(cutoff, &self.reason())
            .await?;

        if !expired.is_empty() {
            tracing::warn!(
                "Expired {} stale batch(es) created before {}: {:?}",
                expired.len(),
                cutoff,
                expired
            );
        }
        Ok(expired)
    }

    /// Sweep every `interval` in the background.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep().await {
                    tracing::error!("Stale batch sweep failed: {}", e);
                }
            }
        })
    }
}
