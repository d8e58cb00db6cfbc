//! Background expiry sweeper.
//!
//! Each pass removes every message whose deadline has passed.  Removal is
//! claim, delete artifact, delete row; the claim re-checks the deadline so a
//! message read after the candidate scan is left alone.  A message whose
//! artifact could not be removed stays claimed and is picked up again by the
//! next pass.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::artifact::{ArtifactError, ArtifactStore};
use crate::clock::Clock;
use crate::ledger::{Ledger, LedgerError};
use crate::logging;
use crate::model::VoiceMessage;
use crate::notifier::Notifier;

#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Upper bound on the cleanup of a single message.
    pub cleanup_timeout: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
enum SweepError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

pub struct Sweeper {
    ledger: Arc<Ledger>,
    artifacts: Arc<dyn ArtifactStore>,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(
        ledger: Arc<Ledger>,
        artifacts: Arc<dyn ArtifactStore>,
        notifier: Arc<Notifier>,
        clock: Arc<dyn Clock>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            ledger,
            artifacts,
            notifier,
            clock,
            config,
        }
    }

    /// Returns `true` when this call removed the row.
    async fn sweep_one(&self, message: &VoiceMessage, now_ms: u64) -> Result<bool, SweepError> {
        if !self.ledger.claim_expired(&message.id, now_ms)? {
            return Ok(false);
        }
        self.artifacts.delete(&message.artifact_ref).await?;
        Ok(self.ledger.delete_claimed(&message.id)?)
    }

    /// Run a single pass.  Only a failure to list candidates is an error;
    /// per-message failures are counted and logged.
    pub async fn run_once(&self) -> Result<SweepReport, LedgerError> {
        let now = self.clock.now_ms();
        let candidates = self.ledger.list_expired(now)?;
        let mut report = SweepReport {
            scanned: candidates.len(),
            ..SweepReport::default()
        };

        for message in &candidates {
            let outcome =
                tokio::time::timeout(self.config.cleanup_timeout, self.sweep_one(message, now))
                    .await;
            match outcome {
                Ok(Ok(true)) => {
                    report.deleted += 1;
                    self.notifier.notify_message_deleted(message).await;
                }
                Ok(Ok(false)) => report.skipped += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!(
                        id = %logging::msg_id(&message.id),
                        error = %e,
                        "sweep failed, will retry"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::warn!(
                        id = %logging::msg_id(&message.id),
                        timeout_ms = self.config.cleanup_timeout.as_millis() as u64,
                        "sweep timed out, will retry"
                    );
                }
            }
        }

        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                deleted = report.deleted,
                skipped = report.skipped,
                failed = report.failed,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Start the periodic loop.  The first pass runs immediately.  Returns
    /// `None` when the interval is zero (sweeping disabled).
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: oneshot::Receiver<()>) -> Option<JoinHandle<()>> {
        if self.config.interval.is_zero() {
            tracing::warn!("sweep interval is zero, expiry sweeper disabled");
            return None;
        }
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            tracing::warn!(error = %e, "sweep pass aborted");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::debug!("sweeper stopping");
                        break;
                    }
                }
            }
        }))
    }
}
