//! Message lifecycle engine.
//!
//! Owns the `Created -> Unread -> Read -> Expired` state machine.  A message
//! is created unread with the grace-window deadline; the read transition
//! happens at most once and replaces the deadline with `now + lifespan`.
//! Expiry itself is carried out by the sweeper.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::artifact::{audio_extension, base_content_type, ArtifactError, ArtifactStore};
use crate::clock::Clock;
use crate::ledger::{Ledger, LedgerError};
use crate::logging;
use crate::model::{deadline_after, Lifespan, VoiceMessage};
use crate::notifier::Notifier;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{0}")]
    Validation(String),
    #[error("message not found")]
    NotFound,
    #[error("{0}")]
    Forbidden(String),
    #[error("artifact storage failed: {0}")]
    Storage(#[from] ArtifactError),
    #[error("ledger unavailable: {0}")]
    TransientIo(#[from] LedgerError),
}

/// Uploaded audio as received from the client.
#[derive(Debug, Clone)]
pub struct AudioUpload {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

pub struct LifecycleEngine {
    ledger: Arc<Ledger>,
    artifacts: Arc<dyn ArtifactStore>,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
    max_audio_bytes: usize,
}

impl LifecycleEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        artifacts: Arc<dyn ArtifactStore>,
        notifier: Arc<Notifier>,
        clock: Arc<dyn Clock>,
        max_audio_bytes: usize,
    ) -> Self {
        Self {
            ledger,
            artifacts,
            notifier,
            clock,
            max_audio_bytes,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn validate_audio(&self, audio: Option<AudioUpload>) -> Result<AudioUpload, LifecycleError> {
        let audio = match audio {
            Some(audio) if !audio.bytes.is_empty() => audio,
            _ => return Err(LifecycleError::Validation("audio file is required".into())),
        };
        if audio_extension(&audio.content_type).is_none() {
            return Err(LifecycleError::Validation(format!(
                "unsupported audio type: {}",
                base_content_type(&audio.content_type)
            )));
        }
        if audio.bytes.len() > self.max_audio_bytes {
            return Err(LifecycleError::Validation(format!(
                "audio exceeds {} bytes",
                self.max_audio_bytes
            )));
        }
        Ok(audio)
    }

    /// Store the audio, record an unread message and announce it.
    ///
    /// `lifespan` is coerced: anything other than `3m`, `3h` or `3d`
    /// (including nothing) becomes `3h`.
    pub async fn create(
        &self,
        sender_id: &str,
        receiver_id: &str,
        audio: Option<AudioUpload>,
        lifespan: Option<&str>,
    ) -> Result<VoiceMessage, LifecycleError> {
        if sender_id.is_empty() || receiver_id.is_empty() {
            return Err(LifecycleError::Validation(
                "sender and receiver are required".into(),
            ));
        }
        let audio = self.validate_audio(audio)?;
        let lifespan = Lifespan::parse_or_default(lifespan);

        let content_type = base_content_type(&audio.content_type);
        let artifact_ref = self.artifacts.put(audio.bytes, &content_type).await?;

        let message = VoiceMessage::new_unread(
            uuid::Uuid::new_v4().to_string(),
            sender_id.to_string(),
            receiver_id.to_string(),
            artifact_ref,
            lifespan,
            self.clock.now_ms(),
        );

        if let Err(e) = self.ledger.insert_message(&message) {
            if let Err(cleanup) = self.artifacts.delete(&message.artifact_ref).await {
                tracing::warn!(
                    artifact = %message.artifact_ref,
                    error = %cleanup,
                    "orphaned artifact after failed insert"
                );
            }
            return Err(e.into());
        }

        tracing::info!(
            id = %logging::msg_id(&message.id),
            from = %logging::user_id(sender_id),
            to = %logging::user_id(receiver_id),
            lifespan = %lifespan,
            "message sent"
        );

        self.notifier.notify_new_message(&message).await;
        Ok(message)
    }

    /// Apply the read transition on behalf of `acting_user_id`.
    ///
    /// Only the receiver may read.  Reading an already read message returns
    /// it unchanged and emits nothing.
    pub async fn mark_read(
        &self,
        message_id: &str,
        acting_user_id: &str,
    ) -> Result<VoiceMessage, LifecycleError> {
        let now = self.clock.now_ms();
        let message = self
            .ledger
            .get_message(message_id)?
            .filter(|m| !m.is_expired(now))
            .ok_or(LifecycleError::NotFound)?;

        if message.receiver_id != acting_user_id {
            return Err(LifecycleError::Forbidden(
                "only the receiver can mark a message as read".into(),
            ));
        }
        if message.is_read {
            return Ok(message);
        }

        let expires_at = deadline_after(now, message.lifespan.duration());
        if !self.ledger.mark_read(message_id, expires_at, now)? {
            // Someone else won the transition, or a sweep claimed the row
            // in between.
            return self
                .ledger
                .get_message(message_id)?
                .filter(|m| !m.is_expired(now))
                .ok_or(LifecycleError::NotFound);
        }

        let updated = VoiceMessage {
            is_read: true,
            expires_at,
            ..message
        };
        tracing::info!(
            id = %logging::msg_id(&updated.id),
            by = %logging::user_id(acting_user_id),
            lifespan = %updated.lifespan,
            expires_at = updated.expires_at,
            "message read"
        );
        self.notifier.notify_message_read(&updated).await;
        Ok(updated)
    }

    pub fn get_message(
        &self,
        message_id: &str,
        acting_user_id: &str,
    ) -> Result<VoiceMessage, LifecycleError> {
        let now = self.clock.now_ms();
        let message = self
            .ledger
            .get_message(message_id)?
            .filter(|m| !m.is_expired(now))
            .ok_or(LifecycleError::NotFound)?;
        if !message.is_participant(acting_user_id) {
            return Err(LifecycleError::Forbidden(
                "not a participant of this message".into(),
            ));
        }
        Ok(message)
    }

    /// Live messages between `user_id` and `partner_id`, oldest first.
    pub fn list_conversation(
        &self,
        user_id: &str,
        partner_id: &str,
    ) -> Result<Vec<VoiceMessage>, LifecycleError> {
        Ok(self
            .ledger
            .list_conversation(user_id, partner_id, self.clock.now_ms())?)
    }

    /// Unread message count per sender for `user_id`.
    pub fn unread_counts(&self, user_id: &str) -> Result<BTreeMap<String, u32>, LifecycleError> {
        Ok(self.ledger.unread_counts(user_id, self.clock.now_ms())?)
    }

    /// Delete a message and its audio on behalf of either participant.
    ///
    /// If the artifact cannot be removed, or the call is cancelled midway,
    /// the row stays hidden from every reader and the sweeper finishes the
    /// job on a later pass.
    pub async fn delete_message(
        &self,
        message_id: &str,
        acting_user_id: &str,
    ) -> Result<(), LifecycleError> {
        let message = self.get_message(message_id, acting_user_id)?;
        if !self.ledger.claim_for_delete(message_id)? {
            return Err(LifecycleError::NotFound);
        }
        let mut claim = DeleteClaim {
            ledger: &self.ledger,
            message_id,
            finished: false,
        };
        self.artifacts.delete(&message.artifact_ref).await?;
        let removed = self.ledger.delete_claimed_for_delete(message_id)?;
        claim.finished = true;
        if !removed {
            return Err(LifecycleError::NotFound);
        }

        tracing::info!(
            id = %logging::msg_id(message_id),
            by = %logging::user_id(acting_user_id),
            "message deleted"
        );
        self.notifier.notify_message_deleted(&message).await;
        Ok(())
    }
}

/// A participant-delete claim.  Unless the delete finished, dropping it
/// hands the row to the sweeper.
struct DeleteClaim<'a> {
    ledger: &'a Ledger,
    message_id: &'a str,
    finished: bool,
}

impl Drop for DeleteClaim<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.ledger.release_to_sweeper(self.message_id) {
            Ok(_) => tracing::warn!(
                id = %logging::msg_id(self.message_id),
                "delete interrupted, left to the sweeper"
            ),
            Err(e) => tracing::error!(
                id = %logging::msg_id(self.message_id),
                error = %e,
                "failed to release delete claim"
            ),
        }
    }
}
