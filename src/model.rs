//! Voice message entity and the lifespan table.
//!
//! All instants are epoch milliseconds.  A message is expired once
//! `now >= expires_at`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deadline applied to an unread message, independent of its lifespan.
pub const GRACE_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Lifespan used when the sender supplies nothing usable.
pub const DEFAULT_LIFESPAN: Lifespan = Lifespan::ThreeHours;

/// Time-to-live a message gets once it has been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifespan {
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "3h")]
    ThreeHours,
    #[serde(rename = "3d")]
    ThreeDays,
}

impl Lifespan {
    /// Strict parse of the wire/storage form.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "3m" => Some(Lifespan::ThreeMinutes),
            "3h" => Some(Lifespan::ThreeHours),
            "3d" => Some(Lifespan::ThreeDays),
            _ => None,
        }
    }

    /// Lenient parse: absent or unrecognised input falls back to
    /// [`DEFAULT_LIFESPAN`] instead of being rejected.
    pub fn parse_or_default(value: Option<&str>) -> Self {
        value.and_then(Self::parse).unwrap_or(DEFAULT_LIFESPAN)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lifespan::ThreeMinutes => "3m",
            Lifespan::ThreeHours => "3h",
            Lifespan::ThreeDays => "3d",
        }
    }

    pub fn duration(&self) -> Duration {
        duration_of(self.as_str())
    }
}

impl fmt::Display for Lifespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a stored lifespan value to its duration.
///
/// Total: any value outside `3m`/`3h`/`3d` maps to the three hour default so
/// rows written by a newer relay with an unknown lifespan still expire.
pub fn duration_of(value: &str) -> Duration {
    match value {
        "3m" => Duration::from_secs(180),
        "3h" => Duration::from_secs(10_800),
        "3d" => Duration::from_secs(259_200),
        _ => Duration::from_secs(10_800),
    }
}

/// Add a duration to an epoch-millisecond instant, saturating.
pub fn deadline_after(now_ms: u64, ttl: Duration) -> u64 {
    now_ms.saturating_add(ttl.as_millis().min(u64::MAX as u128) as u64)
}

/// A single self-destructing audio message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceMessage {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    /// Opaque handle returned by the artifact store.
    pub artifact_ref: String,
    pub lifespan: Lifespan,
    pub created_at: u64,
    pub is_read: bool,
    pub expires_at: u64,
}

impl VoiceMessage {
    /// Build a fresh unread message with the grace-window deadline.
    pub fn new_unread(
        id: String,
        sender_id: String,
        receiver_id: String,
        artifact_ref: String,
        lifespan: Lifespan,
        now_ms: u64,
    ) -> Self {
        Self {
            id,
            sender_id,
            receiver_id,
            artifact_ref,
            lifespan,
            created_at: now_ms,
            is_read: false,
            expires_at: deadline_after(now_ms, GRACE_WINDOW),
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.sender_id == user_id || self.receiver_id == user_id
    }
}
