//! Conversation turns and the call-mode state machine states.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Assistant,
}

/// One user-utterance or assistant-response exchange unit.
///
/// Created when speech starts or text is submitted, mutated incrementally
/// as transcription/response deltas arrive, marked complete on a terminal
/// event or error.
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: Uuid,
    pub role: TurnRole,
    pub transcript: String,
    pub is_complete: bool,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: TurnRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            transcript: String::new(),
            is_complete: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_text(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            transcript: text.into(),
            ..Self::new(role)
        }
    }

    /// Apply a transcription delta in arrival order (simple append).
    pub fn append_delta(&mut self, delta: &str) {
        self.transcript.push_str(delta);
    }

    /// Finalize the turn, preferring the authoritative full transcript
    /// when the remote supplies one.
    pub fn complete(&mut self, transcript: Option<String>) {
        if let Some(full) = transcript {
            let trimmed = full.trim();
            if !trimmed.is_empty() {
                self.transcript = trimmed.to_string();
            }
        }
        self.is_complete = true;
    }
}

/// Call-mode state machine:
/// `Idle → Capturing → Committing → AwaitingResponse → Speaking → Idle`,
/// with error transitions from any state back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Capturing,
    Committing,
    AwaitingResponse,
    Speaking,
}
