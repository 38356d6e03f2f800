//! The persistence boundary (§1 Non-goals: "long-term storage layout
//! treated as an opaque persistence interface", §6 persisted state).
//!
//! This crate only defines the shape of what gets persisted and the trait
//! a caller must implement; actual storage (database, queue, file) is an
//! external collaborator out of scope for this runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::orchestrator::state_machine::EndReason;
use crate::types::{Carrier, Direction, Turn};

/// One CallSession document as persisted at session end (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSessionRecord {
    pub id: String,
    pub direction: Direction,
    pub carrier: Carrier,
    pub agent_id: String,
    pub lead_id: Option<String>,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub duration_sec: i64,
    pub status: String,
    pub end_reason: String,
    pub transcript: String,
    pub turns: Vec<Turn>,
    pub ai_processed: bool,
    pub recording_url: Option<String>,
}

impl CallSessionRecord {
    pub fn new(
        id: String,
        direction: Direction,
        carrier: Carrier,
        agent_id: String,
        lead_id: Option<String>,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
        end_reason: &EndReason,
        turns: Vec<Turn>,
    ) -> Self {
        let duration_sec = (end_ts - start_ts).num_seconds().max(0);
        let transcript = format_turns(&turns);
        Self {
            id,
            direction,
            carrier,
            agent_id,
            lead_id,
            start_ts,
            end_ts,
            duration_sec,
            status: "ended".to_string(),
            end_reason: end_reason.as_str().to_string(),
            transcript,
            turns,
            ai_processed: false,
            recording_url: None,
        }
    }
}

/// Formats a transcript as one line per turn, `Agent: …` / `Lead: …`, in
/// order (§4.8 persistence contract, §8 round-trip law).
pub fn format_turns(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| {
            let speaker = match t.role {
                crate::types::TurnRole::Agent => "Agent",
                crate::types::TurnRole::User => "Lead",
            };
            format!("{speaker}: {}", t.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// A CallLog event emitted per state transition (§6 persisted state).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLogEvent {
    pub call_id: String,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    pub at: DateTime<Utc>,
}

/// The opaque storage boundary. Implementations live entirely outside
/// this crate (§1); this runtime never assumes a particular database.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn persist_session(&self, record: CallSessionRecord) -> Result<(), PersistenceError>;
    async fn append_call_log(&self, event: CallLogEvent) -> Result<(), PersistenceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),
}

/// Default [`PersistencePort`] for the standalone binary: logs each
/// session record and call-log event at `info` rather than storing them.
/// A deployment that wants real storage wires its own implementation in
/// (§1 Non-goals) — this exists only so the binary has something to pass
/// to [`crate::server::ServerState::new`] out of the box.
#[derive(Debug, Default)]
pub struct LoggingPersistence;

#[async_trait]
impl PersistencePort for LoggingPersistence {
    async fn persist_session(&self, record: CallSessionRecord) -> Result<(), PersistenceError> {
        tracing::info!(call_id = %record.id, end_reason = %record.end_reason, duration_sec = record.duration_sec, "call session ended");
        Ok(())
    }

    async fn append_call_log(&self, event: CallLogEvent) -> Result<(), PersistenceError> {
        tracing::debug!(call_id = %event.call_id, from = %event.from_state, to = %event.to_state, event = %event.event, "call state transition");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TurnRole;

    #[test]
    fn format_turns_produces_one_line_per_turn_in_order() {
        let turns = vec![
            Turn::new(TurnRole::Agent, "Hi there"),
            Turn::new(TurnRole::User, "Hello"),
            Turn::new(TurnRole::Agent, "How can I help?"),
        ];
        let out = format_turns(&turns);
        assert_eq!(out, "Agent: Hi there\nLead: Hello\nAgent: How can I help?");
    }

    #[test]
    fn format_turns_on_empty_transcript_is_empty_string() {
        assert_eq!(format_turns(&[]), "");
    }
}
