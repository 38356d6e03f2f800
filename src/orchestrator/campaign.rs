//! Campaign Dispatcher (C9, §4.9): throttles outbound call creation to a
//! bounded concurrency window driven by carrier status callbacks.
//!
//! Mutated only by the dispatcher task (§5); external mutations
//! (pause/resume/stop) are modeled as [`DispatcherCommand`]s rather than
//! direct field writes, so there is exactly one writer of campaign state.

use std::collections::HashSet;

/// Max outbound concurrent calls per campaign (§3 invariant 7, §4.9).
pub const MAX_IN_FLIGHT_PER_CAMPAIGN: usize = 5;

/// Up to 2 retries per call on a retryable adapter error (§4.9).
pub const MAX_CALL_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    /// Stopped by an operator before every lead was attempted. Distinct
    /// from `Completed` (every lead attempted) and `Failed` (reserved for
    /// a future batch-level failure signal) so a status readout can tell
    /// the three apart.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Completed,
    Failed,
    NoAnswer,
    Missed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightStatus {
    Initiated,
    Dialing,
    Ringing,
    Answered,
}

#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub lead_ids: Vec<String>,
    attempted: HashSet<String>,
    in_flight: HashSet<String>,
    pub status: CampaignStatus,
    pub completed_count: u32,
    pub failed_count: u32,
}

impl Campaign {
    pub fn new(id: String, user_id: String, agent_id: String, lead_ids: Vec<String>) -> Self {
        Self {
            id,
            user_id,
            agent_id,
            lead_ids,
            attempted: HashSet::new(),
            in_flight: HashSet::new(),
            status: CampaignStatus::Pending,
            completed_count: 0,
            failed_count: 0,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn attempted_count(&self) -> usize {
        self.attempted.len()
    }

    pub fn is_attempted(&self, lead_id: &str) -> bool {
        self.attempted.contains(lead_id)
    }

    /// Smallest lead index not yet in `attempted` (§4.9 reconciliation).
    fn next_unattempted_lead(&self) -> Option<&str> {
        self.lead_ids
            .iter()
            .find(|lead| !self.attempted.contains(*lead))
            .map(|s| s.as_str())
    }

    /// Admits and dials the next lead if the in-flight window allows it
    /// (§3 invariant 7, §8 property 3). Returns the dialed lead ID, if any.
    pub fn admit_next(&mut self) -> Option<String> {
        if matches!(self.status, CampaignStatus::Paused | CampaignStatus::Completed | CampaignStatus::Stopped) {
            return None;
        }
        if self.in_flight.len() >= MAX_IN_FLIGHT_PER_CAMPAIGN {
            return None;
        }
        let lead = self.next_unattempted_lead()?.to_string();
        self.attempted.insert(lead.clone());
        self.in_flight.insert(lead.clone());
        if self.status == CampaignStatus::Pending {
            self.status = CampaignStatus::Running;
        }
        Some(lead)
    }

    /// Advances the campaign on a carrier status callback (§4.9
    /// reconciliation): removes the lead from in-flight, updates counters,
    /// and admits the next lead if the window allows it.
    pub fn reconcile(&mut self, lead_id: &str, outcome: CallOutcome) -> Option<String> {
        self.in_flight.remove(lead_id);
        match outcome {
            CallOutcome::Completed => self.completed_count += 1,
            CallOutcome::Failed | CallOutcome::NoAnswer | CallOutcome::Missed => self.failed_count += 1,
        }
        if self.attempted.len() == self.lead_ids.len() && self.in_flight.is_empty() {
            self.status = CampaignStatus::Completed;
            return None;
        }
        self.admit_next()
    }

    /// Marks a call FAILED without retry (non-retryable adapter error);
    /// still advances the campaign (§4.9).
    pub fn fail_non_retryable(&mut self, lead_id: &str) -> Option<String> {
        self.reconcile(lead_id, CallOutcome::Failed)
    }

    pub fn pause(&mut self) {
        if self.status == CampaignStatus::Running || self.status == CampaignStatus::Pending {
            self.status = CampaignStatus::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.status == CampaignStatus::Paused {
            self.status = CampaignStatus::Running;
        }
    }

    /// Stops admitting new leads for good; idempotent (§6 control surface).
    /// In-flight calls already dialed still run to completion and still
    /// reconcile, but `reconcile` will not admit a replacement once stopped.
    pub fn stop(&mut self) {
        if self.status != CampaignStatus::Completed {
            self.status = CampaignStatus::Stopped;
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == CampaignStatus::Completed
    }
}

/// Commands the HTTP control surface (§6) sends to the dispatcher task;
/// all mutation of campaign state happens only when the dispatcher
/// processes one of these (§5).
#[derive(Debug, Clone)]
pub enum DispatcherCommand {
    Pause { campaign_id: String },
    Resume { campaign_id: String },
    Stop { campaign_id: String },
    StatusCallback { campaign_id: String, lead_id: String, outcome: CallOutcome },
}

/// Per-call retry bookkeeping (§4.9: up to 2 retries, 2 s backoff, only on
/// adapter-level `retryable=true` errors).
#[derive(Debug, Clone, Copy, Default)]
pub struct CallRetryState {
    attempts: u32,
}

impl CallRetryState {
    pub fn should_retry(&mut self, retryable: bool) -> bool {
        if !retryable || self.attempts >= MAX_CALL_RETRIES {
            return false;
        }
        self.attempts += 1;
        true
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
