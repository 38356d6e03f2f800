//! Call-lifecycle orchestration: the 9-state machine (C7), voicemail
//! scoring, the per-call session loop (C8), and the campaign dispatcher (C9).

pub mod call_session;
pub mod campaign;
pub mod state_machine;
pub mod voicemail;

pub use call_session::{CallSession, CallSessionContext, ModelSetup};
pub use campaign::{Campaign, CampaignStatus, DispatcherCommand};
pub use state_machine::{CallEvent, CallState, CallStateMachine, EndReason, SideEffect, StateMachineConfig};
