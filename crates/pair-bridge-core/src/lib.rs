//! Core abstractions for the pair bridge.
//!
//! This crate provides the fundamental building blocks:
//! - Event types (`ActivityEvent`, `FeedbackEvent`, `ControlEvent`)
//! - `SessionState` - Activity log, feedback queue and long-poll waiters
//! - `BridgeConfig` - Socket location and tuning knobs
//! - `AgentAdapter` trait for pair agent backends

pub mod config;
pub mod events;
pub mod session;
pub mod traits;

pub use config::{BridgeConfig, ConfigError};
pub use events::{
    ActivityEvent, ActivityKind, BridgeStatus, ControlEvent, ControlKind, EmitPayload,
    FeedbackContext, FeedbackEvent, PayloadError, Severity,
};
pub use session::{SessionState, WaitOutcome, WaitTicket, WaiterId};
pub use traits::{AdapterError, AgentAdapter, Backend};
