//! Session orchestration.
//!
//! A `SessionManager` owns at most one active pair session: the broker
//! listening on the session socket and, optionally, the pair agent watching it.

pub mod manager;

pub use manager::{ManagerError, SessionInfo, SessionManager, SessionOptions, SessionStatusReport, SessionSummary};
