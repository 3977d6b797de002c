//! Pair agent adapters.
//!
//! Provides:
//! - `AdapterRegistry` - backend tag to adapter factory
//! - `ClaudeOpusAdapter` - in-session Claude Opus task
//! - `CodexAdapter` - Codex CLI subprocess
//! - Command building and the pair agent task prompt

pub mod claude;
pub mod codex;
pub mod command;
pub mod prompt;
pub mod registry;

pub use claude::ClaudeOpusAdapter;
pub use codex::CodexAdapter;
pub use command::{CommandBuilder, CommandParts};
pub use prompt::{DEFAULT_SYSTEM_PROMPT, task_prompt};
pub use registry::{AdapterFactory, AdapterRegistry};
