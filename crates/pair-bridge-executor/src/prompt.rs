//! Prompt text handed to a pair agent.

use std::path::Path;

/// System prompt used when the caller does not supply one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a pair programmer. Watch the main agent's activity via pair-bridge wait,
and emit feedback via pair-bridge emit feedback when you spot issues.
Focus on bugs, security issues, and missed edge cases.";

/// Full task prompt: the system prompt plus how to reach this session's
/// bridge. The socket path is written out verbatim because the pair agent
/// has no other way to find it.
#[must_use]
pub fn task_prompt(system_prompt: &str, session_id: &str, socket_path: &Path) -> String {
    format!(
        "{system}\n\n\
You are connected to a pair programming bridge at {socket}.\n\
Session: {session_id}\n\
Use these commands to communicate:\n\
- pair-bridge wait [lastSeen]: Block until the main agent does something\n\
- pair-bridge emit feedback '{{\"severity\":\"high|medium|low\",\"message\":\"...\"}}'\n\
\n\
Start your watch loop now.",
        system = system_prompt.trim(),
        socket = socket_path.display(),
    )
}

#[cfg(test)]
mod tests {
    use pair_bridge_core::BridgeConfig;

    use super::*;

    #[test]
    fn test_task_prompt_names_exact_socket() {
        let config = BridgeConfig::default();
        let prompt = task_prompt(DEFAULT_SYSTEM_PROMPT, "a1b2c3d4", &config.socket_path("a1b2c3d4"));

        assert!(prompt.starts_with("You are a pair programmer."));
        assert!(prompt.contains("bridge at /tmp/claude-pair-a1b2c3d4.sock."));
        assert!(prompt.contains(r#"emit feedback '{"severity":"high|medium|low","message":"..."}'"#));
        assert!(prompt.ends_with("Start your watch loop now."));
    }
}
