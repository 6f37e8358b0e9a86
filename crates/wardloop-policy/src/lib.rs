//! Command safety gate: the last checkpoint before a worker-proposed shell
//! command reaches the external sandbox executor.

mod shell_parse;

pub use shell_parse::GateError;

use wardloop_core::AgentError;

/// Run the command safety gate and map its result into the workspace-wide
/// error taxonomy. `max_pipes` bounds how many `|` operators a single command
/// may contain.
pub fn check_command(cmd: &str, max_pipes: usize) -> Result<(), AgentError> {
    shell_parse::check_command(cmd, max_pipes).map_err(|err| AgentError::PolicyViolation {
        reason: err.to_string(),
    })
}
