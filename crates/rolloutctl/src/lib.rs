//! rolloutctl library - exposes the CLI and command handlers for tests

pub mod cli;
pub mod commands;
pub mod logging;

use rollout_common::RolloutError;

/// Process exit status for a failed command: the library error code when one
/// is in the chain, 1 otherwise.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<RolloutError>())
        .and_then(|e| u8::try_from(e.code()).ok())
        .unwrap_or(1)
}
