//! Configuration transforms
//!
//! Pure functions from one Host Configuration to the next. None of them
//! mutate their input or touch the network.

pub mod access;
pub mod health;
pub mod network;
pub mod stage;

pub use access::{add_ssh_key, restrict_operations};
pub use health::configure_forced_rollback;
pub use network::{is_root_verity, rewrite_network, NetworkParams};
pub use stage::{stage_update, PackagingFormat, StageParams, UpdateTargets};
