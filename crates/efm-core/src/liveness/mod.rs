//! Liveness monitoring and spawn governance.
//!
//! Capsules prove liveness with periodic signed [`Pulse`] records. The
//! [`LivenessMonitor`] validates each pulse against the vault (identity,
//! genesis hash, signature, tick window, termination), quarantines ghosts
//! immediately, and sweeps for missed windows: one miss quarantines, and
//! reaching the miss limit terminates with a vault tombstone.
//!
//! The [`SpawnGovernor`] enforces the six admission conditions (task
//! justification, parent health, resource admission, lineage depth, swarm
//! coherence, parent-signed genesis) and rolls back children that never
//! emit their first pulse.

mod monitor;
mod pulse;
mod spawn;


pub use monitor::{
    LivenessConfig, LivenessError, LivenessMonitor, PulseOutcome, PulseRejection, SweepAction,
};
pub use pulse::Pulse;
pub use spawn::{
    SpawnCondition, SpawnConfig, SpawnError, SpawnGovernor, SpawnLimits, SpawnOutcome,
    SpawnRequest,
};
