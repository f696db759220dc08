//! Multi-machine sync: state, engine, throttle (SPEC_FULL.md §4.6, §4.7).

mod auto;
mod engine;
mod state;
mod throttle;

pub use auto::{spawn_auto_sync, AutoSyncConfig};
pub use engine::{SyncEngine, SyncOutcome, SyncResult};
pub use state::{HistoryEntry, Machine, MachineStatus, QueueEntry, SyncAction, SyncPool, SyncState, SyncTrigger};
pub use throttle::Throttler;
