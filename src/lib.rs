//! `caam-core`: credential vault, rotation selector, multi-machine sync, and
//! verifiable bundle export/import for coding-agent provider accounts
//! (Claude, Codex, Gemini). See SPEC_FULL.md for the full specification.
//!
//! This crate does no implicit I/O and installs no global state: callers
//! own their `tracing` subscriber, their [`config::CoreConfig`], and the
//! OAuth refresh HTTP flows behind [`refresh::RefreshRegistry`].

pub mod atomic;
pub mod bundle;
pub mod config;
pub mod error;
pub mod events;
pub mod freshness;
pub mod machines;
pub mod provider;
pub mod refresh;
pub mod selector;
pub mod ssh;
pub mod sync;
pub mod vault;

pub use config::{default_data_root, CoreConfig};
pub use error::{CaamError, Result, TransportErrorKind};
pub use events::{Event, EventStore, EventType};
pub use freshness::{extract, extract_from_dir, fresher, FileSet, Freshness};
pub use machines::{parse_csv_peers, parse_ssh_config, DiscoveredMachine, DiscoverySource};
pub use provider::{is_system_profile, validate_profile_name, Provider};
pub use refresh::{RefreshError, RefreshFn, RefreshRegistry, RefreshedTokens};
pub use selector::{select_random, select_round_robin, select_smart, Algorithm, Alternative, Reason, Selection, SelectorConfig};
pub use vault::{atomic_replace_profile_dir, Vault};
