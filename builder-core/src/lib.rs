//! Core types shared by every Builder execution-core crate.
//!
//! This crate owns the data model (`Target`, `ActionSpec`, `ActionKey`, `CacheEntry`,
//! `BuildNode`), the workspace configuration layer, the error taxonomy, the structured
//! event sink contract, and the trait boundaries to external collaborators (the DSL
//! layer's target provider, and per-language handlers). Nothing in this crate spawns a
//! process, touches the filesystem beyond config loading, or hashes bytes — those are the
//! concerns of `builder-hash`, `builder-sandbox`, and `builder-cache` respectively.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod traits;

pub use config::WorkspaceConfig;
pub use error::{ConfigError, CoreError};
pub use event::{BuildEvent, BuildSummary, EventSink};
pub use model::{
    ActionKey, ActionSpec, ActionType, BuildNode, CacheEntry, NodeId, NodeStatus, Target,
    TargetId, TargetKind,
};
pub use traits::{DiscoveryMetadata, LanguageHandler, TargetProvider};
