//! mr-lander - merge-request automation bot for GitLab.
//!
//! Watches the merge requests assigned to a designated bot user and drives
//! each one through rebase, CI and a sha-pinned merge, or hands it back with
//! a comment explaining why it can't be merged.

pub mod config;
pub mod error;
pub mod interval;
pub mod models;
pub mod services;

pub use config::{BotConfig, MergeOptions, Options};
pub use error::{BotError, MergeRefusal};
