//! Container service agent
//!
//! Process wiring for the `cse` binary. The behavior dispatch, task tracking,
//! reconcilers and ACL convergence live in `cse-agent`; the entity store
//! client in `cse-store`.
//!
//! # Modules
//!
//! - [`config`] - command line settings and the typed configs built from them
//! - [`journal`] - task records saved after every status change
//! - [`service`] - the JSON-lines message loop run by `cse agent`

#![deny(missing_docs)]

pub mod config;
pub mod journal;
pub mod service;

pub use config::Settings;
