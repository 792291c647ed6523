//! Special-remote bridge and process supervision toolkit for git-annex
//! repositories.
//!
//! Two core pieces:
//!
//! - [`runner`]: spawns an external command, drains its captured streams on
//!   dedicated reader threads into a shared channel, and feeds a
//!   [`runner::Protocol`] state machine with ordered I/O events.
//! - [`remote`]: the git-annex external special-remote protocol engine,
//!   dispatching line-oriented requests to a [`remote::SpecialRemote`]
//!   implementation.
//!
//! [`remotes`] provides the archive-backed and web remotes that ship with
//! the `annex-bridge` binary.

pub mod archive;
pub mod cache;
pub mod config;
pub mod remote;
pub mod remotes;
pub mod repo;
pub mod runner;

pub use archive::{ArchiveUrl, ExtractionCache};
pub use cache::LocationCache;
pub use config::Config;
pub use remote::{serve, AnnexIo, Availability, Engine, LoopControl, Presence, SpecialRemote};
pub use remotes::{ArchiveRemote, HttpDownloader, WebRemote};
pub use repo::AnnexRepo;
pub use runner::{CaptureOutput, NoCapture, Protocol, RunCommand, RunOutput, Runner, StreamRole};
