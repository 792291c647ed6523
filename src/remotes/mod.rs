//! Concrete special remotes riding on the protocol engine.

pub mod archive;
pub mod web;

pub use archive::ArchiveRemote;
pub use web::{Downloader, HttpDownloader, UrlStatus, WebRemote};
