//! Download-and-extract engine for spatial transcriptomics atlas datasets.
//!
//! Resources are fetched into a content-addressed cache, verified against
//! their MD5 checksums and unpacked when they are archives. See
//! [`manager::DownloadManager`] for the entry point.

pub mod archive;
pub mod cancel;
pub mod checksum;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod manager;
pub mod output;
pub mod progress;
pub mod store;
