#![warn(missing_docs)]

//! dirsync replication subsystem: conflict resolution, replication agreements, partner pull cycle driver

pub mod agreement;
pub mod apply;
pub mod config;
pub mod conflict;
pub mod context;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod rpc;
