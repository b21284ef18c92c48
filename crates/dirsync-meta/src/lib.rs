#![warn(missing_docs)]

//! dirsync metadata core: USN watermark tracking, cluster membership cache, Raft role/term bookkeeping

pub mod backend;
pub mod cluster;
pub mod directory;
pub mod raft;
pub mod types;
pub mod usn;
