//! # bedrock-etcfs
//!
//! Library half of the etcfs server: the globals/overrides configuration
//! model, atomic content injection, and the FUSE implementation.  The
//! `etcfs` binary mounts it over a stratum's `/etc`.

pub mod config;
pub mod fs;
pub mod inject;
