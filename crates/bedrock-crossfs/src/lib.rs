//! # bedrock-crossfs
//!
//! Library half of the crossfs server: configuration model, content
//! filters, the generated-service cache, and the FUSE implementation.  The
//! `crossfs` binary wires these to a mount point.

pub mod config;
pub mod filter;
pub mod fs;
pub mod service;
