//! # bedrock-strat
//!
//! Library half of the strat exec wrapper: environment restriction, root
//! switching (chroot or mount-namespace pivot), and PATH-search exec that
//! avoids re-entering the cross mount.

pub mod exec;
pub mod restrict;
pub mod switch;
