//! sandcron: a self-bootstrapping ephemeral job orchestrator.
//!
//! An authenticated trigger provisions a fresh sandbox, boots this same
//! service inside it, waits for it to answer and forwards the trigger. The
//! inner instance runs the job in the background and stops its own sandbox
//! when the job is done.

pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod sandbox;
pub mod testing;
pub mod worker;
