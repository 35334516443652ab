//! kiln-session library
//!
//! Feature pipeline state, scheduling and model execution for kiln.

pub mod config;
pub mod db;
pub mod deadlock;
pub mod error;
pub mod exec;
pub mod pipeline;
pub mod protocol;
pub mod reasoning;
pub mod scheduler;
pub mod state;
