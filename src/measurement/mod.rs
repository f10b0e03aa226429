//! Periodic measurement of one WPS process.

mod job;
mod state;

pub use job::*;
pub use state::*;
