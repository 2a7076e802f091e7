//! Background tasks for the Call Controller.
//!
//! # Tasks
//!
//! - `sweeper` - Times out stale unconnected calls and expires overdue invitations

pub mod sweeper;

pub use sweeper::{run_sweep, start_sweeper, SweepReport, SweeperConfig};
