//! Command implementations for the CLI

pub mod live;
pub mod report;
pub mod snapshot;
