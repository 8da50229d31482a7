//! Jobrunner - process supervision and output event reconstruction.

pub mod artifacts;
pub mod config;
pub mod display;
pub mod events;
pub mod job;
pub mod plugins;
pub mod supervisor;
