//! Worker side of simfleet.
//!
//! A worker process polls an activity broker for simulation tasks, keeps the
//! held task alive with heartbeats, runs its simulations through an external
//! engine and reports one outcome per task. Inputs and outputs travel through
//! `libtransfer` archives.

pub mod broker;
pub mod cli;
pub mod config;
pub mod engine;
pub mod executor;
pub mod heartbeat;
pub mod launcher;
pub mod logging;
pub mod manifest;
pub mod reporter;
pub mod supervisor;
