//! Recon pipeline orchestration: tool adapters, staged runs with a persistent
//! history per target, normalized summaries, diffs between runs, and a job
//! queue with an HTTP surface.

pub mod adapters;
pub mod api;
pub mod config;
pub mod db;
pub mod diff;
pub mod error;
pub mod jobs;
pub mod models;
pub mod parser;
pub mod runner;
pub mod security;
pub mod stages;
pub mod workspace;

pub use error::{Result, WrxError};
