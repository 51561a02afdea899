//! Mayer-sampling Monte Carlo for virial coefficients.
//!
//! A target cluster integral is measured relative to a reference whose
//! integral is known exactly, using Bennett overlap sampling between a
//! reference box and a target box, or direct sampling of the reference.

pub mod accumulator;
pub mod app;
pub mod bond;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod geometry;
pub mod integrator;
pub mod io;
pub mod moves;
pub mod overlap;
pub mod potential;
pub mod sampler;

pub use coordinator::{RunParams, RunSummary, WorkerCoordinator};
pub use error::{Result, VirialError};
