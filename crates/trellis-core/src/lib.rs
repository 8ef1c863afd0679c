//! Trellis Core
//!
//! Core domain types, traits, and error handling for the Trellis
//! pipeline engine. This crate has minimal dependencies and defines
//! the shared vocabulary used by the scheduler.

pub mod document;
pub mod error;
pub mod events;
pub mod failure;
pub mod ids;
pub mod interpolation;
pub mod node;
pub mod ports;
pub mod run;
pub mod strategy;
pub mod trigger;

pub use error::{Error, ResolutionError, Result};
pub use ids::*;
