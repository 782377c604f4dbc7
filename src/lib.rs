//! Tooling around an external diffusion pipeline.
//!
//! - [`device`] / [`probe`]: detect the accelerator and write `device_config.json`
//! - [`batch`] / [`pipeline`]: drive the external pipeline over prompts and models
//! - [`viewer`] / [`gallery`]: browse the resulting summaries and images
//!
//! The three parts only exchange JSON files on disk.

pub mod batch;
pub mod device;
pub mod error;
pub mod gallery;
pub mod io;
pub mod pipeline;
pub mod probe;
pub mod viewer;

pub use error::{Error, Result};
