//! surfacefx: refresh-driven video effect pipeline
//!
//! Imports decoded video surfaces as zero-copy GPU buffers, renders them
//! through a parameterized shader effect once per display refresh, and
//! publishes the result. GPU textures are recycled through a reference
//! counted buffer pool with age-based eviction.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod control;
pub mod effect;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod import;
pub mod output;
pub mod pipeline;
pub mod utils;
pub mod video;

#[cfg(test)]
mod testing;

pub use error::{PipelineError, Result};
