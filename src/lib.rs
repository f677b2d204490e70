//! Two-session MNIST perceptron training.
//!
//! A task is registered with the tracking store, its parameters are connected, then a
//! perceptron is trained for a first session, checkpointed every epoch, and restored in a
//! second session that resumes training from the saved weights.

pub mod checkpoint;
pub mod data;
pub mod logging;
pub mod metric;
pub mod model;
pub mod params;
pub mod tracking;
pub mod training;

mod error;

pub use error::Error;
