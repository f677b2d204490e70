//! File-backed experiment tracking.
//!
//! A [task](Task) is the registered identity of a run. It stores the effective
//! hyperparameters, the reported scalars and the output artifacts under
//! `<root>/<project>/<task>/`.

mod logger;
mod task;

pub use logger::*;
pub use task::*;

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum TrackingError {
    #[error("Tracking I/O failed on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid tracking file '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Task '{current}' is already registered in this process, cannot register '{requested}'")]
    AlreadyInitialized { current: String, requested: String },
}
