use crate::{
    checkpoint::CheckpointerError, data::DataError, params::ParameterError,
    tracking::TrackingError,
};

/// Any error that stops a training run.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointerError),

    #[error(transparent)]
    Tracking(#[from] TrackingError),

    #[error("Could not write progress to the console: {0}")]
    Console(#[from] std::io::Error),
}
