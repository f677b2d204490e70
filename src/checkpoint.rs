use std::ffi::OsString;
use std::path::{Path, PathBuf};

use burn::{
    module::{AutodiffModule, Module},
    optim::Optimizer,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder, RecorderError},
    tensor::backend::{AutodiffBackend, Backend},
};

#[derive(thiserror::Error, Debug)]
pub enum CheckpointerError {
    #[error("Checkpoint I/O failed on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No checkpoint found at '{0}'")]
    NotFound(PathBuf),

    #[error("Checkpoint record error: {0:?}")]
    Recorder(RecorderError),

    #[error("Checkpoint at '{path}' does not match the model: {details}")]
    Mismatch { path: PathBuf, details: String },
}

/// Saves and restores records at a fixed path, overwriting the previous checkpoint.
///
/// The model weights live at `path`, the optimizer state next to it with an `.optim` suffix.
#[derive(Clone, Debug)]
pub struct FileCheckpointer {
    path: PathBuf,
    recorder: NamedMpkBytesRecorder<FullPrecisionSettings>,
}

impl FileCheckpointer {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            recorder: NamedMpkBytesRecorder::default(),
        }
    }

    /// Location of the model weights.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Location of the optimizer state.
    pub fn optimizer_path(&self) -> PathBuf {
        with_suffix(&self.path, ".optim")
    }

    /// Save every learnable tensor of the module.
    pub fn save<B: Backend, M: Module<B>>(&self, module: &M) -> Result<&Path, CheckpointerError> {
        let bytes = Recorder::<B>::record(&self.recorder, module.clone().into_record(), ())
            .map_err(CheckpointerError::Recorder)?;
        write_atomic(&self.path, &bytes)?;
        log::debug!("Saved model checkpoint to '{}'", self.path.display());

        Ok(&self.path)
    }

    /// Load the saved tensors into `module`, discarding its current values.
    pub fn restore<B: Backend, M: Module<B>>(
        &self,
        module: M,
        device: &B::Device,
    ) -> Result<M, CheckpointerError> {
        let bytes = read(&self.path)?;
        let record = Recorder::<B>::load::<M::Record>(&self.recorder, bytes, device)
            .map_err(CheckpointerError::Recorder)?;
        log::debug!("Restored model checkpoint from '{}'", self.path.display());

        Ok(module.load_record(record))
    }

    pub fn save_optimizer<B, M, O>(&self, optim: &O) -> Result<PathBuf, CheckpointerError>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let path = self.optimizer_path();
        let bytes = Recorder::<B>::record(&self.recorder, optim.to_record(), ())
            .map_err(CheckpointerError::Recorder)?;
        write_atomic(&path, &bytes)?;

        Ok(path)
    }

    pub fn restore_optimizer<B, M, O>(
        &self,
        optim: O,
        device: &B::Device,
    ) -> Result<O, CheckpointerError>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let bytes = read(&self.optimizer_path())?;
        let record = Recorder::<B>::load::<O::Record>(&self.recorder, bytes, device)
            .map_err(CheckpointerError::Recorder)?;

        Ok(optim.load_record(record))
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn read(path: &Path) -> Result<Vec<u8>, CheckpointerError> {
    std::fs::read(path).map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound => CheckpointerError::NotFound(path.to_path_buf()),
        _ => CheckpointerError::Io {
            path: path.to_path_buf(),
            source,
        },
    })
}

/// Write to a sibling temporary file then rename it, so a reader never sees a partial checkpoint.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointerError> {
    let io_error = |source| CheckpointerError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }

    let temporary = with_suffix(path, ".tmp");
    std::fs::write(&temporary, bytes).map_err(io_error)?;
    std::fs::rename(&temporary, path).map_err(io_error)
}
