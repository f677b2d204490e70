use super::{FileMetricLogger, TrackingError};
use crate::params::Parameters;
use burn::config::Config;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError, TryLockError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Parameter values set on the tracking side, applied by [Task::connect].
pub const OVERRIDES_FILE: &str = "overrides.json";
pub const PARAMETERS_FILE: &str = "parameters.json";
pub const CONFIG_FILE: &str = "config.json";
pub const LOG_FILE: &str = "experiment.log";
const TASK_FILE: &str = "task.json";
const SCALARS_DIR: &str = "scalars";

static CURRENT: OnceLock<Task> = OnceLock::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct TaskRecord {
    project: String,
    name: String,
    status: TaskStatus,
    started_at: u64,
    artifacts: BTreeMap<String, PathBuf>,
}

/// Handle on a registered task.
#[derive(Debug)]
pub struct Task {
    directory: PathBuf,
    record: Mutex<TaskRecord>,
}

impl Task {
    /// Register the process-wide task under the default tracking root.
    ///
    /// Registering the same project and task again returns the existing handle.
    pub fn init(project: &str, name: &str) -> Result<&'static Task, TrackingError> {
        Self::init_in(Self::default_root(), project, name)
    }

    /// Tracking root used by [Task::init].
    pub fn default_root() -> PathBuf {
        std::env::temp_dir().join("mnist-tracking")
    }

    /// Directory a task is stored in, without registering it.
    pub fn directory_in<P: AsRef<Path>>(root: P, project: &str, name: &str) -> PathBuf {
        root.as_ref()
            .join(directory_name(project))
            .join(directory_name(name))
    }

    /// Register the process-wide task under `root`.
    pub fn init_in<P: AsRef<Path>>(
        root: P,
        project: &str,
        name: &str,
    ) -> Result<&'static Task, TrackingError> {
        if let Some(task) = CURRENT.get() {
            return task.ensure_identity(project, name).map(|_| task);
        }

        let task = Self::new(root, project, name)?;
        let task = CURRENT.get_or_init(|| task);
        task.ensure_identity(project, name)?;

        Ok(task)
    }

    /// The process-wide task, if one was registered.
    pub fn current() -> Option<&'static Task> {
        CURRENT.get()
    }

    /// Create a task handle that is not registered process-wide.
    pub fn new<P: AsRef<Path>>(root: P, project: &str, name: &str) -> Result<Self, TrackingError> {
        let directory = Self::directory_in(root, project, name);
        std::fs::create_dir_all(&directory).map_err(|source| TrackingError::Io {
            path: directory.clone(),
            source,
        })?;

        let record = TaskRecord {
            project: project.to_string(),
            name: name.to_string(),
            status: TaskStatus::Running,
            started_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or_default(),
            artifacts: BTreeMap::new(),
        };
        write_json(&directory.join(TASK_FILE), &record)?;
        log::info!("Registered task '{project}/{name}' in '{}'", directory.display());

        Ok(Self {
            directory,
            record: Mutex::new(record),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn project(&self) -> String {
        self.lock().project.clone()
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    /// Apply the task's parameter overrides to `parameters`, then record the effective values.
    pub fn connect(&self, parameters: &mut Parameters) -> Result<(), TrackingError> {
        let overrides_path = self.directory.join(OVERRIDES_FILE);

        if overrides_path.exists() {
            let overrides: Parameters = read_json(&overrides_path)?;
            for name in parameters.merge(overrides) {
                log::info!(
                    "Parameter '{name}' overridden to {}",
                    parameters
                        .get(&name)
                        .map(ToString::to_string)
                        .unwrap_or_default()
                );
            }
        }

        for (name, value) in parameters.iter() {
            log::info!("Parameter {name} = {value}");
        }

        write_json(&self.directory.join(PARAMETERS_FILE), &*parameters)
    }

    /// Save the run configuration next to the task record.
    pub fn save_config<C: Config>(&self, config: &C) -> Result<PathBuf, TrackingError> {
        let path = self.directory.join(CONFIG_FILE);
        config.save(&path).map_err(|source| TrackingError::Io {
            path: path.clone(),
            source,
        })?;

        Ok(path)
    }

    /// A logger writing the reported scalars of this task.
    pub fn metric_logger(&self) -> FileMetricLogger {
        FileMetricLogger::new(self.directory.join(SCALARS_DIR))
    }

    /// Record an output artifact, replacing any artifact with the same name.
    pub fn register_artifact<P: AsRef<Path>>(&self, name: &str, path: P) -> Result<(), TrackingError> {
        let mut record = self.lock();
        record
            .artifacts
            .insert(name.to_string(), path.as_ref().to_path_buf());
        log::info!("Registered artifact '{name}' at '{}'", path.as_ref().display());

        write_json(&self.directory.join(TASK_FILE), &*record)
    }

    pub fn artifacts(&self) -> BTreeMap<String, PathBuf> {
        self.lock().artifacts.clone()
    }

    pub fn set_status(&self, status: TaskStatus) -> Result<(), TrackingError> {
        let mut record = self.lock();
        record.status = status;

        write_json(&self.directory.join(TASK_FILE), &*record)
    }

    /// Like [Task::set_status], but gives up when the record is locked.
    ///
    /// Safe to call from a panic hook. Returns whether the status was written.
    pub fn try_set_status(&self, status: TaskStatus) -> Result<bool, TrackingError> {
        let mut record = match self.record.try_lock() {
            Ok(record) => record,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(false),
        };
        record.status = status;

        write_json(&self.directory.join(TASK_FILE), &*record).map(|_| true)
    }

    fn ensure_identity(&self, project: &str, name: &str) -> Result<(), TrackingError> {
        let record = self.lock();

        if record.project == project && record.name == name {
            return Ok(());
        }

        Err(TrackingError::AlreadyInitialized {
            current: format!("{}/{}", record.project, record.name),
            requested: format!("{project}/{name}"),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TaskRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn directory_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, TrackingError> {
    let content = std::fs::read_to_string(path).map_err(|source| TrackingError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_str(&content).map_err(|source| TrackingError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), TrackingError> {
    let content = serde_json::to_string_pretty(value).map_err(|source| TrackingError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    std::fs::write(path, content).map_err(|source| TrackingError::Io {
        path: path.to_path_buf(),
        source,
    })
}
