use crate::tracking::{Task, TaskStatus};
use std::path::Path;
use tracing_core::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, Layer};

/// Install the global subscriber writing the run's log to `file_path`, and a panic hook that
/// reports the panic there and marks the registered task as failed.
///
/// Records emitted through the `log` facade are forwarded to the same file.
///
/// # Returns
///
/// Whether this call installed the subscriber. Nothing is changed when a subscriber is
/// already set or the log directory cannot be created.
pub fn install_file_logger(file_path: &Path) -> bool {
    let directory = file_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = file_path
        .file_name()
        .unwrap_or_else(|| "experiment.log".as_ref());
    if std::fs::create_dir_all(directory).is_err() {
        return false;
    }

    let targets = Targets::new().with_default(LevelFilter::INFO);
    // wgpu reports every pipeline at info.
    #[cfg(feature = "wgpu")]
    let targets = targets.with_target("wgpu", LevelFilter::WARN);

    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(tracing_appender::rolling::never(directory, file_name))
        .with_filter(targets);

    let installed = registry().with(layer).try_init().is_ok();
    if installed {
        update_panic_hook(file_path);
    }

    installed
}

fn update_panic_hook(file_path: &Path) {
    let hook = std::panic::take_hook();
    let file_path = file_path.display().to_string();

    std::panic::set_hook(Box::new(move |info| {
        log::error!("Training panicked: {info}");

        if let Some(task) = Task::current() {
            match task.try_set_status(TaskStatus::Failed) {
                Ok(true) => {}
                Ok(false) => log::error!("Task record is locked, status left unchanged"),
                Err(err) => log::error!("Could not mark the task as failed: {err}"),
            }
        }

        eprintln!("Training panicked, the run log is at '{file_path}'");
        hook(info);
    }));
}
