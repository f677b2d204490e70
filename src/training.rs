use std::io::Write;
use std::path::{Path, PathBuf};

use crate::{
    checkpoint::{CheckpointerError, FileCheckpointer},
    data::{batch_items, epoch_batches, total_batches, MnistBatch, MnistBatcher, MnistItem, MnistSplits},
    logging::install_file_logger,
    metric::{accuracy, AverageCost},
    model::{Mlp, MlpConfig},
    params::{ParameterError, Parameters, BATCH_SIZE, DISPLAY_STEP, LEARNING_RATE, MODEL_PATH},
    tracking::{MetricEntry, MetricLogger, Task, TaskStatus, LOG_FILE},
    Error,
};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::AutodiffModule,
    nn::Initializer,
    optim::{adaptor::OptimizerAdaptor, Adam, AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};

#[derive(Config, Debug)]
pub struct RunConfig {
    #[config(default = "String::from(\"examples\")")]
    pub project_name: String,
    #[config(default = "String::from(\"MNIST checkpoint example\")")]
    pub task_name: String,
    /// Directory holding the MNIST IDX files.
    #[config(default = "String::from(\"MNIST_data\")")]
    pub data_dir: String,
    /// Root of the tracking store, the system temporary directory when unset.
    pub tracking_dir: Option<String>,
    #[config(default = 3)]
    pub first_session_epochs: usize,
    #[config(default = 7)]
    pub second_session_epochs: usize,
    #[config(default = 5000)]
    pub validation_size: usize,
    #[config(default = 42)]
    pub seed: u64,
    /// Standard deviation of the random normal initialization.
    #[config(default = 1.0)]
    pub init_std: f64,
}

/// Training hyperparameters read from the parameter store.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingSettings {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub display_step: usize,
    pub model_path: PathBuf,
}

impl TrainingSettings {
    pub fn from_parameters(params: &Parameters) -> Result<Self, ParameterError> {
        Ok(Self {
            learning_rate: params.float(LEARNING_RATE)?,
            batch_size: params.positive_usize(BATCH_SIZE)?,
            display_step: params.positive_usize(DISPLAY_STEP)?,
            model_path: params.path(MODEL_PATH)?,
        })
    }
}

/// Whether the cost of the 0-based `epoch` is printed.
pub fn should_display(epoch: usize, display_step: usize) -> bool {
    epoch % display_step == 0
}

/// Progress line of the 0-based `epoch`.
pub fn epoch_line(epoch: usize, cost: f64) -> String {
    format!("Epoch: {:04} cost= {:.9}", epoch + 1, cost)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochSummary {
    /// 1-based epoch inside its session.
    pub epoch: usize,
    pub cost: f64,
}

type Adaptor<B> = OptimizerAdaptor<Adam, Mlp<B>, B>;

/// Model, optimizer and checkpoint of one training session.
pub struct Session<B: AutodiffBackend> {
    model: Mlp<B>,
    optim: Adaptor<B>,
    settings: TrainingSettings,
    checkpointer: FileCheckpointer,
    batcher: MnistBatcher,
    device: B::Device,
    seed: u64,
    completed_epochs: usize,
}

impl<B: AutodiffBackend> Session<B> {
    /// A session starting from freshly initialized weights.
    pub fn new(config: &MlpConfig, settings: TrainingSettings, seed: u64, device: B::Device) -> Self {
        B::seed(seed);

        Self {
            model: config.init(&device),
            optim: AdamConfig::new().with_epsilon(1e-8).init(),
            checkpointer: FileCheckpointer::new(settings.model_path.clone()),
            settings,
            batcher: MnistBatcher,
            device,
            seed,
            completed_epochs: 0,
        }
    }

    /// A session whose fresh weights are replaced by the saved checkpoint.
    ///
    /// The optimizer state is restored too when it was saved, otherwise the optimizer starts
    /// from zeroed moments.
    pub fn restore(
        config: &MlpConfig,
        settings: TrainingSettings,
        seed: u64,
        device: B::Device,
    ) -> Result<Self, CheckpointerError> {
        let mut session = Self::new(config, settings, seed, device);
        let expected = session.model.layer_shapes();

        let model = session
            .checkpointer
            .restore::<B, Mlp<B>>(session.model.clone(), &session.device)?;
        if model.layer_shapes() != expected {
            return Err(CheckpointerError::Mismatch {
                path: session.checkpointer.path().to_path_buf(),
                details: format!(
                    "expected layers {expected:?}, found {:?}",
                    model.layer_shapes()
                ),
            });
        }
        session.model = model;

        match session
            .checkpointer
            .restore_optimizer::<B, Mlp<B>, _>(session.optim, &session.device)
        {
            Ok(optim) => session.optim = optim,
            Err(CheckpointerError::NotFound(path)) => {
                log::warn!(
                    "No optimizer state at '{}', starting with fresh moments",
                    path.display()
                );
                session.optim = AdamConfig::new().with_epsilon(1e-8).init();
            }
            Err(err) => return Err(err),
        }

        Ok(session)
    }

    /// Number of epochs completed before this session, used to number the reported scalars.
    pub fn with_completed_epochs(mut self, completed_epochs: usize) -> Self {
        self.completed_epochs = completed_epochs;
        self
    }

    pub fn model(&self) -> &Mlp<B> {
        &self.model
    }

    pub fn checkpoint_path(&self) -> &Path {
        self.checkpointer.path()
    }

    /// Train for `num_epochs`, one optimizer step per full batch.
    ///
    /// After every epoch the average cost is reported to `logger`, printed to `out` when the
    /// display step matches, and the weights are saved to the checkpoint path.
    pub fn train<D: Dataset<MnistItem>>(
        &mut self,
        num_epochs: usize,
        dataset: &D,
        logger: &mut dyn MetricLogger,
        out: &mut dyn Write,
    ) -> Result<Vec<EpochSummary>, Error> {
        let mut summaries = Vec::with_capacity(num_epochs);

        for epoch in 0..num_epochs {
            let iteration = self.completed_epochs + 1;
            let batches = epoch_batches(
                dataset.len(),
                self.settings.batch_size,
                self.seed.wrapping_add(iteration as u64),
            );
            let mut cost = AverageCost::new(total_batches(dataset.len(), self.settings.batch_size));

            for indices in batches.iter() {
                let batch: MnistBatch<B> =
                    self.batcher.batch(batch_items(dataset, indices), &self.device);
                cost.update(self.step(batch));
            }

            if should_display(epoch, self.settings.display_step) {
                writeln!(out, "{}", epoch_line(epoch, cost.value()))?;
            }
            log::info!(
                "Epoch {} ({} batches) cost {:.9}",
                epoch + 1,
                batches.len(),
                cost.value()
            );
            logger.log(&MetricEntry::new("cost", "train", iteration, cost.value()))?;

            self.save()?;
            self.completed_epochs = iteration;
            summaries.push(EpochSummary {
                epoch: epoch + 1,
                cost: cost.value(),
            });
        }

        Ok(summaries)
    }

    /// Save the weights and the optimizer state, overwriting the previous checkpoint.
    pub fn save(&self) -> Result<&Path, CheckpointerError> {
        self.checkpointer
            .save_optimizer::<B, Mlp<B>, _>(&self.optim)?;
        self.checkpointer.save::<B, Mlp<B>>(&self.model)
    }

    /// Classification accuracy over the whole dataset in one pass.
    pub fn evaluate<D: Dataset<MnistItem>>(&self, dataset: &D) -> f64 {
        let items: Vec<MnistItem> = dataset.iter().collect();
        if items.is_empty() {
            return 0.0;
        }

        let model = self.model.valid();
        let batch: MnistBatch<B::InnerBackend> = self.batcher.batch(items, &self.device);

        accuracy(model.forward(batch.images), batch.targets)
    }

    fn step(&mut self, batch: MnistBatch<B>) -> f64 {
        let loss = self.model.forward_loss(batch.images, batch.targets);
        let value = loss.clone().into_scalar().elem::<f64>();

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self
            .optim
            .step(self.settings.learning_rate, self.model.clone(), grads);

        value
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionReport {
    pub epochs: Vec<EpochSummary>,
    pub accuracy: f64,
    pub checkpoint: PathBuf,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResumeReport {
    pub first: SessionReport,
    pub second: SessionReport,
}

/// Train a first session from scratch, then resume from its checkpoint in a second session.
pub fn train_and_resume<B: AutodiffBackend>(
    config: &RunConfig,
    model_config: &MlpConfig,
    settings: &TrainingSettings,
    splits: &MnistSplits,
    logger: &mut dyn MetricLogger,
    out: &mut dyn Write,
    device: &B::Device,
) -> Result<ResumeReport, Error> {
    writeln!(out, "Starting 1st session...")?;
    let mut session =
        Session::<B>::new(model_config, settings.clone(), config.seed, device.clone());
    let epochs = session.train(config.first_session_epochs, &splits.train, logger, out)?;
    writeln!(out, "First Optimization Finished!")?;

    let accuracy = session.evaluate(&splits.test);
    writeln!(out, "Accuracy: {accuracy}")?;
    let checkpoint = session.save()?.to_path_buf();
    writeln!(out, "Model saved in file: {}", checkpoint.display())?;
    logger.log(&MetricEntry::new(
        "accuracy",
        "test",
        config.first_session_epochs,
        accuracy,
    ))?;
    let first = SessionReport {
        epochs,
        accuracy,
        checkpoint,
    };

    writeln!(out, "Starting 2nd session...")?;
    let mut session = Session::<B>::restore(
        model_config,
        settings.clone(),
        config.seed,
        device.clone(),
    )?
    .with_completed_epochs(config.first_session_epochs);
    writeln!(
        out,
        "Model restored from file: {}",
        session.checkpoint_path().display()
    )?;
    let epochs = session.train(config.second_session_epochs, &splits.train, logger, out)?;
    writeln!(out, "Second Optimization Finished!")?;

    let accuracy = session.evaluate(&splits.test);
    writeln!(out, "Accuracy: {accuracy}")?;
    let checkpoint = session.checkpoint_path().to_path_buf();
    writeln!(out, "Model saved in file: {}", checkpoint.display())?;
    logger.log(&MetricEntry::new(
        "accuracy",
        "test",
        config.first_session_epochs + config.second_session_epochs,
        accuracy,
    ))?;
    let second = SessionReport {
        epochs,
        accuracy,
        checkpoint,
    };

    Ok(ResumeReport { first, second })
}

/// Register the task, connect its parameters, load MNIST and run both sessions.
pub fn run<B: AutodiffBackend>(config: RunConfig, device: B::Device) -> Result<ResumeReport, Error> {
    let root = config
        .tracking_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(Task::default_root);
    let directory = Task::directory_in(&root, &config.project_name, &config.task_name);
    install_file_logger(&directory.join(LOG_FILE));

    let task = Task::init_in(&root, &config.project_name, &config.task_name)?;
    task.save_config(&config)?;

    let report = run_task::<B>(task, &config, &device);
    let status = match report {
        Ok(_) => TaskStatus::Completed,
        Err(ref err) => {
            log::error!("Run failed: {err}");
            TaskStatus::Failed
        }
    };
    task.set_status(status)?;

    report
}

fn run_task<B: AutodiffBackend>(
    task: &Task,
    config: &RunConfig,
    device: &B::Device,
) -> Result<ResumeReport, Error> {
    let mut parameters = Parameters::default();
    task.connect(&mut parameters)?;

    let model_config = MlpConfig::from_parameters(&parameters)?.with_initializer(
        Initializer::Normal {
            mean: 0.0,
            std: config.init_std,
        },
    );
    let settings = TrainingSettings::from_parameters(&parameters)?;
    let splits = MnistSplits::load(&config.data_dir, config.validation_size)?;

    let mut logger = task.metric_logger();
    let mut stdout = std::io::stdout();
    let report = train_and_resume::<B>(
        config,
        &model_config,
        &settings,
        &splits,
        &mut logger,
        &mut stdout,
        device,
    )?;
    task.register_artifact("model", &report.second.checkpoint)?;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::InMemoryMetricLogger;
    use burn::backend::Autodiff;

    type TestBackend = burn::backend::NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn settings(dir: &Path, batch_size: usize, display_step: usize) -> TrainingSettings {
        TrainingSettings {
            learning_rate: 0.01,
            batch_size,
            display_step,
            model_path: dir.join("model.ckpt"),
        }
    }

    fn items(count: usize) -> Vec<MnistItem> {
        (0..count)
            .map(|i| {
                let label = (i % 2) as u8;
                let pixels = (0..4)
                    .map(|p| if p % 2 == usize::from(label) { 255 } else { 0 })
                    .collect();
                MnistItem { pixels, label }
            })
            .collect()
    }

    #[test]
    fn display_step_selects_printed_epochs() {
        assert!((0..5).all(|epoch| should_display(epoch, 1)));

        let printed: Vec<usize> = (0..7)
            .filter(|epoch| should_display(*epoch, 2))
            .map(|epoch| epoch + 1)
            .collect();
        assert_eq!(printed, vec![1, 3, 5, 7]);
    }

    #[test]
    fn epoch_line_is_zero_padded_with_nine_decimals() {
        assert_eq!(epoch_line(0, 1.5), "Epoch: 0001 cost= 1.500000000");
        assert_eq!(epoch_line(11, 0.123456789123), "Epoch: 0012 cost= 0.123456789");
    }

    #[test]
    fn settings_reject_zero_divisors() {
        let mut params = Parameters::default();
        params.set(BATCH_SIZE, 0usize);

        assert!(matches!(
            TrainingSettings::from_parameters(&params),
            Err(ParameterError::NotPositive { .. })
        ));
    }

    #[test]
    fn training_prints_one_line_per_displayed_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let splits = MnistSplits::new(items(20), Vec::new(), items(4));

        for (display_step, expected_lines) in [(1, 4), (2, 2)] {
            let mut session = Session::<TestAutodiffBackend>::new(
                &MlpConfig::new(4, 8, 8, 2),
                settings(dir.path(), 5, display_step),
                0,
                Default::default(),
            );
            let mut logger = InMemoryMetricLogger::default();
            let mut out = Vec::new();

            let summaries = session
                .train(4, &splits.train, &mut logger, &mut out)
                .unwrap();

            let out = String::from_utf8(out).unwrap();
            let lines: Vec<&str> = out.lines().collect();
            assert_eq!(lines.len(), expected_lines);
            assert!(lines[0].starts_with("Epoch: 0001 cost= "));
            if display_step == 2 {
                assert!(lines[1].starts_with("Epoch: 0003 cost= "));
            }
            assert_eq!(summaries.len(), 4);
            assert_eq!(logger.values("cost", "train").len(), 4);
        }
    }

    #[test]
    fn every_epoch_overwrites_the_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let splits = MnistSplits::new(items(10), Vec::new(), items(2));
        let mut session = Session::<TestAutodiffBackend>::new(
            &MlpConfig::new(4, 3, 3, 2),
            settings(dir.path(), 5, 1),
            0,
            Default::default(),
        );

        session
            .train(
                2,
                &splits.train,
                &mut InMemoryMetricLogger::default(),
                &mut std::io::sink(),
            )
            .unwrap();

        let mut files: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        assert_eq!(files, vec!["model.ckpt", "model.ckpt.optim"]);
    }

    #[test]
    fn evaluation_accuracy_is_a_fraction() {
        let dir = tempfile::tempdir().unwrap();
        let splits = MnistSplits::new(Vec::new(), Vec::new(), items(9));
        let session = Session::<TestAutodiffBackend>::new(
            &MlpConfig::new(4, 3, 3, 2),
            settings(dir.path(), 5, 1),
            0,
            Default::default(),
        );

        let accuracy = session.evaluate(&splits.test);

        assert!((0.0..=1.0).contains(&accuracy));
        assert!(((accuracy * 9.0).round() - accuracy * 9.0).abs() < 1e-9);
        assert_eq!(session.evaluate(&splits.train), 0.0);
    }

    #[test]
    fn restored_session_predicts_like_the_saved_one() {
        let dir = tempfile::tempdir().unwrap();
        let config = MlpConfig::new(4, 8, 8, 2);
        let splits = MnistSplits::new(items(20), Vec::new(), items(6));
        let mut session = Session::<TestAutodiffBackend>::new(
            &config,
            settings(dir.path(), 5, 1),
            0,
            Default::default(),
        );
        session
            .train(
                2,
                &splits.train,
                &mut InMemoryMetricLogger::default(),
                &mut std::io::sink(),
            )
            .unwrap();

        let restored = Session::<TestAutodiffBackend>::restore(
            &config,
            settings(dir.path(), 5, 1),
            0,
            Default::default(),
        )
        .unwrap();
        let fresh = Session::<TestAutodiffBackend>::new(
            &config,
            settings(dir.path(), 5, 1),
            0,
            Default::default(),
        );

        let device = Default::default();
        let batch: MnistBatch<TestBackend> =
            MnistBatcher.batch(splits.test.iter().collect(), &device);
        let predict = |session: &Session<TestAutodiffBackend>| {
            session
                .model()
                .valid()
                .forward(batch.images.clone())
                .into_data()
                .to_vec::<f32>()
                .unwrap()
        };
        assert_eq!(predict(&restored), predict(&session));
        assert_ne!(predict(&fresh), predict(&session));
    }

    #[test]
    fn restore_rejects_a_checkpoint_of_another_network() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::<TestAutodiffBackend>::new(
            &MlpConfig::new(4, 3, 3, 2),
            settings(dir.path(), 5, 1),
            0,
            Default::default(),
        );
        session.save().unwrap();

        let result = Session::<TestAutodiffBackend>::restore(
            &MlpConfig::new(4, 6, 3, 2),
            settings(dir.path(), 5, 1),
            0,
            Default::default(),
        );

        assert!(result.is_err());
    }

    #[test]
    fn restore_without_optimizer_state_uses_fresh_moments() {
        let dir = tempfile::tempdir().unwrap();
        let config = MlpConfig::new(4, 3, 3, 2);
        let session = Session::<TestAutodiffBackend>::new(
            &config,
            settings(dir.path(), 5, 1),
            0,
            Default::default(),
        );
        session.save().unwrap();
        std::fs::remove_file(dir.path().join("model.ckpt.optim")).unwrap();

        let restored = Session::<TestAutodiffBackend>::restore(
            &config,
            settings(dir.path(), 5, 1),
            1,
            Default::default(),
        )
        .unwrap();

        assert_eq!(restored.model().layer_shapes(), session.model().layer_shapes());
    }
}
