use crate::{
    data::{FlowBatch, FlowBatcher, FlowDataset},
    error::Error,
    inference::SCALER_FILE,
    model::{FusionModel, FusionModelConfig},
};
use std::path::Path;
use burn::{
    data::dataloader::DataLoaderBuilder,
    nn::loss::CrossEntropyLossConfig,
    optim::AdamConfig,
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
    train::{
        metric::{AccuracyMetric, LossMetric},
        renderer::{MetricState, MetricsRenderer, TrainingProgress},
        ClassificationOutput, LearnerBuilder, TrainOutput, TrainStep, ValidStep,
    },
};
use log::{debug, info};

impl<B: Backend> FusionModel<B> {
    pub fn forward_classification(
        &self,
        tabular: Tensor<B, 2>,
        sequences: Tensor<B, 3>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(tabular, sequences);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

impl<B: AutodiffBackend> TrainStep<FlowBatch<B>, ClassificationOutput<B>> for FusionModel<B> {
    fn step(&self, batch: FlowBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.tabular, batch.sequences, batch.targets);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<FlowBatch<B>, ClassificationOutput<B>> for FusionModel<B> {
    fn step(&self, batch: FlowBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.tabular, batch.sequences, batch.targets)
    }
}

#[derive(Config)]
pub struct TrainingConfig {
    pub model: FusionModelConfig,
    pub optimizer: AdamConfig,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 64)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
}

pub const CONFIG_FILE: &str = "config.json";
pub const MODEL_FILE: &str = "model";

/// Everything a training run leaves in its artifact directory.
pub const TRAINING_ARTIFACTS: [&str; 7] = [
    CONFIG_FILE,
    "model.mpk",
    SCALER_FILE,
    "checkpoint",
    "train",
    "valid",
    "experiment.log",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct TrainingOptions {
    /// Replace the artifacts of a previous run.
    pub overwrite: bool,
    /// Report progress through `log` instead of the terminal dashboard.
    pub quiet: bool,
}

/// Creates the artifact directory. Only the files of a previous run are
/// removed, and only when `overwrite` is set.
fn prepare_artifact_dir(artifact_dir: &Path, overwrite: bool) -> crate::error::Result<()> {
    std::fs::create_dir_all(artifact_dir)?;

    let previous: Vec<_> = TRAINING_ARTIFACTS
        .iter()
        .map(|name| artifact_dir.join(name))
        .filter(|path| path.exists())
        .collect();
    if previous.is_empty() {
        return Ok(());
    }
    if !overwrite {
        return Err(Error::Artifact {
            path: artifact_dir.display().to_string(),
            message: "directory already holds training artifacts, overwrite not requested"
                .to_string(),
        });
    }

    for path in previous {
        info!("Removing previous artifact {}", path.display());
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Renders learner progress as log records.
#[derive(Default)]
struct ProgressLog {
    epoch: usize,
}

impl ProgressLog {
    fn metric(split: &str, state: MetricState) {
        if let MetricState::Numeric(entry, value) = state {
            debug!("{split} {}: {value:.4}", entry.name);
        }
    }

    fn progress(&mut self, split: &str, item: TrainingProgress) {
        if item.epoch != self.epoch {
            self.epoch = item.epoch;
            info!("Epoch {}/{}", item.epoch, item.epoch_total);
        }
        debug!(
            "{split} iteration {} ({}/{} items)",
            item.iteration, item.progress.items_processed, item.progress.items_total
        );
    }
}

impl MetricsRenderer for ProgressLog {
    fn update_train(&mut self, state: MetricState) {
        Self::metric("train", state);
    }

    fn update_valid(&mut self, state: MetricState) {
        Self::metric("valid", state);
    }

    fn render_train(&mut self, item: TrainingProgress) {
        self.progress("train", item);
    }

    fn render_valid(&mut self, item: TrainingProgress) {
        self.progress("valid", item);
    }
}

pub fn train<B: AutodiffBackend>(
    artifact_dir: &str,
    config: TrainingConfig,
    device: B::Device,
    train: FlowDataset,
    valid: FlowDataset,
    options: TrainingOptions,
) -> crate::error::Result<FusionModel<B>> {
    prepare_artifact_dir(Path::new(artifact_dir), options.overwrite)?;
    config
        .save(format!("{artifact_dir}/{CONFIG_FILE}"))
        .map_err(|err| Error::Artifact {
            path: format!("{artifact_dir}/{CONFIG_FILE}"),
            message: err.to_string(),
        })?;

    B::seed(config.seed);

    let batcher_train = FlowBatcher::<B>::new(device.clone());
    let batcher_valid = FlowBatcher::<B::InnerBackend>::new(device.clone());

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(train);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(valid);

    info!(
        "Training for {} epochs, seq_len {}, {} tabular features",
        config.num_epochs,
        config.model.seq_len(),
        config.model.num_features
    );

    let mut builder = LearnerBuilder::new(artifact_dir)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .with_file_checkpointer(CompactRecorder::new())
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .summary();
    if options.quiet {
        builder = builder.renderer(ProgressLog::default()).log_to_file(false);
    }
    let learner = builder.build(
        config.model.init::<B>(&device),
        config.optimizer.init(),
        config.learning_rate,
    );

    let model_trained = learner.fit(dataloader_train, dataloader_valid);

    model_trained
        .clone()
        .save_file(format!("{artifact_dir}/{MODEL_FILE}"), &CompactRecorder::new())
        .map_err(|err| Error::Artifact {
            path: format!("{artifact_dir}/{MODEL_FILE}"),
            message: format!("{err:?}"),
        })?;

    Ok(model_trained)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previous_run_is_kept_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        let err = prepare_artifact_dir(dir.path(), false).unwrap_err();

        assert!(matches!(err, Error::Artifact { .. }));
        assert!(dir.path().join(CONFIG_FILE).exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn overwrite_removes_only_training_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{}").unwrap();
        std::fs::create_dir_all(dir.path().join("checkpoint")).unwrap();
        std::fs::write(dir.path().join("checkpoint/model-1.mpk"), "").unwrap();
        std::fs::write(dir.path().join("flows.csv"), "spkts\n1\n").unwrap();

        prepare_artifact_dir(dir.path(), true).unwrap();

        assert!(!dir.path().join(CONFIG_FILE).exists());
        assert!(!dir.path().join("checkpoint").exists());
        assert!(dir.path().join("flows.csv").exists());
    }

    #[test]
    fn missing_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = dir.path().join("nested/artifacts");

        prepare_artifact_dir(&artifacts, false).unwrap();

        assert!(artifacts.is_dir());
    }
}
