use std::path::Path;

use crate::{
    data::{FlowBatcher, FlowItem, FlowTable},
    error::{Error, Result},
    model::FusionModel,
    preprocess::Preprocessor,
    report::FlowPrediction,
    scaler::ScalerParams,
    training::{TrainingConfig, CONFIG_FILE, MODEL_FILE},
};
use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    record::{CompactRecorder, Recorder},
    tensor::activation::softmax,
};
use log::{debug, info};

pub const SCALER_FILE: &str = "scaler.json";

/// A trained fusion model with its preprocessing, loaded once from an
/// artifact directory.
pub struct Classifier<B: Backend> {
    model: FusionModel<B>,
    config: TrainingConfig,
    preprocessor: Preprocessor,
    device: B::Device,
}

fn artifact_error(path: &Path, message: String) -> Error {
    Error::Artifact {
        path: path.display().to_string(),
        message,
    }
}

impl<B: Backend> Classifier<B> {
    pub fn load<P: AsRef<Path>>(artifact_dir: P, device: B::Device) -> Result<Self> {
        let artifact_dir = artifact_dir.as_ref();

        let config_path = artifact_dir.join(CONFIG_FILE);
        let config = TrainingConfig::load(&config_path)
            .map_err(|err| artifact_error(&config_path, format!("{err:?}")))?;

        let model_path = artifact_dir.join(MODEL_FILE);
        let record = CompactRecorder::new()
            .load(model_path.clone(), &device)
            .map_err(|err| artifact_error(&model_path, format!("{err:?}")))?;
        let model: FusionModel<B> = config.model.init(&device).load_record(record);

        let scaler_path = artifact_dir.join(SCALER_FILE);
        let scaler = ScalerParams::load(&scaler_path)?;
        if scaler.len() != config.model.num_features {
            return Err(artifact_error(
                &scaler_path,
                format!(
                    "{} scaler columns but the model expects {} features",
                    scaler.len(),
                    config.model.num_features
                ),
            ));
        }
        let preprocessor = Preprocessor::new(scaler, config.model.seq_len())?;

        info!(
            "Loaded model from {} ({} features, seq_len {})",
            artifact_dir.display(),
            config.model.num_features,
            config.model.seq_len()
        );

        Ok(Self {
            model,
            config,
            preprocessor,
            device,
        })
    }

    pub fn seq_len(&self) -> usize {
        self.preprocessor.seq_len()
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    /// Class probabilities, one row per item.
    pub fn probabilities(&self, items: Vec<FlowItem>) -> Vec<Vec<f32>> {
        let batcher = FlowBatcher::<B>::new(self.device.clone());
        let num_classes = self.config.model.num_classes;
        let batch_size = self.config.batch_size.max(1);
        let mut probabilities = Vec::with_capacity(items.len());

        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            let chunk: Vec<FlowItem> = items.by_ref().take(batch_size).collect();
            debug!("Classifying batch of {} flows", chunk.len());

            let batch = batcher.batch(chunk);
            let output = self.model.forward(batch.tabular, batch.sequences);
            let values = softmax(output, 1).into_data().convert::<f32>().value;

            probabilities.extend(values.chunks(num_classes).map(<[f32]>::to_vec));
        }

        probabilities
    }

    pub fn predict(&self, items: Vec<FlowItem>) -> Result<Vec<FlowPrediction>> {
        self.probabilities(items)
            .iter()
            .map(|row| FlowPrediction::from_probabilities(row))
            .collect()
    }

    /// Preprocesses and classifies every row of a table.
    pub fn classify(&self, table: &FlowTable) -> Result<Vec<FlowPrediction>> {
        let items = self.preprocessor.prepare(table)?;
        self.predict(items)
    }
}
