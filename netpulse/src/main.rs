use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::optim::AdamConfig;
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use netpulse_ml::data::{FlowDataset, FlowTable};
use netpulse_ml::inference::{Classifier, SCALER_FILE};
use netpulse_ml::model::FusionModelConfig;
use netpulse_ml::preprocess::{fit_scaler, Preprocessor};
use netpulse_ml::report::{
    export_csv, rank_threats, Alert, ResultFilter, Summary, ThreatLevel, ThreatSort, THREAT_LEVELS,
};
use netpulse_ml::sequence::{self, DEFAULT_SEQ_LEN};
use netpulse_ml::training::{self, TrainingConfig, TrainingOptions};

#[derive(Debug, Parser)]
#[clap(version, about = "Network flow classification with a packet-sequence fusion model")]
struct Opt {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Classify every flow of a CSV file
    Analyze {
        #[clap(short, long)]
        input: PathBuf,
        #[clap(short, long, default_value = "./artifacts")]
        artifacts: PathBuf,
        /// Write the selected rows with prediction columns to this CSV file
        #[clap(short, long)]
        output: Option<PathBuf>,
        /// Threat levels to export, comma separated (default: all)
        #[clap(long, value_delimiter = ',')]
        export_levels: Vec<ThreatLevel>,
        #[clap(long, default_value_t = 0.0)]
        min_confidence: f32,
        /// Only export rows containing this text
        #[clap(long)]
        search: Option<String>,
        /// Threat levels to list, comma separated (default: malicious,suspicious)
        #[clap(long, value_delimiter = ',')]
        levels: Vec<ThreatLevel>,
        /// Threat ordering: confidence-desc, confidence-asc or threat-score
        #[clap(long, default_value_t = ThreatSort::ConfidenceDesc)]
        sort: ThreatSort,
        /// Number of top threats to list
        #[clap(long, default_value_t = 20)]
        top: usize,
    },
    /// Train a model and write its artifacts
    Train {
        #[clap(long)]
        train: PathBuf,
        #[clap(long)]
        valid: PathBuf,
        #[clap(short, long, default_value = "./artifacts")]
        artifacts: PathBuf,
        #[clap(long, default_value_t = DEFAULT_SEQ_LEN)]
        seq_len: usize,
        #[clap(long, default_value_t = 10)]
        epochs: usize,
        #[clap(long, default_value_t = 64)]
        batch_size: usize,
        #[clap(long, default_value_t = 4)]
        workers: usize,
        #[clap(long, default_value_t = 1.0e-3)]
        learning_rate: f64,
        /// Replace the artifacts of a previous training run
        #[clap(long)]
        overwrite: bool,
        /// Log progress instead of drawing the training dashboard
        #[clap(short, long)]
        quiet: bool,
    },
    /// Print the packet sequence reconstructed for one flow
    Sequence {
        #[clap(short, long)]
        input: PathBuf,
        #[clap(long, default_value_t = 0)]
        row: usize,
        #[clap(long, default_value_t = DEFAULT_SEQ_LEN)]
        seq_len: usize,
    },
}

/// What the top-threats listing shows.
struct ThreatListing {
    levels: Vec<ThreatLevel>,
    sort: ThreatSort,
    top: usize,
}

fn load_table(path: &Path) -> anyhow::Result<FlowTable> {
    let table = FlowTable::from_path(path)
        .with_context(|| format!("failed to read flows from {}", path.display()))?;
    info!(
        "Loaded {} flows with {} columns from {}",
        table.len(),
        table.headers().len(),
        path.display()
    );
    Ok(table)
}

fn analyze(
    input: &Path,
    artifacts: &Path,
    output: Option<&Path>,
    filter: ResultFilter,
    threats: ThreatListing,
) -> anyhow::Result<()> {
    type MyBackend = NdArray;

    let device = NdArrayDevice::default();
    let table = load_table(input)?;
    let classifier = Classifier::<MyBackend>::load(artifacts, device)
        .context("failed to load model artifacts")?;

    let predictions = classifier.classify(&table)?;
    let summary = Summary::from_predictions(&predictions);

    match summary.alert() {
        alert @ Alert::AllClear { .. } => info!("{alert}"),
        alert => warn!("{alert}"),
    }

    println!("Total flows:     {}", summary.total);
    for level in ThreatLevel::ALL {
        println!("{:<16} {}", format!("{level}:"), summary.count(level));
    }
    println!("Avg confidence:  {:.1}%", summary.avg_confidence * 100.0);
    println!("Severity:        {:.2}% malicious", summary.severity());
    println!("Risk level:      {}", summary.risk());
    println!("Session risk:    {}", summary.session_risk());

    let ranked = rank_threats(&predictions, &threats.levels, threats.sort);
    if !ranked.is_empty() && threats.top > 0 {
        println!();
        println!("Top {} threats ({}):", ranked.len().min(threats.top), threats.sort);
        for &row in ranked.iter().take(threats.top) {
            let prediction = &predictions[row];
            println!(
                "  row {:>6}  {:<10}  {:5.1}%",
                row,
                prediction.level,
                prediction.confidence * 100.0
            );
        }
    }

    if let Some(output) = output {
        let rows = filter.select(&table, &predictions)?;
        let file = File::create(output)
            .with_context(|| format!("failed to create {}", output.display()))?;
        export_csv(BufWriter::new(file), &table, &predictions, &rows)?;
        info!(
            "Exported {} of {} flows to {}",
            rows.len(),
            table.len(),
            output.display()
        );
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn train(
    train_path: &Path,
    valid_path: &Path,
    artifacts: &Path,
    seq_len: usize,
    epochs: usize,
    batch_size: usize,
    workers: usize,
    learning_rate: f64,
    options: TrainingOptions,
) -> anyhow::Result<()> {
    type MyBackend = NdArray;
    type MyAutodiffBackend = Autodiff<MyBackend>;

    let device = NdArrayDevice::default();
    let artifact_dir = artifacts
        .to_str()
        .context("artifact directory is not valid UTF-8")?;

    let train_table = load_table(train_path)?;
    let valid_table = load_table(valid_path)?;

    let scaler = fit_scaler(&train_table)?;
    debug!("Feature columns: {:?}", scaler.columns());
    let preprocessor = Preprocessor::new(scaler.clone(), seq_len)?;
    let train_items = preprocessor.prepare_labeled(&train_table)?;
    let valid_items = preprocessor.prepare_labeled(&valid_table)?;

    let config = TrainingConfig::new(
        FusionModelConfig::new(scaler.len(), ThreatLevel::ALL.len()).with_seq_len(Some(seq_len)),
        AdamConfig::new(),
    )
    .with_num_epochs(epochs)
    .with_batch_size(batch_size)
    .with_num_workers(workers)
    .with_learning_rate(learning_rate);

    training::train::<MyAutodiffBackend>(
        artifact_dir,
        config,
        device,
        FlowDataset::new(train_items),
        FlowDataset::new(valid_items),
        options,
    )?;

    scaler.save(artifacts.join(SCALER_FILE))?;
    info!("Artifacts written to {}", artifacts.display());

    Ok(())
}

fn show_sequence(input: &Path, row: usize, seq_len: usize) -> anyhow::Result<()> {
    let table = load_table(input)?;
    let record = table
        .records()
        .get(row)
        .with_context(|| format!("row {row} out of range, table has {} rows", table.len()))?;

    let sequence = sequence::encode(record, seq_len)?;

    println!("{:>5}  {:>12}  {:>12}  {:>4}", "step", "size", "gap", "dir");
    for (step, s) in sequence.steps().iter().enumerate() {
        println!(
            "{:>5}  {:>12.3}  {:>12.6}  {:>4}",
            step,
            s.size,
            s.gap,
            s.direction.sign()
        );
    }
    println!(
        "{} packets, {} padding steps",
        sequence.packet_count(),
        sequence.len() - sequence.packet_count()
    );

    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();

    env_logger::init();

    match opt.command {
        Command::Analyze {
            input,
            artifacts,
            output,
            export_levels,
            min_confidence,
            search,
            levels,
            sort,
            top,
        } => {
            let filter = ResultFilter {
                levels: if export_levels.is_empty() {
                    ThreatLevel::ALL.to_vec()
                } else {
                    export_levels
                },
                min_confidence,
                search,
            };
            let threats = ThreatListing {
                levels: if levels.is_empty() {
                    THREAT_LEVELS.to_vec()
                } else {
                    levels
                },
                sort,
                top,
            };
            analyze(&input, &artifacts, output.as_deref(), filter, threats)
        }
        Command::Train {
            train: train_path,
            valid,
            artifacts,
            seq_len,
            epochs,
            batch_size,
            workers,
            learning_rate,
            overwrite,
            quiet,
        } => train(
            &train_path,
            &valid,
            &artifacts,
            seq_len,
            epochs,
            batch_size,
            workers,
            learning_rate,
            TrainingOptions { overwrite, quiet },
        ),
        Command::Sequence {
            input,
            row,
            seq_len,
        } => show_sequence(&input, row, seq_len),
    }
}
