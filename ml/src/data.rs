use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::ReaderBuilder;
use serde::Deserialize;

use crate::error::Result;

/// One row of a flow CSV, keyed by column name. Values are kept as text and
/// only interpreted by the consumer that needs them.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct FlowRecord {
    fields: HashMap<String, String>,
}

impl FlowRecord {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Value of the first of `names` present in the record.
    pub fn first_present(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|name| self.get(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FlowRecord {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        FlowRecord {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// A parsed flow CSV. Header order is kept for export.
#[derive(Debug, Clone, Default)]
pub struct FlowTable {
    headers: Vec<String>,
    records: Vec<FlowRecord>,
}

impl FlowTable {
    pub fn new(headers: Vec<String>, records: Vec<FlowRecord>) -> Self {
        Self { headers, records }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = reader.headers()?.iter().map(String::from).collect();
        let records = reader
            .deserialize::<FlowRecord>()
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self { headers, records })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.headers.iter().any(|header| header == column)
    }

    pub fn records(&self) -> &[FlowRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A preprocessed flow, ready for batching.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowItem {
    pub tabular: Vec<f32>,
    /// `[size, gap, direction]` per step.
    pub sequence: Vec<[f32; 3]>,
    pub target: usize,
}

use burn::data::dataset::{Dataset, InMemDataset};

use burn::{data::dataloader::batcher::Batcher, prelude::*, tensor::Shape};

#[derive(Clone)]
pub struct FlowBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> FlowBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

#[derive(Clone, Debug)]
pub struct FlowBatch<B: Backend> {
    /// `[batch_size, num_features]`
    pub tabular: Tensor<B, 2>,
    /// `[batch_size, seq_len, 3]`
    pub sequences: Tensor<B, 3>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<FlowItem, FlowBatch<B>> for FlowBatcher<B> {
    fn batch(&self, items: Vec<FlowItem>) -> FlowBatch<B> {
        let tabular = items
            .iter()
            .map(|item| Data::new(item.tabular.clone(), Shape::new([1, item.tabular.len()])))
            .map(|data| Tensor::<B, 2>::from_data(data.convert(), &self.device))
            .collect();

        let sequences = items
            .iter()
            .map(|item| {
                let steps = item.sequence.len();
                let values: Vec<f32> = item.sequence.iter().flatten().copied().collect();
                Data::new(values, Shape::new([1, steps, 3]))
            })
            .map(|data| Tensor::<B, 3>::from_data(data.convert(), &self.device))
            .collect();

        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    Data::from([(item.target as i64).elem()]),
                    &self.device,
                )
            })
            .collect();

        let tabular = Tensor::cat(tabular, 0).to_device(&self.device);
        let sequences = Tensor::cat(sequences, 0).to_device(&self.device);
        let targets = Tensor::cat(targets, 0).to_device(&self.device);

        FlowBatch {
            tabular,
            sequences,
            targets,
        }
    }
}

pub struct FlowDataset {
    dataset: InMemDataset<FlowItem>,
}

impl FlowDataset {
    pub fn new(items: Vec<FlowItem>) -> Self {
        FlowDataset {
            dataset: InMemDataset::new(items),
        }
    }
}

impl Dataset<FlowItem> for FlowDataset {
    fn get(&self, index: usize) -> Option<FlowItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    const FLOWS: &str = "\
id,dur,proto,spkts,dpkts,sbytes,dbytes
1,0.5,tcp,2,1,200,60
2,,udp,1,0,80,0
";

    #[test]
    fn reads_headers_and_rows() {
        let table = FlowTable::from_reader(FLOWS.as_bytes()).unwrap();

        assert_eq!(
            table.headers(),
            ["id", "dur", "proto", "spkts", "dpkts", "sbytes", "dbytes"]
        );
        assert_eq!(table.len(), 2);
        assert_eq!(table.records()[0].get("proto"), Some("tcp"));
        assert_eq!(table.records()[1].get("dur"), Some(""));
        assert!(table.has_column("sbytes"));
        assert!(!table.has_column("class3"));
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.csv");
        std::fs::write(&path, FLOWS).unwrap();

        let table = FlowTable::from_path(&path).unwrap();

        assert_eq!(table.len(), 2);
    }

    #[test]
    fn ragged_rows_are_an_error() {
        let ragged = "spkts,dpkts\n1,2\n3\n";

        assert!(FlowTable::from_reader(ragged.as_bytes()).is_err());
    }

    #[test]
    fn first_present_follows_name_order() {
        let record: FlowRecord = [("src_pkts", "4"), ("spkts", "2")].into_iter().collect();

        assert_eq!(record.first_present(&["spkts", "src_pkts"]), Some("2"));
        assert_eq!(record.first_present(&["dpkts", "dst_pkts"]), None);
    }

    #[test]
    fn batch_shapes() {
        type B = NdArray;
        let device = Default::default();
        let item = |target| FlowItem {
            tabular: vec![0.5, -1.0, 2.0, 0.0],
            sequence: vec![[50.0, 0.0, 1.0], [50.0, 10.0, 1.0], [0.0, 0.0, 0.0]],
            target,
        };

        let batch = FlowBatcher::<B>::new(device).batch(vec![item(0), item(2)]);

        assert_eq!(batch.tabular.dims(), [2, 4]);
        assert_eq!(batch.sequences.dims(), [2, 3, 3]);
        assert_eq!(batch.targets.dims(), [2]);

        let sequences = batch.sequences.into_data().convert::<f32>().value;
        assert_eq!(&sequences[..6], &[50.0, 0.0, 1.0, 50.0, 10.0, 1.0]);

        let targets = batch.targets.into_data().convert::<i64>().value;
        assert_eq!(targets, vec![0, 2]);
    }

    #[test]
    fn dataset_indexes_items() {
        let dataset = FlowDataset::new(vec![FlowItem {
            tabular: vec![1.0],
            sequence: vec![[0.0; 3]],
            target: 1,
        }]);

        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.get(0).map(|item| item.target), Some(1));
        assert!(dataset.get(1).is_none());
    }
}
