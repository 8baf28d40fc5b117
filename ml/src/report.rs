//! Turning per-flow predictions into what an analyst reads: counts, risk,
//! alerts, filtered views and the annotated CSV.

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::data::{FlowRecord, FlowTable};
use crate::error::{Error, Result};

/// Class map of the fusion model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ThreatLevel {
    Normal,
    Suspicious,
    Malicious,
}

impl ThreatLevel {
    pub const ALL: [ThreatLevel; 3] = [
        ThreatLevel::Normal,
        ThreatLevel::Suspicious,
        ThreatLevel::Malicious,
    ];

    pub fn from_class(index: usize) -> Result<Self> {
        Self::ALL.get(index).copied().ok_or(Error::UnknownClass(index))
    }

    pub fn class_index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            ThreatLevel::Normal => "Normal",
            ThreatLevel::Suspicious => "Suspicious",
            ThreatLevel::Malicious => "Malicious",
        }
    }

    pub fn threat_score(self) -> f32 {
        match self {
            ThreatLevel::Normal => 0.0,
            ThreatLevel::Suspicious => 0.5,
            ThreatLevel::Malicious => 1.0,
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ThreatLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown threat level `{s}`"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FlowPrediction {
    pub class_index: usize,
    pub level: ThreatLevel,
    /// Probability of the predicted class.
    pub confidence: f32,
}

impl FlowPrediction {
    /// Picks the most probable class. The first maximum wins on ties.
    pub fn from_probabilities(probabilities: &[f32]) -> Result<Self> {
        let (class_index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (index, p)| match best {
                Some((_, max)) if p <= max => best,
                _ => Some((index, p)),
            })
            .ok_or(Error::UnknownClass(0))?;

        Ok(Self {
            class_index,
            level: ThreatLevel::from_class(class_index)?,
            confidence,
        })
    }

    pub fn threat_score(&self) -> f32 {
        self.level.threat_score()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub normal: usize,
    pub suspicious: usize,
    pub malicious: usize,
    pub avg_confidence: f32,
}

impl Summary {
    pub fn from_predictions(predictions: &[FlowPrediction]) -> Self {
        let count = |level| predictions.iter().filter(|p| p.level == level).count();
        let avg_confidence = if predictions.is_empty() {
            0.0
        } else {
            predictions.iter().map(|p| p.confidence).sum::<f32>() / predictions.len() as f32
        };

        Self {
            total: predictions.len(),
            normal: count(ThreatLevel::Normal),
            suspicious: count(ThreatLevel::Suspicious),
            malicious: count(ThreatLevel::Malicious),
            avg_confidence,
        }
    }

    pub fn count(&self, level: ThreatLevel) -> usize {
        match level {
            ThreatLevel::Normal => self.normal,
            ThreatLevel::Suspicious => self.suspicious,
            ThreatLevel::Malicious => self.malicious,
        }
    }

    /// Malicious plus suspicious flows.
    pub fn threats(&self) -> usize {
        self.malicious + self.suspicious
    }

    /// Share of malicious flows, in percent.
    pub fn severity(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        self.malicious as f32 / self.total as f32 * 100.0
    }

    /// Risk of this batch: any malicious flow is high, any suspicious flow medium.
    pub fn risk(&self) -> RiskLevel {
        if self.malicious > 0 {
            RiskLevel::High
        } else if self.suspicious > 0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Risk by malicious share: above 5% high, above 1% medium.
    pub fn session_risk(&self) -> RiskLevel {
        let share = self.severity();
        if share > 5.0 {
            RiskLevel::High
        } else if share > 1.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn alert(&self) -> Alert {
        if self.malicious > 0 {
            Alert::Critical {
                malicious: self.malicious,
                suspicious: self.suspicious,
            }
        } else if self.suspicious > 0 {
            Alert::Warning {
                suspicious: self.suspicious,
            }
        } else {
            Alert::AllClear { total: self.total }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Alert {
    Critical { malicious: usize, suspicious: usize },
    Warning { suspicious: usize },
    AllClear { total: usize },
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::Critical {
                malicious,
                suspicious,
            } => write!(
                f,
                "CRITICAL: {malicious} malicious and {suspicious} suspicious flows detected"
            ),
            Alert::Warning { suspicious } => write!(
                f,
                "WARNING: {suspicious} suspicious flows detected, investigation recommended"
            ),
            Alert::AllClear { total } => {
                write!(f, "ALL CLEAR: no threats detected in {total} analyzed flows")
            }
        }
    }
}

/// Row selection over analyzed flows.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultFilter {
    pub levels: Vec<ThreatLevel>,
    pub min_confidence: f32,
    /// Case-insensitive substring matched against every column.
    pub search: Option<String>,
}

impl Default for ResultFilter {
    fn default() -> Self {
        Self {
            levels: ThreatLevel::ALL.to_vec(),
            min_confidence: 0.0,
            search: None,
        }
    }
}

impl ResultFilter {
    pub fn matches(&self, record: &FlowRecord, prediction: &FlowPrediction) -> bool {
        if !self.levels.contains(&prediction.level) || prediction.confidence < self.min_confidence
        {
            return false;
        }

        match self.search.as_deref().map(str::to_lowercase) {
            None => true,
            Some(needle) if needle.is_empty() => true,
            Some(needle) => {
                record
                    .iter()
                    .any(|(_, value)| value.to_lowercase().contains(&needle))
                    || prediction.level.label().to_lowercase().contains(&needle)
            }
        }
    }

    /// Indices of matching rows, in table order.
    pub fn select(&self, table: &FlowTable, predictions: &[FlowPrediction]) -> Result<Vec<usize>> {
        check_lengths(table, predictions)?;
        Ok(table
            .records()
            .iter()
            .zip(predictions)
            .enumerate()
            .filter(|(_, (record, prediction))| self.matches(record, prediction))
            .map(|(index, _)| index)
            .collect())
    }
}

/// Ordering of the top-threats listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThreatSort {
    #[default]
    ConfidenceDesc,
    ConfidenceAsc,
    ThreatScore,
}

impl ThreatSort {
    pub const ALL: [ThreatSort; 3] = [
        ThreatSort::ConfidenceDesc,
        ThreatSort::ConfidenceAsc,
        ThreatSort::ThreatScore,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ThreatSort::ConfidenceDesc => "confidence-desc",
            ThreatSort::ConfidenceAsc => "confidence-asc",
            ThreatSort::ThreatScore => "threat-score",
        }
    }
}

impl fmt::Display for ThreatSort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ThreatSort {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|sort| sort.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown threat ordering `{s}`"))
    }
}

/// The levels listed as threats unless asked otherwise.
pub const THREAT_LEVELS: [ThreatLevel; 2] = [ThreatLevel::Malicious, ThreatLevel::Suspicious];

/// Rows whose level is in `levels`, ordered by `sort`. Ties keep table order.
pub fn rank_threats(
    predictions: &[FlowPrediction],
    levels: &[ThreatLevel],
    sort: ThreatSort,
) -> Vec<usize> {
    let mut ranked: Vec<usize> = predictions
        .iter()
        .enumerate()
        .filter(|(_, p)| levels.contains(&p.level))
        .map(|(index, _)| index)
        .collect();
    ranked.sort_by(|&a, &b| {
        let (a, b) = (&predictions[a], &predictions[b]);
        match sort {
            ThreatSort::ConfidenceDesc => b.confidence.total_cmp(&a.confidence),
            ThreatSort::ConfidenceAsc => a.confidence.total_cmp(&b.confidence),
            ThreatSort::ThreatScore => b.threat_score().total_cmp(&a.threat_score()),
        }
    });
    ranked
}

fn check_lengths(table: &FlowTable, predictions: &[FlowPrediction]) -> Result<()> {
    if table.len() != predictions.len() {
        return Err(Error::Mismatch {
            records: table.len(),
            predictions: predictions.len(),
        });
    }
    Ok(())
}

pub const RESULT_COLUMNS: [&str; 4] = ["prediction", "prediction_label", "confidence", "threat_score"];

/// Writes the selected rows with their original columns followed by the
/// prediction columns.
pub fn export_csv<W: Write>(
    writer: W,
    table: &FlowTable,
    predictions: &[FlowPrediction],
    rows: &[usize],
) -> Result<()> {
    check_lengths(table, predictions)?;
    let mut writer = csv::Writer::from_writer(writer);

    let header = table
        .headers()
        .iter()
        .map(String::as_str)
        .chain(RESULT_COLUMNS);
    writer.write_record(header)?;

    for &row in rows {
        let (Some(record), Some(prediction)) = (table.records().get(row), predictions.get(row)) else {
            continue;
        };
        let mut fields: Vec<String> = table
            .headers()
            .iter()
            .map(|header| record.get(header).unwrap_or_default().to_string())
            .collect();
        fields.push(prediction.class_index.to_string());
        fields.push(prediction.level.label().to_string());
        fields.push(prediction.confidence.to_string());
        fields.push(prediction.threat_score().to_string());
        writer.write_record(&fields)?;
    }

    writer.flush()?;
    Ok(())
}
