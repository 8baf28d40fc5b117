//! Flow to packet-sequence reconstruction.
//!
//! Flow datasets only keep per-connection aggregates (packet and byte counts
//! per direction, duration). The sequence half of the fusion model expects a
//! packet-timing sequence, so one is synthesised: every packet of a direction
//! gets the average size of that direction, packets are spread evenly over the
//! flow duration, and both directions are merged in time order.

use std::iter::Peekable;

use rayon::prelude::*;
use serde::Serialize;

use crate::data::FlowRecord;
use crate::error::{EncodeError, FieldIssue};

/// Sequence length used when the artifact configuration does not set one.
pub const DEFAULT_SEQ_LEN: usize = 50;

/// Duration substituted for absent or zero durations.
pub const MIN_DURATION: f64 = 0.001;

/// Numeric flow fields read by the encoder, each with its legacy alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowField {
    SrcPkts,
    DstPkts,
    SrcBytes,
    DstBytes,
    Duration,
}

impl FlowField {
    /// Column names in lookup order; the first one present in a record wins.
    pub fn names(self) -> &'static [&'static str] {
        match self {
            FlowField::SrcPkts => &["spkts", "src_pkts"],
            FlowField::DstPkts => &["dpkts", "dst_pkts"],
            FlowField::SrcBytes => &["sbytes", "src_bytes"],
            FlowField::DstBytes => &["dbytes", "dst_bytes"],
            FlowField::Duration => &["dur", "duration"],
        }
    }

    pub fn name(self) -> &'static str {
        self.names()[0]
    }

    pub fn default_value(self) -> f64 {
        match self {
            FlowField::Duration => MIN_DURATION,
            _ => 0.0,
        }
    }
}

/// Turns the raw text of one field into a number.
///
/// Absent or blank values take the field default. Anything else must parse
/// as a finite, non-negative number; a zero duration becomes [`MIN_DURATION`].
pub fn coerce_field(field: FlowField, raw: Option<&str>) -> Result<f64, EncodeError> {
    let raw = match raw.map(str::trim) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Ok(field.default_value()),
    };

    let value: f64 = raw.parse().map_err(|_| EncodeError::InvalidRecord {
        field: field.name(),
        issue: FieldIssue::Malformed(raw.to_string()),
    })?;

    check_value(field, value)
}

fn check_value(field: FlowField, value: f64) -> Result<f64, EncodeError> {
    if !value.is_finite() {
        return Err(EncodeError::InvalidRecord {
            field: field.name(),
            issue: FieldIssue::NonFinite,
        });
    }
    if value < 0.0 {
        return Err(EncodeError::InvalidRecord {
            field: field.name(),
            issue: FieldIssue::Negative(value),
        });
    }
    if field == FlowField::Duration && value == 0.0 {
        return Ok(MIN_DURATION);
    }
    Ok(value)
}

/// Validated flow aggregates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowCounters {
    src_pkts: u64,
    dst_pkts: u64,
    src_bytes: f64,
    dst_bytes: f64,
    duration: f64,
}

impl FlowCounters {
    pub fn new(
        src_pkts: u64,
        dst_pkts: u64,
        src_bytes: f64,
        dst_bytes: f64,
        duration: f64,
    ) -> Result<Self, EncodeError> {
        Ok(Self {
            src_pkts,
            dst_pkts,
            src_bytes: check_value(FlowField::SrcBytes, src_bytes)?,
            dst_bytes: check_value(FlowField::DstBytes, dst_bytes)?,
            duration: check_value(FlowField::Duration, duration)?,
        })
    }

    /// Reads the five fields of a record. Fractional packet counts are
    /// truncated toward zero.
    pub fn from_record(record: &FlowRecord) -> Result<Self, EncodeError> {
        let read = |field: FlowField| coerce_field(field, record.first_present(field.names()));

        Ok(Self {
            src_pkts: read(FlowField::SrcPkts)?.trunc() as u64,
            dst_pkts: read(FlowField::DstPkts)?.trunc() as u64,
            src_bytes: read(FlowField::SrcBytes)?,
            dst_bytes: read(FlowField::DstBytes)?,
            duration: read(FlowField::Duration)?,
        })
    }

    pub fn src_pkts(&self) -> u64 {
        self.src_pkts
    }

    pub fn dst_pkts(&self) -> u64 {
        self.dst_pkts
    }

    pub fn src_bytes(&self) -> f64 {
        self.src_bytes
    }

    pub fn dst_bytes(&self) -> f64 {
        self.dst_bytes
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    /// Source to destination.
    Forward,
    /// Destination to source.
    Backward,
    Padding,
}

impl Direction {
    pub fn sign(self) -> i8 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
            Direction::Padding => 0,
        }
    }
}

/// One synthetic packet. Not a captured packet: sizes are directional averages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketObservation {
    pub timestamp: f64,
    pub size: f64,
    pub direction: Direction,
}

/// Evenly spaced packets of one direction over `[0, duration]`, both ends
/// included. A single packet sits at `t = 0`.
#[derive(Debug, Clone)]
struct DirectionalStream {
    count: u64,
    emitted: u64,
    size: f64,
    step: f64,
    duration: f64,
    direction: Direction,
}

impl DirectionalStream {
    fn new(count: u64, bytes: f64, duration: f64, direction: Direction) -> Self {
        let size = if count > 0 { bytes / count as f64 } else { 0.0 };
        let step = if count > 1 {
            duration / (count - 1) as f64
        } else {
            0.0
        };

        Self {
            count,
            emitted: 0,
            size,
            step,
            duration,
            direction,
        }
    }
}

impl Iterator for DirectionalStream {
    type Item = PacketObservation;

    fn next(&mut self) -> Option<Self::Item> {
        if self.emitted >= self.count {
            return None;
        }
        let index = self.emitted;
        self.emitted += 1;

        // last point is pinned to the duration to avoid rounding drift
        let timestamp = if self.count > 1 && index == self.count - 1 {
            self.duration
        } else {
            index as f64 * self.step
        };

        Some(PacketObservation {
            timestamp,
            size: self.size,
            direction: self.direction,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.count - self.emitted).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

/// Time-ordered merge of both directions. On equal timestamps source packets
/// come first, which matches a stable sort of sources followed by destinations.
#[derive(Debug, Clone)]
pub struct Observations {
    source: Peekable<DirectionalStream>,
    destination: Peekable<DirectionalStream>,
}

impl Iterator for Observations {
    type Item = PacketObservation;

    fn next(&mut self) -> Option<Self::Item> {
        let destination_first = match (self.source.peek(), self.destination.peek()) {
            (Some(src), Some(dst)) => dst.timestamp < src.timestamp,
            (Some(_), None) => false,
            (None, _) => true,
        };

        if destination_first {
            self.destination.next()
        } else {
            self.source.next()
        }
    }
}

/// The full, untruncated observation stream of a flow.
pub fn observations(counters: &FlowCounters) -> Observations {
    Observations {
        source: DirectionalStream::new(
            counters.src_pkts,
            counters.src_bytes,
            counters.duration,
            Direction::Forward,
        )
        .peekable(),
        destination: DirectionalStream::new(
            counters.dst_pkts,
            counters.dst_bytes,
            counters.duration,
            Direction::Backward,
        )
        .peekable(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SequenceStep {
    pub size: f64,
    /// Seconds since the previous step.
    pub gap: f64,
    pub direction: Direction,
}

impl SequenceStep {
    pub const PADDING: SequenceStep = SequenceStep {
        size: 0.0,
        gap: 0.0,
        direction: Direction::Padding,
    };

    /// `[size, gap, direction]`, the layout the model reads.
    pub fn as_row(&self) -> [f32; 3] {
        [self.size as f32, self.gap as f32, self.direction.sign() as f32]
    }
}

/// Fixed-length encoder output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sequence {
    steps: Vec<SequenceStep>,
}

impl Sequence {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[SequenceStep] {
        &self.steps
    }

    /// Number of non-padding steps.
    pub fn packet_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| step.direction != Direction::Padding)
            .count()
    }

    pub fn to_rows(&self) -> Vec<[f32; 3]> {
        self.steps.iter().map(SequenceStep::as_row).collect()
    }
}

pub fn encode_counters(counters: &FlowCounters, seq_len: usize) -> Result<Sequence, EncodeError> {
    if seq_len == 0 {
        return Err(EncodeError::InvalidConfiguration { seq_len });
    }

    let mut steps = Vec::with_capacity(seq_len);
    let mut previous = 0.0;
    for observation in observations(counters).take(seq_len) {
        steps.push(SequenceStep {
            size: observation.size,
            gap: observation.timestamp - previous,
            direction: observation.direction,
        });
        previous = observation.timestamp;
    }
    steps.resize(seq_len, SequenceStep::PADDING);

    Ok(Sequence { steps })
}

/// Encodes one flow record into exactly `seq_len` steps.
pub fn encode(record: &FlowRecord, seq_len: usize) -> Result<Sequence, EncodeError> {
    if seq_len == 0 {
        return Err(EncodeError::InvalidConfiguration { seq_len });
    }
    let counters = FlowCounters::from_record(record)?;
    encode_counters(&counters, seq_len)
}

/// Encodes records in parallel. Results keep the input order; what to do with
/// failed records is left to the caller.
pub fn encode_batch(
    records: &[FlowRecord],
    seq_len: usize,
) -> Vec<Result<Sequence, EncodeError>> {
    records
        .par_iter()
        .map(|record| encode(record, seq_len))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[(&str, &str)]) -> FlowRecord {
        fields.iter().copied().collect()
    }

    fn rows(sequence: &Sequence) -> Vec<[f32; 3]> {
        sequence.to_rows()
    }

    #[test]
    fn two_source_packets_are_padded() {
        let flow = record(&[
            ("spkts", "2"),
            ("dpkts", "0"),
            ("sbytes", "100"),
            ("dbytes", "0"),
            ("dur", "10"),
        ]);

        let sequence = encode(&flow, 5).unwrap();

        assert_eq!(
            rows(&sequence),
            vec![
                [50.0, 0.0, 1.0],
                [50.0, 10.0, 1.0],
                [0.0, 0.0, 0.0],
                [0.0, 0.0, 0.0],
                [0.0, 0.0, 0.0],
            ]
        );
        assert_eq!(sequence.packet_count(), 2);
    }

    #[test]
    fn empty_flow_is_all_padding() {
        let sequence = encode(&FlowRecord::default(), 5).unwrap();

        assert_eq!(sequence.len(), 5);
        assert!(sequence.steps().iter().all(|step| *step == SequenceStep::PADDING));

        let counters = FlowCounters::from_record(&FlowRecord::default()).unwrap();
        assert_eq!(counters.duration(), MIN_DURATION);
    }

    #[test]
    fn truncation_keeps_chronological_prefix() {
        let flow = record(&[
            ("spkts", "3"),
            ("dpkts", "2"),
            ("sbytes", "300"),
            ("dbytes", "100"),
            ("dur", "4"),
        ]);

        let full = encode(&flow, 5).unwrap();
        assert_eq!(
            rows(&full),
            vec![
                [100.0, 0.0, 1.0],
                [50.0, 0.0, -1.0],
                [100.0, 2.0, 1.0],
                [100.0, 2.0, 1.0],
                [50.0, 0.0, -1.0],
            ]
        );

        let truncated = encode(&flow, 3).unwrap();
        assert_eq!(truncated.len(), 3);
        assert_eq!(truncated.steps(), &full.steps()[..3]);
    }

    #[test]
    fn length_is_always_seq_len() {
        let flow = record(&[("spkts", "40"), ("dpkts", "25"), ("sbytes", "4000"), ("dur", "1.5")]);

        for seq_len in [1, 2, 10, 64, 65, 66, 200] {
            assert_eq!(encode(&flow, seq_len).unwrap().len(), seq_len);
        }
    }

    #[test]
    fn padding_fills_the_tail() {
        let flow = record(&[("spkts", "3"), ("dpkts", "4"), ("sbytes", "30"), ("dbytes", "8")]);

        let sequence = encode(&flow, 12).unwrap();

        assert_eq!(sequence.packet_count(), 7);
        assert!(sequence.steps()[7..]
            .iter()
            .all(|step| *step == SequenceStep::PADDING));
    }

    #[test]
    fn direction_counts_match_packet_counts() {
        let counters = FlowCounters::new(17, 9, 1700.0, 90.0, 3.0).unwrap();

        let all: Vec<_> = observations(&counters).collect();
        let forward = all.iter().filter(|o| o.direction == Direction::Forward).count();
        let backward = all.iter().filter(|o| o.direction == Direction::Backward).count();

        assert_eq!(forward, 17);
        assert_eq!(backward, 9);
    }

    #[test]
    fn observations_are_time_ordered_and_gaps_non_negative() {
        let counters = FlowCounters::new(7, 13, 700.0, 1300.0, 0.37).unwrap();

        let all: Vec<_> = observations(&counters).collect();
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let sequence = encode_counters(&counters, 30).unwrap();
        assert!(sequence.steps().iter().all(|step| step.gap >= 0.0));
    }

    #[test]
    fn ties_put_source_before_destination() {
        let counters = FlowCounters::new(2, 2, 20.0, 40.0, 1.0).unwrap();

        let directions: Vec<_> = observations(&counters).map(|o| o.direction).collect();

        assert_eq!(
            directions,
            vec![
                Direction::Forward,
                Direction::Backward,
                Direction::Forward,
                Direction::Backward
            ]
        );
    }

    #[test]
    fn interleaved_gaps() {
        // sources at 0, 2, 4 and destinations at 0, 1, 2, 3, 4
        let counters = FlowCounters::new(3, 5, 30.0, 5.0, 4.0).unwrap();

        let sequence = encode_counters(&counters, 8).unwrap();

        let gaps: Vec<f64> = sequence.steps().iter().map(|step| step.gap).collect();
        let signs: Vec<i8> = sequence.steps().iter().map(|step| step.direction.sign()).collect();
        assert_eq!(gaps, vec![0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 0.0]);
        assert_eq!(signs, vec![1, -1, -1, 1, -1, -1, 1, -1]);
    }

    #[test]
    fn last_timestamp_is_duration() {
        let counters = FlowCounters::new(7, 0, 7.0, 0.0, 0.3).unwrap();

        let last = observations(&counters).last().unwrap();

        assert_eq!(last.timestamp, 0.3);
    }

    #[test]
    fn bytes_without_packets_are_dropped() {
        let flow = record(&[("spkts", "0"), ("sbytes", "5000"), ("dpkts", "1"), ("dbytes", "60")]);

        let sequence = encode(&flow, 4).unwrap();

        assert_eq!(sequence.packet_count(), 1);
        assert_eq!(sequence.steps()[0].size, 60.0);
        assert_eq!(sequence.steps()[0].direction, Direction::Backward);
    }

    #[test]
    fn huge_packet_counts_stay_bounded() {
        let counters = FlowCounters::new(u64::MAX, u64::MAX, 1.0e12, 1.0e12, 60.0).unwrap();

        let sequence = encode_counters(&counters, 8).unwrap();

        assert_eq!(sequence.len(), 8);
        assert_eq!(sequence.packet_count(), 8);
    }

    #[test]
    fn aliases_are_used_when_primary_names_are_absent() {
        let legacy = record(&[
            ("src_pkts", "2"),
            ("src_bytes", "100"),
            ("duration", "10"),
        ]);

        let sequence = encode(&legacy, 2).unwrap();

        assert_eq!(rows(&sequence), vec![[50.0, 0.0, 1.0], [50.0, 10.0, 1.0]]);
    }

    #[test]
    fn primary_name_wins_over_alias() {
        let both = record(&[("spkts", "1"), ("src_pkts", "9"), ("sbytes", "10")]);

        let counters = FlowCounters::from_record(&both).unwrap();

        assert_eq!(counters.src_pkts(), 1);
    }

    #[test]
    fn fractional_counts_are_truncated() {
        let flow = record(&[("spkts", "2.9"), ("dpkts", "0.4")]);

        let counters = FlowCounters::from_record(&flow).unwrap();

        assert_eq!((counters.src_pkts(), counters.dst_pkts()), (2, 0));
    }

    #[test]
    fn blank_and_zero_durations_use_epsilon() {
        assert_eq!(coerce_field(FlowField::Duration, None), Ok(MIN_DURATION));
        assert_eq!(coerce_field(FlowField::Duration, Some("  ")), Ok(MIN_DURATION));
        assert_eq!(coerce_field(FlowField::Duration, Some("0")), Ok(MIN_DURATION));
        assert_eq!(coerce_field(FlowField::Duration, Some("0.25")), Ok(0.25));
        assert_eq!(coerce_field(FlowField::SrcBytes, Some("")), Ok(0.0));
    }

    #[test]
    fn zero_seq_len_is_a_configuration_error() {
        let err = encode(&FlowRecord::default(), 0).unwrap_err();

        assert_eq!(err, EncodeError::InvalidConfiguration { seq_len: 0 });
    }

    #[test]
    fn negative_values_are_rejected() {
        let err = encode(&record(&[("dbytes", "-3")]), 5).unwrap_err();

        assert_eq!(
            err,
            EncodeError::InvalidRecord {
                field: "dbytes",
                issue: FieldIssue::Negative(-3.0),
            }
        );
    }

    #[test]
    fn non_finite_values_are_rejected() {
        for raw in ["NaN", "inf", "-inf"] {
            let err = encode(&record(&[("dur", raw)]), 5).unwrap_err();
            assert_eq!(
                err,
                EncodeError::InvalidRecord {
                    field: "dur",
                    issue: FieldIssue::NonFinite,
                }
            );
        }
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = encode(&record(&[("spkts", "many")]), 5).unwrap_err();

        assert!(matches!(
            err,
            EncodeError::InvalidRecord {
                field: "spkts",
                issue: FieldIssue::Malformed(_),
            }
        ));
    }

    #[test]
    fn batch_keeps_input_order() {
        let records = vec![
            record(&[("spkts", "1"), ("sbytes", "10")]),
            record(&[("spkts", "oops")]),
            record(&[("dpkts", "1"), ("dbytes", "30")]),
        ];

        let results = encode_batch(&records, 2);

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().steps()[0].size, 10.0);
        assert!(results[1].is_err());
        assert_eq!(
            results[2].as_ref().unwrap().steps()[0].direction,
            Direction::Backward
        );
    }
}
