//! Time-bucketed traffic statistics.

use std::{collections::HashMap, fmt, ops::ControlFlow, str::FromStr};

use chrono::{DateTime, Duration, TimeZone, Utc};
use itertools::Itertools;

use crate::{epoch, CancellationToken, Completion, LogRecord, StatsError};

/// The header row.
pub const HEADER: &str =
    "DateTime;Method;Requests;NOKRequests;ServerReceivedBytes;ServerSentBytes;AverageTimeTaken;";

/// Label of the row summarizing a whole bucket.
const ALL: &str = "All";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Second,
    Minute,
    QuarterHour,
    Hour,
    Day,
    Week,
}

impl Resolution {
    fn millis(self) -> i64 {
        const SECOND: i64 = 1_000;
        match self {
            Resolution::Second => SECOND,
            Resolution::Minute => 60 * SECOND,
            Resolution::QuarterHour => 15 * 60 * SECOND,
            Resolution::Hour => 60 * 60 * SECOND,
            Resolution::Day => 24 * 60 * 60 * SECOND,
            Resolution::Week => 7 * 24 * 60 * 60 * SECOND,
        }
    }

    pub fn width(self) -> Duration {
        Duration::milliseconds(self.millis())
    }

    /// Start of the bucket holding `instant`.
    ///
    /// Buckets are aligned to `0001-01-01T00:00:00`, so weeks start on Monday.
    pub fn bucket(self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let epoch = epoch();
        let offset = (instant.naive_utc() - epoch).num_milliseconds();
        let start = offset.div_euclid(self.millis()) * self.millis();
        Utc.from_utc_datetime(&(epoch + Duration::milliseconds(start)))
    }
}

impl FromStr for Resolution {
    type Err = StatsError;

    /// Case-insensitive; `quarter-hour`, `quarter_hour` and `QuarterHour` are
    /// all accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        Ok(match normalized.as_str() {
            "second" => Resolution::Second,
            "minute" => Resolution::Minute,
            "quarterhour" => Resolution::QuarterHour,
            "hour" => Resolution::Hour,
            "day" => Resolution::Day,
            "week" => Resolution::Week,
            _ => return Err(StatsError::UnknownResolution(s.to_owned())),
        })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resolution::Second => "second",
            Resolution::Minute => "minute",
            Resolution::QuarterHour => "quarter-hour",
            Resolution::Hour => "hour",
            Resolution::Day => "day",
            Resolution::Week => "week",
        })
    }
}

/// Aggregation switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct Settings {
    /// Also emit one row per request path within each bucket.
    pub group_by_path: bool,
    /// Don't emit [`HEADER`].
    pub suppress_header: bool,
}

/// Aggregates of one group of records within a bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsRow<'a> {
    pub timestamp: DateTime<Utc>,
    /// `All`, or the request path.
    pub label: &'a str,
    pub requests: u64,
    /// Requests answered with a `4xx` or `5xx` status.
    pub failed_requests: u64,
    pub received_bytes: u64,
    pub sent_bytes: u64,
    /// Mean `time-taken`, milliseconds.
    pub average_time_taken: f64,
}

impl<'a> StatsRow<'a> {
    /// Summarizes a non-empty group.
    fn summarize<'r, I>(timestamp: DateTime<Utc>, label: &'a str, records: I) -> Self
    where
        I: IntoIterator<Item = &'r LogRecord>,
    {
        let mut row = StatsRow {
            timestamp,
            label,
            requests: 0,
            failed_requests: 0,
            received_bytes: 0,
            sent_bytes: 0,
            average_time_taken: 0.,
        };
        let mut time_taken = 0u64;
        for record in records {
            row.requests += 1;
            row.failed_requests += u64::from(record.is_failure());
            row.received_bytes += record.received_bytes;
            row.sent_bytes += record.sent_bytes;
            time_taken += record.time_taken;
        }
        row.average_time_taken = time_taken as f64 / row.requests as f64;
        row
    }
}

impl fmt::Display for StatsRow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{};{};{};{};{};{}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.label,
            self.requests,
            self.failed_requests,
            self.received_bytes,
            self.sent_bytes,
            self.average_time_taken
        )
    }
}

/// One line of output.
#[derive(Debug, Clone, PartialEq)]
pub enum Output<'a> {
    Header,
    Row(StatsRow<'a>),
}

impl fmt::Display for Output<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Header => f.write_str(HEADER),
            Output::Row(row) => fmt::Display::fmt(row, f),
        }
    }
}

/// A trait for statistics consumption.
///
/// Returning [`ControlFlow::Break`] stops the aggregation.
pub trait StatsSink {
    /// An output line is available.
    fn output(&mut self, output: Output<'_>) -> ControlFlow<()>;

    /// A diagnostic message.
    fn verbose(&mut self, _message: &str) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// Sorts `records` chronologically and emits one `All` row per bucket, followed
/// by per-path rows when [`Settings::group_by_path`] is set.
///
/// `cancel` is polled before the header, before every bucket and before every
/// path group.
pub fn aggregate<S>(
    mut records: Vec<LogRecord>,
    resolution: Resolution,
    settings: Settings,
    sink: &mut S,
    cancel: &CancellationToken,
) -> Result<Completion, StatsError>
where
    S: StatsSink + ?Sized,
{
    if records.is_empty() {
        return Err(StatsError::EmptyInput);
    }
    tracing::debug!(
        "Aggregating {} records by {resolution}, {settings:?}",
        records.len()
    );

    match emit(&mut records, resolution, settings, sink, cancel) {
        ControlFlow::Continue(()) => Ok(Completion::Finished),
        ControlFlow::Break(()) => {
            cancel.cancel();
            Ok(Completion::Cancelled)
        }
    }
}

fn emit<S>(
    records: &mut [LogRecord],
    resolution: Resolution,
    settings: Settings,
    sink: &mut S,
    cancel: &CancellationToken,
) -> ControlFlow<()>
where
    S: StatsSink + ?Sized,
{
    let stop_requested = || {
        if cancel.is_cancelled() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    };

    sink.verbose(&format!("Log entries count: {}", records.len()))?;
    sink.verbose("Sorting log entries.")?;
    // Stable: equal instants keep their input order.
    records.sort_by_key(LogRecord::date_time_local);

    if let (Some(first), Some(last)) = (records.first(), records.last()) {
        sink.verbose(&format!(
            "Creating a csv from {} to last {} over {} entries",
            first.date_time_local().format(TIMESTAMP_FORMAT),
            last.date_time_local().format(TIMESTAMP_FORMAT),
            records.len()
        ))?;
    }

    stop_requested()?;
    if !settings.suppress_header {
        sink.output(Output::Header)?;
    }

    sink.verbose("Grouping log entries.")?;
    // Sorted input => every bucket is one contiguous run.
    let buckets = records
        .iter()
        .group_by(|record| resolution.bucket(record.date_time_local()));
    for (timestamp, bucket) in &buckets {
        stop_requested()?;
        let bucket = bucket.collect::<Vec<_>>();
        sink.output(Output::Row(StatsRow::summarize(
            timestamp,
            ALL,
            bucket.iter().copied(),
        )))?;

        if settings.group_by_path {
            for (path, group) in group_by_path(&bucket) {
                stop_requested()?;
                sink.output(Output::Row(StatsRow::summarize(timestamp, path, group)))?;
            }
        }
    }
    ControlFlow::Continue(())
}

/// Splits a bucket by request path, in order of first appearance.
fn group_by_path<'r>(records: &[&'r LogRecord]) -> Vec<(&'r str, Vec<&'r LogRecord>)> {
    let mut positions = HashMap::<&str, usize>::new();
    let mut groups = Vec::<(&str, Vec<&LogRecord>)>::new();
    for &record in records {
        let path = record.uri_stem.as_str();
        let position = *positions.entry(path).or_insert_with(|| {
            groups.push((path, vec![]));
            groups.len() - 1
        });
        groups[position].1.push(record);
    }
    groups
}
