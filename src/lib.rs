//! Traffic statistics over W3C extended (IIS) access logs.
//!
//! Log files are read into [`LogRecord`]s by [`read_sources`], then turned into
//! time-bucketed, semicolon-delimited rows by [`aggregate`].

mod aggregator;
mod cancel;
mod error;
mod fields;
mod header;
mod parse;
mod reader;

use std::net::IpAddr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};

pub use aggregator::{aggregate, Output, Resolution, Settings, StatsRow, StatsSink, HEADER};
pub use cancel::CancellationToken;
pub use error::{LineError, ReadError, StatsError};
pub use fields::{Field, FieldMapping};
pub use header::{parse_header, Header};
pub use parse::parse_line;
pub use reader::{read_sources, ReadSink, Source};

/// How a long-running operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// All the input has been processed.
    Finished,
    /// Cancellation was observed; output emitted so far stands.
    Cancelled,
}

/// One access log entry.
///
/// Columns missing from a file's `#Fields` directive, and columns holding `-`,
/// keep their empty/zero defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// `date`
    pub date: NaiveDate,
    /// `time`, UTC as written by the server.
    pub time: NaiveTime,
    /// `s-ip`
    pub source_ip: Option<IpAddr>,
    /// `cs-method`
    pub method: String,
    /// `cs-uri-stem`
    pub uri_stem: String,
    /// `cs-uri-query`
    pub uri_query: String,
    /// `s-port`
    pub port: u16,
    /// `cs-username`
    pub username: String,
    /// `c-ip`
    pub client_ip: Option<IpAddr>,
    /// `cs(User-Agent)`
    pub user_agent: String,
    /// `cs(Referrer)`
    pub referrer: String,
    /// `sc-status`, kept as text.
    pub http_status: String,
    /// `sc-substatus`
    pub protocol_substatus: String,
    /// `sc-win32-status`
    pub system_error_code: String,
    /// `sc-bytes`
    pub sent_bytes: u64,
    /// `cs-bytes`
    pub received_bytes: u64,
    /// `time-taken`, milliseconds.
    pub time_taken: u64,
    /// `s-sitename`
    pub site_name: String,
    /// `s-computername`
    pub computer_name: String,
}

/// `0001-01-01T00:00:00`, the zero of record timestamps and of bucket arithmetic.
pub(crate) fn epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .expect("0001-01-01T00:00:00 is a valid timestamp")
}

impl Default for LogRecord {
    fn default() -> Self {
        let epoch = epoch();
        Self {
            date: epoch.date(),
            time: epoch.time(),
            source_ip: None,
            method: String::new(),
            uri_stem: String::new(),
            uri_query: String::new(),
            port: 0,
            username: String::new(),
            client_ip: None,
            user_agent: String::new(),
            referrer: String::new(),
            http_status: String::new(),
            protocol_substatus: String::new(),
            system_error_code: String::new(),
            sent_bytes: 0,
            received_bytes: 0,
            time_taken: 0,
            site_name: String::new(),
            computer_name: String::new(),
        }
    }
}

impl LogRecord {
    /// `date` and `time` combined, truncated to whole seconds.
    pub fn date_time(&self) -> NaiveDateTime {
        let time = self.time.with_nanosecond(0).unwrap_or(self.time);
        NaiveDateTime::new(self.date, time)
    }

    /// The same wall-clock value as [`date_time`](Self::date_time), labelled UTC.
    ///
    /// Known quirk: this is a relabelling, not a timezone conversion. Ordering,
    /// bucketing and display all use this form.
    pub fn date_time_local(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.date_time())
    }

    /// Whether the status is a client or server error (`4xx`/`5xx`).
    pub fn is_failure(&self) -> bool {
        self.http_status.starts_with('4') || self.http_status.starts_with('5')
    }
}
