//! The catalog of recognized W3C extended log fields.

use std::{fmt::Display, str::FromStr};

use chrono::{NaiveDate, NaiveTime};

use crate::{LineError, LogRecord};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";

/// The W3C marker for an absent value.
pub(crate) const ABSENT: &str = "-";

/// A recognized log field, bound to one [`LogRecord`] attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Date,
    Time,
    SourceIp,
    Method,
    UriStem,
    UriQuery,
    Port,
    Username,
    ClientIp,
    UserAgent,
    Referrer,
    HttpStatus,
    ProtocolSubstatus,
    SystemErrorCode,
    SentBytes,
    ReceivedBytes,
    TimeTaken,
    SiteName,
    ComputerName,
}

impl Field {
    /// Every field, in the order IIS writes them.
    pub const ALL: [Field; 19] = [
        Field::Date,
        Field::Time,
        Field::SiteName,
        Field::ComputerName,
        Field::SourceIp,
        Field::Method,
        Field::UriStem,
        Field::UriQuery,
        Field::Port,
        Field::Username,
        Field::ClientIp,
        Field::UserAgent,
        Field::Referrer,
        Field::HttpStatus,
        Field::ProtocolSubstatus,
        Field::SystemErrorCode,
        Field::SentBytes,
        Field::ReceivedBytes,
        Field::TimeTaken,
    ];

    /// The token naming this field in a `#Fields` directive.
    pub fn token(self) -> &'static str {
        match self {
            Field::Date => "date",
            Field::Time => "time",
            Field::SourceIp => "s-ip",
            Field::Method => "cs-method",
            Field::UriStem => "cs-uri-stem",
            Field::UriQuery => "cs-uri-query",
            Field::Port => "s-port",
            Field::Username => "cs-username",
            Field::ClientIp => "c-ip",
            Field::UserAgent => "cs(User-Agent)",
            Field::Referrer => "cs(Referrer)",
            Field::HttpStatus => "sc-status",
            Field::ProtocolSubstatus => "sc-substatus",
            Field::SystemErrorCode => "sc-win32-status",
            Field::SentBytes => "sc-bytes",
            Field::ReceivedBytes => "cs-bytes",
            Field::TimeTaken => "time-taken",
            Field::SiteName => "s-sitename",
            Field::ComputerName => "s-computername",
        }
    }

    /// Looks a directive token up in the catalog.
    pub fn from_token(token: &str) -> Option<Self> {
        // IIS itself spells the header the HTTP way.
        if token == "cs(Referer)" {
            return Some(Field::Referrer);
        }
        Self::ALL.iter().copied().find(|field| field.token() == token)
    }

    /// Stores a raw column value into the matching record attribute.
    ///
    /// [`ABSENT`] leaves the attribute at its default.
    pub(crate) fn apply(self, record: &mut LogRecord, value: &str) -> Result<(), LineError> {
        if value == ABSENT {
            return Ok(());
        }
        match self {
            Field::Date => {
                record.date = NaiveDate::parse_from_str(value, DATE_FORMAT)
                    .map_err(|e| self.invalid(value, e))?
            }
            Field::Time => {
                record.time = NaiveTime::parse_from_str(value, TIME_FORMAT)
                    .map_err(|e| self.invalid(value, e))?
            }
            Field::SourceIp => record.source_ip = Some(self.parse(value)?),
            Field::ClientIp => record.client_ip = Some(self.parse(value)?),
            Field::Port => record.port = self.parse(value)?,
            Field::SentBytes => record.sent_bytes = self.parse(value)?,
            Field::ReceivedBytes => record.received_bytes = self.parse(value)?,
            Field::TimeTaken => record.time_taken = self.parse(value)?,
            Field::Method => record.method = value.to_owned(),
            Field::UriStem => record.uri_stem = value.to_owned(),
            Field::UriQuery => record.uri_query = value.to_owned(),
            Field::Username => record.username = value.to_owned(),
            Field::UserAgent => record.user_agent = value.to_owned(),
            Field::Referrer => record.referrer = value.to_owned(),
            Field::HttpStatus => record.http_status = value.to_owned(),
            Field::ProtocolSubstatus => record.protocol_substatus = value.to_owned(),
            Field::SystemErrorCode => record.system_error_code = value.to_owned(),
            Field::SiteName => record.site_name = value.to_owned(),
            Field::ComputerName => record.computer_name = value.to_owned(),
        }
        Ok(())
    }

    /// Formats the attribute back into its column form; empty text and
    /// missing addresses become [`ABSENT`], numbers and dates always render
    /// their value.
    pub fn render(self, record: &LogRecord) -> String {
        let text = |value: &str| {
            if value.is_empty() {
                ABSENT.to_owned()
            } else {
                value.to_owned()
            }
        };
        let address = |value: Option<std::net::IpAddr>| {
            value.map_or_else(|| ABSENT.to_owned(), |ip| ip.to_string())
        };
        match self {
            Field::Date => record.date.format(DATE_FORMAT).to_string(),
            Field::Time => record.time.format(TIME_FORMAT).to_string(),
            Field::SourceIp => address(record.source_ip),
            Field::ClientIp => address(record.client_ip),
            Field::Port => record.port.to_string(),
            Field::SentBytes => record.sent_bytes.to_string(),
            Field::ReceivedBytes => record.received_bytes.to_string(),
            Field::TimeTaken => record.time_taken.to_string(),
            Field::Method => text(&record.method),
            Field::UriStem => text(&record.uri_stem),
            Field::UriQuery => text(&record.uri_query),
            Field::Username => text(&record.username),
            Field::UserAgent => text(&record.user_agent),
            Field::Referrer => text(&record.referrer),
            Field::HttpStatus => text(&record.http_status),
            Field::ProtocolSubstatus => text(&record.protocol_substatus),
            Field::SystemErrorCode => text(&record.system_error_code),
            Field::SiteName => text(&record.site_name),
            Field::ComputerName => text(&record.computer_name),
        }
    }

    /// Like `.parse()`, but with the field attached to the error.
    fn parse<T>(self, value: &str) -> Result<T, LineError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        value.parse().map_err(|e| self.invalid(value, e))
    }

    fn invalid(self, value: &str, reason: impl Display) -> LineError {
        LineError::FieldValueInvalid {
            field: self.token(),
            value: value.to_owned(),
            reason: reason.to_string(),
        }
    }
}

/// One column of a `#Fields` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Column {
    token: String,
    /// `None` for tokens outside the catalog; such columns are skipped.
    field: Option<Field>,
}

/// The column layout of one log source, resolved once from its `#Fields`
/// directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    columns: Vec<Column>,
}

impl FieldMapping {
    /// Resolves directive tokens against the catalog.
    pub fn from_tokens<'a, I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let columns = tokens
            .into_iter()
            .map(|token| Column {
                token: token.to_owned(),
                field: Field::from_token(token),
            })
            .collect();
        Self { columns }
    }

    /// A mapping covering the whole catalog.
    pub fn full() -> Self {
        Self::from_tokens(Field::ALL.iter().map(|field| field.token()))
    }

    /// Number of columns a data line must have.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// The catalog field of every column, in column order.
    pub fn fields(&self) -> impl Iterator<Item = Option<Field>> + '_ {
        self.columns.iter().map(|column| column.field)
    }

    /// The directive tokens, in column order.
    pub fn tokens(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns.iter().map(|column| column.token.as_str())
    }
}
