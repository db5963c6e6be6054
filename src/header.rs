//! Directive (header) parsing.

use crate::{FieldMapping, ReadError};

const DIRECTIVE_MARKER: char = '#';
const FIELDS_DIRECTIVE: &str = "Fields";

/// A `#Name: value` directive line, split into its parts.
///
/// Returns `None` for data lines.
pub(crate) fn split_directive(line: &str) -> Option<(&str, &str)> {
    let directive = line.strip_prefix(DIRECTIVE_MARKER)?;
    Some(match memchr::memchr(b':', directive.as_bytes()) {
        Some(colon) => (directive[..colon].trim(), &directive[colon + 1..]),
        None => (directive.trim(), ""),
    })
}

/// Incremental header scanner for one source.
///
/// Lines are fed until one turns out not to be a directive; that line is the
/// first data line and is left to the caller.
#[derive(Debug, Default)]
pub struct Header {
    mapping: Option<FieldMapping>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a line if it is a directive. Returns `false` once data begins.
    pub fn feed(&mut self, line: &str) -> bool {
        let Some((name, value)) = split_directive(line) else {
            return false;
        };
        tracing::debug!(%name, value = %value.trim(), "Directive");
        if name == FIELDS_DIRECTIVE && self.mapping.is_none() {
            let mapping = FieldMapping::from_tokens(value.split_ascii_whitespace());
            if !mapping.is_empty() {
                self.mapping = Some(mapping);
            }
        }
        true
    }

    /// The mapping of the first non-empty `#Fields` directive, if any.
    pub fn finish(self) -> Option<FieldMapping> {
        self.mapping
    }
}

/// Scans the leading directives of `lines`.
///
/// Returns the field mapping and the index of the first data line (equal to the
/// number of lines when the source holds no data).
pub fn parse_header<'a, I>(name: &str, lines: I) -> Result<(FieldMapping, usize), ReadError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut header = Header::new();
    let mut first_data_line = 0;
    for line in lines {
        if !header.feed(line) {
            break;
        }
        first_data_line += 1;
    }
    header
        .finish()
        .map(|mapping| (mapping, first_data_line))
        .ok_or_else(|| ReadError::MissingFieldMapping {
            name: name.to_owned(),
        })
}
