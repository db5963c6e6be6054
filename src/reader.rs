//! Reading log sources into records.

use std::{borrow::Cow, io::BufRead, ops::ControlFlow};

use crate::{
    header::{split_directive, Header},
    parse_line, CancellationToken, Completion, FieldMapping, LogRecord, ReadError,
};

/// A named log stream.
pub struct Source<R> {
    name: String,
    reader: R,
    total_lines: Option<usize>,
}

impl<R: BufRead> Source<R> {
    /// A source without a known line count.
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            reader,
            total_lines: None,
        }
    }

    /// Sets the line count reported with progress.
    pub fn with_total_lines(mut self, total_lines: usize) -> Self {
        self.total_lines = Some(total_lines);
        self
    }
}

/// Receives everything the reader produces.
///
/// Returning [`ControlFlow::Break`] from any method cancels the run.
pub trait ReadSink {
    /// A line has been parsed.
    fn record(&mut self, record: LogRecord) -> ControlFlow<()>;

    /// A line or a whole source had to be skipped.
    fn error(&mut self, error: ReadError) -> ControlFlow<()>;

    /// About to process data line `line` (1-based) of `source`.
    fn progress(&mut self, _line: usize, _total: Option<usize>, _source: &str) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// Reads all the sources in order, pushing records and errors to `sink`.
///
/// Malformed lines and sources without a `#Fields` directive are reported and
/// skipped. `cancel` is polled before every line.
pub fn read_sources<I, R, S>(sources: I, sink: &mut S, cancel: &CancellationToken) -> Completion
where
    I: IntoIterator<Item = Source<R>>,
    R: BufRead,
    S: ReadSink + ?Sized,
{
    for source in sources {
        if read_source(source, sink, cancel).is_break() {
            cancel.cancel();
            return Completion::Cancelled;
        }
    }
    Completion::Finished
}

/// Byte lines decoded lossily, without line terminators.
struct Lines<R> {
    reader: R,
    buffer: Vec<u8>,
    index: usize,
}

impl<R: BufRead> Lines<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            index: 0,
        }
    }

    /// The next line with its 1-based index.
    fn next_line(&mut self) -> Option<std::io::Result<(usize, Cow<'_, str>)>> {
        self.buffer.clear();
        match self.reader.read_until(b'\n', &mut self.buffer) {
            Ok(0) => None,
            Ok(_) => {
                self.index += 1;
                let first = self.index == 1;
                let line = match String::from_utf8_lossy(&self.buffer) {
                    Cow::Borrowed(line) => Cow::Borrowed(clean_line(line, first)),
                    Cow::Owned(line) => Cow::Owned(clean_line(&line, first).to_owned()),
                };
                Some(Ok((self.index, line)))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Drops the line terminator, and the byte order mark of the first line.
fn clean_line(line: &str, first: bool) -> &str {
    let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
    if first {
        line.strip_prefix('\u{FEFF}').unwrap_or(line)
    } else {
        line
    }
}

/// Data line handling of one source, once its mapping is known.
struct DataLines<'a, S: ?Sized> {
    name: &'a str,
    total_lines: Option<usize>,
    mapping: FieldMapping,
    sink: &'a mut S,
    records: usize,
    failures: usize,
}

impl<S: ReadSink + ?Sized> DataLines<'_, S> {
    fn line(&mut self, index: usize, line: &str) -> ControlFlow<()> {
        let name = self.name;
        if line.trim().is_empty() {
            return ControlFlow::Continue(());
        }
        if split_directive(line).is_some() {
            tracing::trace!("{name}:{index}: skipping a directive after data");
            return ControlFlow::Continue(());
        }

        self.sink.progress(index, self.total_lines, name)?;
        match parse_line(&self.mapping, line) {
            Ok(record) => {
                self.records += 1;
                self.sink.record(record)
            }
            Err(error) => {
                self.failures += 1;
                tracing::trace!("{name}:{index}: {error}");
                self.sink.error(ReadError::Line {
                    name: name.to_owned(),
                    line: index,
                    error,
                })
            }
        }
    }
}

fn read_source<R, S>(source: Source<R>, sink: &mut S, cancel: &CancellationToken) -> ControlFlow<()>
where
    R: BufRead,
    S: ReadSink + ?Sized,
{
    let Source {
        name,
        reader,
        total_lines,
    } = source;
    tracing::debug!("Reading {name}");

    let mut lines = Lines::new(reader);
    let mut header = Header::new();

    // Directives, up to the first data line.
    let first_data_line = loop {
        if cancel.is_cancelled() {
            tracing::debug!("{name}: cancelled in the header");
            return ControlFlow::Break(());
        }
        match lines.next_line() {
            None => break None,
            Some(Err(error)) => return sink.error(ReadError::Io { name, error }),
            Some(Ok((index, line))) => {
                if !header.feed(&line) {
                    break Some((index, line.into_owned()));
                }
            }
        }
    };
    let Some(mapping) = header.finish() else {
        return sink.error(ReadError::MissingFieldMapping { name });
    };
    let Some((index, line)) = first_data_line else {
        tracing::debug!("{name}: no data");
        return ControlFlow::Continue(());
    };

    let mut data = DataLines {
        name: &name,
        total_lines,
        mapping,
        sink,
        records: 0,
        failures: 0,
    };
    data.line(index, &line)?;
    loop {
        if cancel.is_cancelled() {
            tracing::debug!("{name}: cancelled at line {}", lines.index);
            return ControlFlow::Break(());
        }
        match lines.next_line() {
            None => break,
            Some(Err(error)) => {
                return data.sink.error(ReadError::Io {
                    name: name.clone(),
                    error,
                })
            }
            Some(Ok((index, line))) => data.line(index, &line)?,
        }
    }

    tracing::debug!(
        "{name}: {} records, {} skipped lines",
        data.records,
        data.failures
    );
    ControlFlow::Continue(())
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Cursor;

    use crate::LineError;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Record(String),
        Progress(usize, Option<usize>, String),
        MissingFields(String),
        BadLine(String, usize),
        Io(String),
    }

    /// Records every call; optionally stops after a number of records.
    #[derive(Default)]
    struct Collect {
        events: Vec<Event>,
        break_after: Option<usize>,
        cancel_after: Option<(usize, CancellationToken)>,
        records: usize,
    }

    impl ReadSink for Collect {
        fn record(&mut self, record: LogRecord) -> ControlFlow<()> {
            self.events.push(Event::Record(record.uri_stem));
            self.records += 1;
            if let Some((after, token)) = &self.cancel_after {
                if *after == self.records {
                    token.cancel();
                }
            }
            match self.break_after {
                Some(after) if after == self.records => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            }
        }

        fn error(&mut self, error: ReadError) -> ControlFlow<()> {
            self.events.push(match error {
                ReadError::MissingFieldMapping { name } => Event::MissingFields(name),
                ReadError::Line { name, line, .. } => Event::BadLine(name, line),
                ReadError::Io { name, .. } => Event::Io(name),
            });
            ControlFlow::Continue(())
        }

        fn progress(&mut self, line: usize, total: Option<usize>, source: &str) -> ControlFlow<()> {
            self.events.push(Event::Progress(line, total, source.to_owned()));
            ControlFlow::Continue(())
        }
    }

    impl Collect {
        fn records(&self) -> Vec<&str> {
            self.events
                .iter()
                .filter_map(|event| match event {
                    Event::Record(path) => Some(path.as_str()),
                    _ => None,
                })
                .collect()
        }
    }

    const LOG: &str = "#Software: Microsoft Internet Information Services 10.0\r
#Version: 1.0\r
#Fields: date time cs-uri-stem sc-status\r
2024-01-01 10:05:00 /a 200\r
2024-01-01 10:06:00 /b\r
2024-01-01 10:07:00 /c 404\r
";

    fn source(name: &str, content: &str) -> Source<Cursor<Vec<u8>>> {
        Source::new(name, Cursor::new(content.as_bytes().to_vec()))
    }

    #[test]
    fn short_line_is_skipped() {
        let mut sink = Collect::default();
        let completion = read_sources(
            [source("u_ex1.log", LOG).with_total_lines(6)],
            &mut sink,
            &CancellationToken::new(),
        );
        assert_eq!(completion, Completion::Finished);
        let name = || "u_ex1.log".to_owned();
        assert_eq!(
            sink.events,
            [
                Event::Progress(4, Some(6), name()),
                Event::Record("/a".to_owned()),
                Event::Progress(5, Some(6), name()),
                Event::BadLine(name(), 5),
                Event::Progress(6, Some(6), name()),
                Event::Record("/c".to_owned()),
            ]
        );
    }

    #[test]
    fn line_error_details() {
        struct Errors(Vec<ReadError>);
        impl ReadSink for Errors {
            fn record(&mut self, _record: LogRecord) -> ControlFlow<()> {
                ControlFlow::Continue(())
            }
            fn error(&mut self, error: ReadError) -> ControlFlow<()> {
                self.0.push(error);
                ControlFlow::Continue(())
            }
        }

        let mut sink = Errors(vec![]);
        read_sources([source("x", LOG)], &mut sink, &CancellationToken::new());
        assert_eq!(sink.0.len(), 1);
        assert!(matches!(
            &sink.0[0],
            ReadError::Line {
                line: 5,
                error: LineError::FieldCountMismatch {
                    expected: 4,
                    found: 3
                },
                ..
            }
        ));
        assert_eq!(sink.0[0].to_string(), "x:5: expected 4 fields, found 3");
    }

    #[test]
    fn missing_header_skips_the_source_only() {
        let mut sink = Collect::default();
        read_sources(
            [
                source("no-header.log", "2024-01-01 10:05:00 /x 200\n"),
                source("empty.log", ""),
                source("ok.log", LOG),
            ],
            &mut sink,
            &CancellationToken::new(),
        );
        assert_eq!(sink.records(), ["/a", "/c"]);
        assert_eq!(sink.events[0], Event::MissingFields("no-header.log".to_owned()));
        assert_eq!(sink.events[1], Event::MissingFields("empty.log".to_owned()));
    }

    #[test]
    fn later_directives_and_blank_lines() {
        let log = "#Fields: date time cs-uri-stem\n\
            2024-01-01 10:00:00 /a\n\
            \n\
            #Software: Microsoft Internet Information Services 10.0\n\
            #Fields: date time cs-uri-stem sc-status\n\
            2024-01-01 11:00:00 /b\n";
        let mut sink = Collect::default();
        read_sources([source("restart.log", log)], &mut sink, &CancellationToken::new());
        assert_eq!(sink.records(), ["/a", "/b"]);
        assert!(!sink
            .events
            .iter()
            .any(|event| matches!(event, Event::BadLine(..))));
    }

    #[test]
    fn byte_order_mark() {
        let mut content = vec![0xEF, 0xBB, 0xBF];
        content.extend_from_slice(LOG.as_bytes());
        let mut sink = Collect::default();
        read_sources(
            [Source::new("bom.log", Cursor::new(content))],
            &mut sink,
            &CancellationToken::new(),
        );
        assert_eq!(sink.records(), ["/a", "/c"]);
        assert!(!sink
            .events
            .iter()
            .any(|event| matches!(event, Event::MissingFields(..))));
    }

    #[test]
    fn whitespace_only_lines() {
        let log = "#Fields: date time cs-uri-stem\n   \n\t\r\n2024-01-01 10:00:00 /a\n";
        let mut sink = Collect::default();
        read_sources([source("blank.log", log)], &mut sink, &CancellationToken::new());
        assert_eq!(
            sink.events,
            [
                Event::Progress(4, None, "blank.log".to_owned()),
                Event::Record("/a".to_owned()),
            ]
        );
    }

    #[test]
    fn lossy_decoding() {
        let mut content = b"#Fields: date time cs-uri-stem\n2024-01-01 10:00:00 /caf".to_vec();
        content.extend_from_slice(&[0xE9, b'\n']);
        let mut sink = Collect::default();
        read_sources(
            [Source::new("latin1.log", Cursor::new(content))],
            &mut sink,
            &CancellationToken::new(),
        );
        assert_eq!(sink.records(), ["/caf\u{FFFD}"]);
    }

    #[test]
    fn cancellation_stops_everything() {
        let cancel = CancellationToken::new();
        let mut sink = Collect {
            cancel_after: Some((1, cancel.clone())),
            ..Default::default()
        };
        let completion = read_sources(
            [source("first.log", LOG), source("second.log", LOG)],
            &mut sink,
            &cancel,
        );
        assert_eq!(completion, Completion::Cancelled);
        assert_eq!(
            sink.events,
            [
                Event::Progress(4, None, "first.log".to_owned()),
                Event::Record("/a".to_owned()),
            ]
        );
    }

    #[test]
    fn sink_break_cancels() {
        let cancel = CancellationToken::new();
        let mut sink = Collect {
            break_after: Some(2),
            ..Default::default()
        };
        let completion = read_sources(
            [source("first.log", LOG), source("second.log", LOG)],
            &mut sink,
            &cancel,
        );
        assert_eq!(completion, Completion::Cancelled);
        assert!(cancel.is_cancelled());
        assert_eq!(sink.records(), ["/a", "/c"]);
        assert_eq!(sink.events.last(), Some(&Event::Record("/c".to_owned())));
    }

    #[test]
    fn read_failure_skips_the_rest_of_the_source() {
        struct Failing;
        impl std::io::Read for Failing {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"))
            }
        }

        let header = Cursor::new(b"#Fields: date time cs-uri-stem\n2024-01-01 10:00:00 /a\n".to_vec());
        let sources: Vec<Source<Box<dyn BufRead>>> = vec![
            Source::new(
                "broken.log",
                Box::new(std::io::BufReader::new(std::io::Read::chain(header, Failing)))
                    as Box<dyn BufRead>,
            ),
            Source::new(
                "ok.log",
                Box::new(Cursor::new(LOG.as_bytes().to_vec())) as Box<dyn BufRead>,
            ),
        ];
        let mut sink = Collect::default();
        let completion = read_sources(sources, &mut sink, &CancellationToken::new());
        assert_eq!(completion, Completion::Finished);
        assert_eq!(sink.records(), ["/a", "/a", "/c"]);
        assert!(sink.events.contains(&Event::Io("broken.log".to_owned())));
    }

    #[test]
    fn already_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut sink = Collect::default();
        let completion = read_sources([source("a.log", LOG)], &mut sink, &cancel);
        assert_eq!(completion, Completion::Cancelled);
        assert!(sink.events.is_empty());
    }
}
