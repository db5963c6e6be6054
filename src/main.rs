use std::{
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Write},
    ops::ControlFlow,
    path::{Path, PathBuf},
};

use color_eyre::{eyre::Context, Result};
use itertools::Itertools;
use structopt::StructOpt;
use w3c_log_stats::{
    aggregate, read_sources, CancellationToken, Completion, FieldMapping, LogRecord, Output,
    ReadError, ReadSink, Resolution, Settings, Source, StatsSink,
};

fn main() -> Result<()> {
    use tracing::metadata::LevelFilter;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(EnvFilter::DEFAULT_ENV)
        .from_env()
        .wrap_err("Unable to initialize tracing env filter")?;

    // Stdout is reserved for the output rows.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();

    run()
}

#[derive(StructOpt)]
struct Args {
    /// Don't count the lines of the input files up front.
    #[structopt(long)]
    no_progress: bool,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Aggregates access logs into time-bucketed traffic statistics.
    Stats {
        /// second, minute, quarter-hour, hour, day or week.
        #[structopt(long, short)]
        resolution: Resolution,

        /// Add one row per request path to every bucket.
        #[structopt(long)]
        group_by_path: bool,

        /// Don't print the header row.
        #[structopt(long)]
        no_header: bool,

        #[structopt(parse(from_os_str), required = true)]
        files: Vec<PathBuf>,
    },
    /// Prints the parsed records back as a normalized W3C log.
    Records {
        #[structopt(parse(from_os_str), required = true)]
        files: Vec<PathBuf>,
    },
}

fn run() -> Result<()> {
    let Args {
        no_progress,
        command,
    } = Args::from_args();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            tracing::info!("Stop requested");
            cancel.cancel();
        })
        .wrap_err("Unable to install the Ctrl-C handler")?;
    }

    let stdout = io::stdout();
    let out = BufWriter::new(stdout.lock());

    match command {
        Command::Stats {
            resolution,
            group_by_path,
            no_header,
            files,
        } => {
            let settings = Settings {
                group_by_path,
                suppress_header: no_header,
            };
            stats(&files, no_progress, resolution, settings, out, &cancel)
        }
        Command::Records { files } => records(&files, no_progress, out, &cancel),
    }
}

fn stats(
    files: &[PathBuf],
    no_progress: bool,
    resolution: Resolution,
    settings: Settings,
    out: impl Write,
    cancel: &CancellationToken,
) -> Result<()> {
    tracing::info!("Reading log files ...");
    let mut collector = Collector {
        records: vec![],
        report: Report::default(),
    };
    let completion = read_sources(open_sources(files, no_progress)?, &mut collector, cancel);
    collector.report.summary(collector.records.len());
    if completion == Completion::Cancelled {
        tracing::warn!("Cancelled while reading");
        return Ok(());
    }

    let mut rows = Rows { out, error: None };
    let completion = aggregate(collector.records, resolution, settings, &mut rows, cancel)
        .wrap_err("Unable to aggregate log entries")?;
    rows.finish(completion)
}

fn records(
    files: &[PathBuf],
    no_progress: bool,
    out: impl Write,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut writer = RecordWriter {
        rows: Rows { out, error: None },
        mapping: FieldMapping::full(),
        written: 0,
        report: Report::default(),
    };
    let header = format!("#Fields: {}", writer.mapping.tokens().join(" "));
    if writer.rows.line(&header).is_continue() {
        let completion = read_sources(open_sources(files, no_progress)?, &mut writer, cancel);
        writer.report.summary(writer.written);
        return writer.rows.finish(completion);
    }
    writer.rows.finish(Completion::Cancelled)
}

fn open_sources(files: &[PathBuf], no_progress: bool) -> Result<Vec<Source<BufReader<File>>>> {
    files
        .iter()
        .map(|path| {
            let file = File::open(path)
                .wrap_err_with(|| format!("Unable to open {}", path.display()))?;
            let source = Source::new(path.display().to_string(), BufReader::new(file));
            if no_progress {
                return Ok(source);
            }
            let total_lines = count_lines(path)
                .wrap_err_with(|| format!("Unable to count lines of {}", path.display()))?;
            Ok(source.with_total_lines(total_lines))
        })
        .collect()
}

fn count_lines(path: &Path) -> io::Result<usize> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut lines = 0;
    let mut last = None;
    loop {
        let chunk = reader.fill_buf()?;
        if chunk.is_empty() {
            break;
        }
        lines += memchr::memchr_iter(b'\n', chunk).count();
        last = chunk.last().copied();
        let length = chunk.len();
        reader.consume(length);
    }
    // An unterminated last line.
    if last.map_or(false, |byte| byte != b'\n') {
        lines += 1;
    }
    Ok(lines)
}

/// Progress and error reporting shared by the reading sinks.
#[derive(Default)]
struct Report {
    failures: usize,
    /// Source and tenth of the last reported progress.
    last_step: Option<(String, usize)>,
}

impl Report {
    /// Progress is reported every this many lines when there is no total.
    const UNCOUNTED_STEP: usize = 100_000;

    fn error(&mut self, error: ReadError) {
        self.failures += 1;
        tracing::warn!("{error}");
    }

    fn progress(&mut self, line: usize, total: Option<usize>, source: &str) {
        match total {
            Some(total) if total > 0 => {
                let percent = line * 100 / total;
                let step = percent / 10;
                let reported = matches!(
                    &self.last_step,
                    Some((last_source, last_step)) if last_source == source && *last_step == step
                );
                if !reported {
                    self.last_step = Some((source.to_owned(), step));
                    tracing::info!("Read file {source}: line {line} of {total} ({percent}%)");
                }
            }
            _ => {
                if line % Self::UNCOUNTED_STEP == 0 {
                    tracing::info!("Read file {source}: line {line} (no line count, --no-progress)");
                }
            }
        }
    }

    fn summary(&self, records: usize) {
        tracing::info!("Read {records} log entries, skipped {} lines", self.failures);
    }
}

/// Keeps all the records in memory for aggregation.
struct Collector {
    records: Vec<LogRecord>,
    report: Report,
}

impl ReadSink for Collector {
    fn record(&mut self, record: LogRecord) -> ControlFlow<()> {
        self.records.push(record);
        ControlFlow::Continue(())
    }

    fn error(&mut self, error: ReadError) -> ControlFlow<()> {
        self.report.error(error);
        ControlFlow::Continue(())
    }

    fn progress(&mut self, line: usize, total: Option<usize>, source: &str) -> ControlFlow<()> {
        self.report.progress(line, total, source);
        ControlFlow::Continue(())
    }
}

/// Line-oriented output; a failed write (e.g. a closed pipe) stops the run.
struct Rows<W> {
    out: W,
    error: Option<io::Error>,
}

impl<W: Write> Rows<W> {
    fn line(&mut self, line: &dyn std::fmt::Display) -> ControlFlow<()> {
        match writeln!(self.out, "{line}") {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => {
                self.error = Some(e);
                ControlFlow::Break(())
            }
        }
    }

    fn finish(mut self, completion: Completion) -> Result<()> {
        let error = match self.error.take() {
            Some(error) => Some(error),
            None => self.out.flush().err(),
        };
        match error {
            Some(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                tracing::debug!("Output closed");
                Ok(())
            }
            Some(e) => Err(e).wrap_err("Unable to write the output"),
            None => {
                if completion == Completion::Cancelled {
                    tracing::warn!("Cancelled, the output is incomplete");
                }
                Ok(())
            }
        }
    }
}

impl<W: Write> StatsSink for Rows<W> {
    fn output(&mut self, output: Output<'_>) -> ControlFlow<()> {
        self.line(&output)
    }

    fn verbose(&mut self, message: &str) -> ControlFlow<()> {
        tracing::info!("{message}");
        ControlFlow::Continue(())
    }
}

/// Streams records straight to the output.
struct RecordWriter<W> {
    rows: Rows<W>,
    mapping: FieldMapping,
    written: usize,
    report: Report,
}

impl<W: Write> ReadSink for RecordWriter<W> {
    fn record(&mut self, record: LogRecord) -> ControlFlow<()> {
        self.written += 1;
        let line = self
            .mapping
            .fields()
            .flatten()
            .map(|field| field.render(&record))
            .join(" ");
        self.rows.line(&line)
    }

    fn error(&mut self, error: ReadError) -> ControlFlow<()> {
        self.report.error(error);
        ControlFlow::Continue(())
    }

    fn progress(&mut self, line: usize, total: Option<usize>, source: &str) -> ControlFlow<()> {
        self.report.progress(line, total, source);
        ControlFlow::Continue(())
    }
}
