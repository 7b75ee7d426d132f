//! The ingest loop: serial lines in, durable CSV rows out.

use std::fmt;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sensorlog_model::{LineVerdict, Schema};

use crate::config::{LoggerConfig, UploadPolicy};
use crate::remote::{upload_or_update, RemoteStoragePointer};
use crate::{CsvLog, Error, Result};

/// Shared flag asking the ingest loop to stop after the current step.
///
/// Cloned into a Ctrl-C handler; the loop checks it between reads.
#[derive(Clone, Default, Debug)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestOptions {
    pub schema: Schema,
    pub error_marker: String,
    pub max_duration: Option<Duration>,
    pub max_file_bytes: Option<u64>,
    pub upload_policy: UploadPolicy,
    pub remote_name: String,
}

impl From<&LoggerConfig> for IngestOptions {
    fn from(config: &LoggerConfig) -> Self {
        Self {
            schema: config.schema(),
            error_marker: config.csv.error_marker.clone(),
            max_duration: config.max_duration(),
            max_file_bytes: config.csv.max_file_bytes,
            upload_policy: config.upload.policy,
            remote_name: config.upload.remote_name.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The stop signal was triggered, usually by Ctrl-C.
    Interrupted,
    DurationElapsed,
    FileSizeLimit,
    /// The serial stream reported end of file.
    EndOfStream,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interrupted => "stopped by user",
            Self::DurationElapsed => "maximum duration reached",
            Self::FileSizeLimit => "maximum file size reached",
            Self::EndOfStream => "serial stream ended",
        })
    }
}

/// What happened to the lines read during one run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LineCounts {
    pub rows_written: u64,
    pub sensor_errors: u64,
    pub arity_mismatches: u64,
    pub undecodable: u64,
}

impl LineCounts {
    pub fn discarded(&self) -> u64 {
        self.sensor_errors + self.arity_mismatches + self.undecodable
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadCounts {
    pub attempts: u64,
    pub failures: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IngestReport {
    pub stop_reason: StopReason,
    pub lines: LineCounts,
    pub uploads: UploadCounts,
}

/// Reads lines from a serial link and appends the valid ones to a [`CsvLog`],
/// optionally mirroring the log to remote storage.
pub struct IngestLoop {
    options: IngestOptions,
    log: CsvLog,
    remote: Option<RemoteStoragePointer>,
    stop: StopSignal,
    lines: LineCounts,
    uploads: UploadCounts,
}

impl IngestLoop {
    /// `remote` is required unless the upload policy is [`UploadPolicy::Never`].
    pub fn new(
        options: IngestOptions,
        log: CsvLog,
        remote: Option<RemoteStoragePointer>,
        stop: StopSignal,
    ) -> Result<Self> {
        if log.schema() != options.schema {
            return Err(Error::Config(format!(
                "log {} uses {:?} columns, options ask for {:?}",
                log.path().display(),
                log.schema(),
                options.schema
            )));
        }
        if options.upload_policy != UploadPolicy::Never && remote.is_none() {
            return Err(Error::Config(
                "an upload policy is set but no remote storage was given".into(),
            ));
        }

        Ok(Self {
            options,
            log,
            remote,
            stop,
            lines: LineCounts::default(),
            uploads: UploadCounts::default(),
        })
    }

    /// Runs until a stop condition fires or reading fails.
    ///
    /// The link is owned by the loop and dropped (closing the port) before the
    /// final upload, on every exit path. A serial error still gets the final
    /// upload before it is returned.
    pub fn run<L: BufRead>(mut self, link: L) -> Result<IngestReport> {
        let outcome = self.pump(link);

        if self.options.upload_policy.uploads_on_stop() {
            self.upload();
        }

        let stop_reason = outcome?;
        log::info!(
            "Data collection {stop_reason}: {} rows logged, {} lines skipped",
            self.lines.rows_written,
            self.lines.discarded()
        );

        Ok(IngestReport {
            stop_reason,
            lines: self.lines,
            uploads: self.uploads,
        })
    }

    fn pump<L: BufRead>(&mut self, mut link: L) -> Result<StopReason> {
        let started = Instant::now();
        let mut pending = Vec::new();

        loop {
            if let Some(reason) = self.stop_condition(started)? {
                return Ok(reason);
            }

            match link.read_until(b'\n', &mut pending) {
                Ok(0) if pending.is_empty() => return Ok(StopReason::EndOfStream),
                Ok(_) => {}
                Err(e) if is_timeout(&e) => continue,
                Err(e) => return Err(Error::Serial(e)),
            }

            let raw = std::mem::take(&mut pending);
            self.handle_line(&raw)?;
        }
    }

    fn stop_condition(&self, started: Instant) -> Result<Option<StopReason>> {
        if self.stop.is_triggered() {
            return Ok(Some(StopReason::Interrupted));
        }
        if let Some(max) = self.options.max_duration {
            if started.elapsed() >= max {
                return Ok(Some(StopReason::DurationElapsed));
            }
        }
        if let Some(max) = self.options.max_file_bytes {
            if self.log.len_bytes()? >= max {
                return Ok(Some(StopReason::FileSizeLimit));
            }
        }
        Ok(None)
    }

    fn handle_line(&mut self, raw: &[u8]) -> Result<()> {
        let Ok(text) = std::str::from_utf8(raw) else {
            self.lines.undecodable += 1;
            log::info!("Skipping line that is not valid UTF-8: {raw:?}");
            return Ok(());
        };

        let line = text.trim();
        log::debug!("Raw data received: {line:?}");

        match self.options.schema.classify(line, &self.options.error_marker) {
            LineVerdict::SensorError => {
                self.lines.sensor_errors += 1;
                log::info!("Sensor error, skipping entry: {line:?}");
            }
            LineVerdict::ArityMismatch { expected, found } => {
                self.lines.arity_mismatches += 1;
                log::info!("Skipping {line:?}: expected {expected} values, got {found}");
            }
            LineVerdict::Reading(reading) => {
                self.log.append(&reading)?;
                self.lines.rows_written += 1;
                log::info!("Logged data: {:?}", reading.fields());

                if self.options.upload_policy.uploads_each_row() {
                    self.upload();
                }
            }
        }
        Ok(())
    }

    /// Pushes the whole log. Failures are logged and otherwise ignored; the
    /// local rows are already on disk.
    fn upload(&mut self) {
        let Some(remote) = self.remote.as_mut() else {
            return;
        };

        self.uploads.attempts += 1;
        match upload_or_update(remote.as_mut(), &self.options.remote_name, self.log.path()) {
            Ok(outcome) => log::info!("{outcome}"),
            Err(e) => {
                self.uploads.failures += 1;
                log::warn!("An error occurred during file upload: {e}");
            }
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
