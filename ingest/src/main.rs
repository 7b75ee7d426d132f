use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use sensorlog_common::config::{Backend, UploadPolicy};
use sensorlog_common::remote::{self, RemoteStoragePointer};
use sensorlog_common::{
    serial, CsvLog, IngestLoop, IngestOptions, LoggerConfig, SerialLink, StopSignal,
};

/// Reads sensor lines from a serial port into a CSV log and optionally
/// mirrors the log to remote storage.
///
/// Flags override the values of the configuration file.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// JSON configuration file. Defaults to `config.json` in the platform config directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial device, e.g. `COM5` or `/dev/ttyACM0`.
    #[arg(long)]
    port: Option<String>,

    #[arg(long)]
    baud_rate: Option<u32>,

    /// CSV log to append to.
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Whether lines start with a timestamp (5 columns) or not (4 columns).
    #[arg(long)]
    timestamp_column: Option<bool>,

    /// Lines containing this text are skipped. An empty marker disables the check.
    #[arg(long)]
    error_marker: Option<String>,

    /// Stop after this long, e.g. `20s` or `2h`.
    #[arg(long, value_parser = humantime::parse_duration)]
    max_duration: Option<Duration>,

    /// Stop once the log reaches this many bytes.
    #[arg(long)]
    max_file_bytes: Option<u64>,

    /// never, on-stop or every-row.
    #[arg(long)]
    upload: Option<UploadPolicy>,

    /// local-dir or drive.
    #[arg(long)]
    backend: Option<Backend>,

    /// Name of the remote copy.
    #[arg(long)]
    remote_name: Option<String>,

    /// Print the serial ports found on this machine and exit.
    #[arg(long)]
    list_ports: bool,
}

impl Cli {
    /// Loop options for `config`. `--max-duration` keeps its full precision
    /// instead of going through the whole seconds of the config file.
    fn ingest_options(&self, config: &LoggerConfig) -> IngestOptions {
        let mut options = IngestOptions::from(config);
        if self.max_duration.is_some() {
            options.max_duration = self.max_duration;
        }
        options
    }

    fn apply(&self, config: &mut LoggerConfig) {
        if let Some(port) = self.port.clone() {
            config.serial.port = port;
        }
        if let Some(baud_rate) = self.baud_rate {
            config.serial.baud_rate = baud_rate;
        }
        if let Some(csv) = self.csv.clone() {
            config.csv.path = csv;
        }
        if let Some(timestamp_column) = self.timestamp_column {
            config.csv.timestamp_column = timestamp_column;
        }
        if let Some(error_marker) = self.error_marker.clone() {
            config.csv.error_marker = error_marker;
        }
        if let Some(max_file_bytes) = self.max_file_bytes {
            config.csv.max_file_bytes = Some(max_file_bytes);
        }
        if let Some(policy) = self.upload {
            config.upload.policy = policy;
        }
        if let Some(backend) = self.backend {
            config.upload.backend = backend;
        }
        if let Some(remote_name) = self.remote_name.clone() {
            config.upload.remote_name = remote_name;
        }
    }
}

/// The remote storage the log is mirrored to, or `None` when nothing is uploaded.
fn build_remote(config: &LoggerConfig) -> anyhow::Result<Option<RemoteStoragePointer>> {
    if config.upload.policy == UploadPolicy::Never {
        return Ok(None);
    }
    let remote = remote::open_backend(config)
        .with_context(|| format!("cannot open the {:?} backend", config.upload.backend))?;
    Ok(Some(remote))
}

fn list_ports() -> anyhow::Result<()> {
    let ports = serial::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}\t{}", port.name, port.description);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if cli.list_ports {
        return list_ports();
    }

    let mut config = LoggerConfig::load_or_default(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    // A browser login may happen in here. Ctrl-C still ends the process
    // until the handler below replaces the default one.
    let remote = build_remote(&config)?;

    let stop = StopSignal::default();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.trigger())
        .context("cannot install the Ctrl-C handler")?;

    let link = SerialLink::open(&config.serial.port, config.serial.baud_rate, config.read_timeout())
        .inspect_err(|e| log::error!("{e}"))?;
    let csv_log = CsvLog::open(&config.csv.path, config.schema())?;
    log::info!("Logging to {}", csv_log.path().display());

    let report = IngestLoop::new(cli.ingest_options(&config), csv_log, remote, stop)?.run(link)?;
    if report.uploads.failures > 0 {
        log::warn!(
            "{} of {} uploads failed",
            report.uploads.failures,
            report.uploads.attempts
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_config_file() {
        let cli = Cli::parse_from([
            "sensorlog-ingest",
            "--port",
            "COM3",
            "--timestamp-column",
            "false",
            "--max-duration",
            "20s",
            "--upload",
            "every-row",
            "--backend",
            "local-dir",
        ]);
        let mut config = LoggerConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.serial.port, "COM3");
        assert_eq!(config.serial.baud_rate, 9600);
        assert!(!config.csv.timestamp_column);
        assert_eq!(cli.ingest_options(&config).max_duration, Some(Duration::from_secs(20)));
        assert_eq!(config.upload.policy, UploadPolicy::EveryRow);
        assert_eq!(config.upload.backend, Backend::LocalDir);
    }

    #[test]
    fn sub_second_durations_are_kept() {
        let config = LoggerConfig::default();
        for (flag, expected) in [("500ms", 500), ("1s 500ms", 1500)] {
            let cli = Cli::parse_from(["sensorlog-ingest", "--max-duration", flag]);
            assert_eq!(
                cli.ingest_options(&config).max_duration,
                Some(Duration::from_millis(expected))
            );
        }
    }

    #[test]
    fn config_duration_applies_without_the_flag() {
        let mut config = LoggerConfig::default();
        config.max_duration_secs = Some(20);
        let cli = Cli::parse_from(["sensorlog-ingest"]);
        assert_eq!(cli.ingest_options(&config).max_duration, Some(Duration::from_secs(20)));
    }

    #[test]
    fn unknown_policies_are_rejected() {
        assert!(Cli::try_parse_from(["sensorlog-ingest", "--upload", "sometimes"]).is_err());
    }

    #[test]
    fn nothing_is_built_when_uploads_are_off() {
        let config = LoggerConfig::default();
        assert!(build_remote(&config).unwrap().is_none());
    }
}
