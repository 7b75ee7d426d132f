// Prevent console window in addition to Slint window in Windows release builds when, e.g., starting the app via file manager. Ignored on other platforms.
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

slint::include_modules!();

use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use sensorlog_common::remote::{self, fetch_to_file, RemoteStoragePointer};
use sensorlog_common::LoggerConfig;
use sensorlog_model::{render, ChartSpec, CsvSnapshot};

/// Size of the box the chart paths are scaled into. Matches the
/// `viewbox-width` and `viewbox-height` of the Path in appwindow.slint.
const VIEWBOX_WIDTH: f32 = 400.0;
const VIEWBOX_HEIGHT: f32 = 150.0;

/// Shows the sensor log as four line charts and redraws them periodically.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// JSON configuration file. Defaults to `config.json` in the platform config directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Remote object to fetch. Without it the local CSV log is read directly.
    #[arg(long)]
    file_id: Option<String>,

    /// Local CSV log to read when no remote object is given.
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Seconds between two refreshes.
    #[arg(long)]
    refresh_secs: Option<u64>,
}

/// Where the dashboard gets its CSV from.
enum CsvSource {
    /// A log on this machine, e.g. the one the ingest loop writes.
    Local(PathBuf),
    /// A remote copy, downloaded to `local` on every refresh.
    Remote {
        storage: RemoteStoragePointer,
        file_id: String,
        local: PathBuf,
    },
}

impl CsvSource {
    fn from_config(config: &LoggerConfig) -> anyhow::Result<Self> {
        Ok(match &config.dashboard.file_id {
            Some(file_id) => Self::Remote {
                storage: remote::open_backend(config)?,
                file_id: file_id.clone(),
                local: config.dashboard.local_csv.clone(),
            },
            None => Self::Local(config.csv.path.clone()),
        })
    }

    fn snapshot(&mut self) -> anyhow::Result<CsvSnapshot> {
        let path = match self {
            Self::Local(path) => path,
            Self::Remote {
                storage,
                file_id,
                local,
            } => {
                let bytes = fetch_to_file(storage.as_mut(), file_id, local)
                    .with_context(|| format!("cannot download {file_id}"))?;
                log::info!("File downloaded to {} ({bytes} bytes)", local.display());
                local
            }
        };

        CsvSnapshot::from_path(&*path).with_context(|| format!("cannot read {}", path.display()))
    }
}

/// Our App struct holds the UI, a timer and the channel that asks the fetch
/// thread for a refresh.
///
/// Downloads can take a while, so the CSV is fetched on its own thread and
/// the result is handed back to the UI thread through the event loop.
struct App {
    ui: AppWindow,
    refresh: mpsc::SyncSender<()>,
    timer: slint::Timer,
    refresh_interval: Duration,
}

impl App {
    fn new(config: &LoggerConfig) -> anyhow::Result<Self> {
        let ui = AppWindow::new()?;

        let source = CsvSource::from_config(config)?;
        let refresh = spawn_fetcher(source, ui.as_weak())?;

        Ok(Self {
            ui,
            refresh,
            timer: slint::Timer::default(),
            refresh_interval: config.refresh_interval(),
        })
    }

    /// Draws once right away, then on every tick of the timer.
    fn run(&mut self) -> anyhow::Result<()> {
        request_refresh(&self.refresh);

        let refresh = self.refresh.clone();
        self.timer.start(
            slint::TimerMode::Repeated,
            self.refresh_interval,
            move || {
                request_refresh(&refresh);
            },
        );

        self.ui.run().map_err(|e| e.into())
    }
}

/// Starts the thread that owns `source` and fetches a snapshot for every
/// request. It ends when the window or the request channel goes away.
fn spawn_fetcher(
    mut source: CsvSource,
    ui: slint::Weak<AppWindow>,
) -> anyhow::Result<mpsc::SyncSender<()>> {
    // One pending request is enough, ticks during a fetch are dropped.
    let (refresh, requests) = mpsc::sync_channel::<()>(1);

    std::thread::Builder::new()
        .name("csv-fetch".into())
        .spawn(move || {
            for () in requests {
                let snapshot = source.snapshot();
                if ui.upgrade_in_event_loop(move |ui| show(&ui, snapshot)).is_err() {
                    break;
                }
            }
        })
        .context("cannot start the fetch thread")?;

    Ok(refresh)
}

/// Returns whether a new refresh was queued.
fn request_refresh(refresh: &mpsc::SyncSender<()>) -> bool {
    match refresh.try_send(()) {
        Ok(()) => true,
        Err(mpsc::TrySendError::Full(())) => {
            log::debug!("Previous refresh still running, skipping this one");
            false
        }
        Err(mpsc::TrySendError::Disconnected(())) => {
            log::warn!("Fetch thread is gone, charts are no longer refreshed");
            false
        }
    }
}

/// Replaces the charts with a fresh snapshot. When fetching failed the
/// previous charts stay on screen.
fn show(ui: &AppWindow, snapshot: anyhow::Result<CsvSnapshot>) {
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let model = ui.global::<ViewModel>();

    let status = match snapshot {
        Ok(snapshot) => {
            let charts: Vec<Chart> = render(&snapshot).iter().map(Chart::from).collect();
            model.set_charts(slint::ModelRc::new(slint::VecModel::from(charts)));
            format!("{} readings, last refresh {now}", snapshot.len())
        }
        Err(e) => {
            log::warn!("Dashboard refresh failed: {e:#}");
            format!("Refresh failed at {now}: {e}")
        }
    };

    model.set_status(status.into());
}

impl From<&ChartSpec> for Chart {
    fn from(spec: &ChartSpec) -> Self {
        let (y_min, y_max) = spec
            .y_range()
            .map(|(min, max)| (format_value(min), format_value(max)))
            .unwrap_or_default();
        let (x_first, x_last) = match (spec.points.first(), spec.points.last()) {
            (Some(first), Some(last)) => (first.label.clone(), last.label.clone()),
            _ => Default::default(),
        };

        Self {
            title: spec.title.into(),
            commands: spec.path_commands(VIEWBOX_WIDTH, VIEWBOX_HEIGHT).into(),
            latest: spec
                .latest()
                .map(|point| format_value(point.y))
                .unwrap_or_else(|| "no data".to_owned())
                .into(),
            y_min: y_min.into(),
            y_max: y_max.into(),
            x_first: x_first.into(),
            x_last: x_last.into(),
        }
    }
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.1}")
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = LoggerConfig::load_or_default(cli.config.as_deref())?;
    if let Some(file_id) = cli.file_id {
        config.dashboard.file_id = Some(file_id);
    }
    if let Some(csv) = cli.csv {
        config.csv.path = csv;
    }
    if let Some(refresh_secs) = cli.refresh_secs {
        config.dashboard.refresh_secs = refresh_secs;
    }
    config.validate()?;

    let mut app = App::new(&config)?;

    app.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorlog_model::ChartPoint;

    #[test]
    fn chart_shows_range_and_latest_value() {
        let spec = ChartSpec {
            id: "humidity-over-time",
            title: "Humidity Over Time",
            column: "Humidity (%)",
            points: vec![
                ChartPoint {
                    x: 0.0,
                    label: "12:00:00".into(),
                    y: 55.0,
                },
                ChartPoint {
                    x: 10.0,
                    label: "12:00:10".into(),
                    y: 54.5,
                },
            ],
        };

        let chart = Chart::from(&spec);
        assert_eq!(chart.title, "Humidity Over Time");
        assert_eq!(chart.latest, "54.5");
        assert_eq!(chart.y_min, "54.5");
        assert_eq!(chart.y_max, "55");
        assert_eq!(chart.x_first, "12:00:00");
        assert_eq!(chart.x_last, "12:00:10");
        assert!(chart.commands.starts_with("M 0.0"));
    }

    #[test]
    fn empty_chart_says_so() {
        let spec = ChartSpec {
            id: "light-level-over-time",
            title: "Light Level Over Time",
            column: "Light Level (%)",
            points: Vec::new(),
        };

        let chart = Chart::from(&spec);
        assert_eq!(chart.latest, "no data");
        assert!(chart.commands.is_empty());
    }

    #[test]
    fn sources_can_move_to_the_fetch_thread() {
        fn assert_send<T: Send>() {}
        assert_send::<CsvSource>();
    }

    #[test]
    fn refreshes_do_not_pile_up() {
        let (refresh, requests) = mpsc::sync_channel(1);
        assert!(request_refresh(&refresh));
        assert!(!request_refresh(&refresh));

        requests.recv().unwrap();
        assert!(request_refresh(&refresh));

        drop(requests);
        assert!(!request_refresh(&refresh));
    }

    #[test]
    fn missing_local_log_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = CsvSource::Local(dir.path().join("missing.csv"));
        assert!(source.snapshot().is_err());
    }

    #[test]
    fn local_log_is_read_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sensor_data.csv");
        std::fs::write(
            &path,
            "Timestamp,Light Level (%),Gas Concentration (MQ135),Humidity (%),Temperature (°C)\n\
             2024-10-01 12:00:00,40,300,55,21.5\n",
        )
        .unwrap();

        let snapshot = CsvSource::Local(path).snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
    }
}
