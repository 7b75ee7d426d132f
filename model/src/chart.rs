use std::fmt::Write as _;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime};

use crate::{GAS_CONCENTRATION, HUMIDITY, LIGHT_LEVEL, TEMPERATURE, TIMESTAMP};

pub const CHART_COUNT: usize = 4;

/// (id, title, column) of every chart, in display order.
const CHARTS: [(&str, &str, &str); CHART_COUNT] = [
    ("light-level-over-time", "Light Level Over Time", LIGHT_LEVEL),
    ("temperature-over-time", "Temperature Over Time", TEMPERATURE),
    ("humidity-over-time", "Humidity Over Time", HUMIDITY),
    (
        "gas-concentration-over-time",
        "Gas Concentration Over Time",
        GAS_CONCENTRATION,
    ),
];

const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// An in-memory copy of a CSV log as it was when it was read.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CsvSnapshot {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl CsvSnapshot {
    /// Reads a whole CSV log. Bytes that are not valid UTF-8 are replaced, so
    /// logs written with a legacy encoding still load.
    pub fn parse<R: Read>(reader: R) -> Result<Self, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers = reader
            .byte_headers()?
            .iter()
            .map(|name| normalize_header(&String::from_utf8_lossy(name)))
            .collect();

        let mut rows = Vec::new();
        for record in reader.byte_records() {
            let record = record?;
            rows.push(
                record
                    .iter()
                    .map(|cell| String::from_utf8_lossy(cell).into_owned())
                    .collect(),
            );
        }

        Ok(Self { headers, rows })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, csv::Error> {
        Self::parse(std::fs::File::open(path)?)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }
}

/// Maps mis-encoded spellings of the temperature header (a Latin-1 degree
/// sign read as UTF-8, or the other way round) onto [`TEMPERATURE`].
pub fn normalize_header(raw: &str) -> String {
    let name = raw.trim().trim_start_matches('\u{feff}');
    if name.starts_with("Temperature (") && name.ends_with("C)") {
        return TEMPERATURE.to_owned();
    }
    name.to_owned()
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChartPoint {
    pub x: f64,
    /// The x value as it appears in the log.
    pub label: String,
    pub y: f64,
}

/// Everything needed to draw one line chart.
#[derive(Clone, Debug, PartialEq)]
pub struct ChartSpec {
    pub id: &'static str,
    pub title: &'static str,
    pub column: &'static str,
    pub points: Vec<ChartPoint>,
}

impl ChartSpec {
    pub fn latest(&self) -> Option<&ChartPoint> {
        self.points.last()
    }

    pub fn x_range(&self) -> Option<(f64, f64)> {
        range(self.points.iter().map(|p| p.x))
    }

    pub fn y_range(&self) -> Option<(f64, f64)> {
        range(self.points.iter().map(|p| p.y))
    }

    /// SVG path commands drawing the series as a polyline inside a
    /// `width` x `height` box, y growing downwards. Empty when there is
    /// nothing to draw.
    pub fn path_commands(&self, width: f32, height: f32) -> String {
        let (Some((x_min, x_max)), Some((y_min, y_max))) = (self.x_range(), self.y_range())
        else {
            return String::new();
        };

        let width = f64::from(width);
        let height = f64::from(height);
        let scale = |value: f64, min: f64, max: f64, extent: f64| {
            if max > min {
                (value - min) / (max - min) * extent
            } else {
                extent / 2.0
            }
        };

        let mut commands = String::new();
        if self.points.len() == 1 {
            let y = height - scale(self.points[0].y, y_min, y_max, height);
            let _ = write!(commands, "M 0 {y:.1} L {width:.1} {y:.1}");
            return commands;
        }

        for (i, point) in self.points.iter().enumerate() {
            let x = scale(point.x, x_min, x_max, width);
            let y = height - scale(point.y, y_min, y_max, height);
            let op = if i == 0 { "M" } else { " L" };
            let _ = write!(commands, "{op} {x:.1} {y:.1}");
        }
        commands
    }
}

fn range(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    values.fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((min, max)) => Some((min.min(v), max.max(v))),
    })
}

/// Builds the four dashboard charts from a snapshot: light level,
/// temperature, humidity and gas concentration, each against the timestamp.
///
/// When the snapshot has no timestamp column, or one of its timestamps cannot
/// be read as a time or a number, rows are plotted against their index
/// instead. Cells that are not numbers are left out of that chart only.
pub fn render(snapshot: &CsvSnapshot) -> [ChartSpec; CHART_COUNT] {
    let x_axis = x_axis(snapshot);

    CHARTS.map(|(id, title, column)| {
        let points = match snapshot.column(column) {
            Some(col) => snapshot
                .rows
                .iter()
                .zip(&x_axis)
                .filter_map(|(row, (x, label))| {
                    let y = row.get(col)?.trim().parse::<f64>().ok()?;
                    y.is_finite().then(|| ChartPoint {
                        x: *x,
                        label: label.clone(),
                        y,
                    })
                })
                .collect(),
            None => {
                log::warn!("CSV snapshot has no {column:?} column");
                Vec::new()
            }
        };

        ChartSpec {
            id,
            title,
            column,
            points,
        }
    })
}

fn x_axis(snapshot: &CsvSnapshot) -> Vec<(f64, String)> {
    let labels: Vec<String> = match snapshot.column(TIMESTAMP) {
        Some(col) => snapshot
            .rows
            .iter()
            .map(|row| row.get(col).map(|s| s.trim().to_owned()).unwrap_or_default())
            .collect(),
        None => (0..snapshot.rows.len()).map(|i| i.to_string()).collect(),
    };

    let times: Option<Vec<f64>> = snapshot
        .column(TIMESTAMP)
        .and_then(|_| labels.iter().map(|l| parse_timestamp(l)).collect());

    match times {
        Some(times) => times.into_iter().zip(labels).collect(),
        None => labels
            .into_iter()
            .enumerate()
            .map(|(i, label)| (i as f64, label))
            .collect(),
    }
}

/// Seconds since the epoch for date-times, or the raw value for numeric
/// timestamps such as a board's uptime counter.
fn parse_timestamp(raw: &str) -> Option<f64> {
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Some(time.timestamp_millis() as f64 / 1000.0);
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(time) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(time.and_utc().timestamp_millis() as f64 / 1000.0);
        }
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMESTAMPED_LOG: &str = "\
Timestamp,Light Level (%),Gas Concentration (MQ135),Humidity (%),Temperature (°C)
2024-10-01 12:00:00,40,300,55,21.5
2024-10-01 12:00:10,42,310,54,21.7
2024-10-01 12:00:20,41,oops,54,21.9
";

    #[test]
    fn charts_come_out_in_dashboard_order() {
        let snapshot = CsvSnapshot::parse(TIMESTAMPED_LOG.as_bytes()).unwrap();
        let charts = render(&snapshot);

        let columns: Vec<_> = charts.iter().map(|c| c.column).collect();
        assert_eq!(columns, [LIGHT_LEVEL, TEMPERATURE, HUMIDITY, GAS_CONCENTRATION]);
        assert_eq!(charts[0].title, "Light Level Over Time");
    }

    #[test]
    fn timestamps_become_seconds_and_bad_cells_are_skipped() {
        let snapshot = CsvSnapshot::parse(TIMESTAMPED_LOG.as_bytes()).unwrap();
        let [light, temperature, _, gas] = render(&snapshot);

        assert_eq!(light.points.len(), 3);
        assert_eq!(light.points[1].x - light.points[0].x, 10.0);
        assert_eq!(light.points[0].label, "2024-10-01 12:00:00");
        assert_eq!(temperature.latest().unwrap().y, 21.9);
        assert_eq!(gas.points.len(), 2);
        assert_eq!(gas.y_range(), Some((300.0, 310.0)));
    }

    #[test]
    fn untimed_logs_plot_against_row_index() {
        let log = "Light Level (%),Gas Concentration (MQ135),Humidity (%),Temperature (°C)\n\
                   23,400,55,21.5\n24,410,56,21.6\n";
        let snapshot = CsvSnapshot::parse(log.as_bytes()).unwrap();
        let [light, ..] = render(&snapshot);

        let xs: Vec<_> = light.points.iter().map(|p| p.x).collect();
        assert_eq!(xs, [0.0, 1.0]);
        assert_eq!(light.points[1].label, "1");
    }

    #[test]
    fn unreadable_timestamps_fall_back_to_index() {
        let log = "Timestamp,Light Level (%),Gas Concentration (MQ135),Humidity (%),Temperature (°C)\n\
                   boot,1,2,3,4\n12345,1,2,3,4\n";
        let snapshot = CsvSnapshot::parse(log.as_bytes()).unwrap();
        let [light, ..] = render(&snapshot);

        assert_eq!(light.points[0].x, 0.0);
        assert_eq!(light.points[1].x, 1.0);
        assert_eq!(light.points[0].label, "boot");
    }

    #[test]
    fn misencoded_temperature_header_is_repaired() {
        let mut log = b"Timestamp,Temperature (".to_vec();
        log.push(0xb0);
        log.extend_from_slice(b"C)\n1,20.5\n");
        let snapshot = CsvSnapshot::parse(log.as_slice()).unwrap();
        assert_eq!(snapshot.column(TEMPERATURE), Some(1));

        let snapshot =
            CsvSnapshot::parse("Timestamp,Temperature (Â°C)\n1,20.5\n".as_bytes()).unwrap();
        assert_eq!(snapshot.headers()[1], TEMPERATURE);
        assert_eq!(render(&snapshot)[1].points.len(), 1);
    }

    #[test]
    fn missing_column_gives_an_empty_chart() {
        let snapshot = CsvSnapshot::parse("Timestamp,Humidity (%)\n1,50\n".as_bytes()).unwrap();
        let charts = render(&snapshot);
        assert!(charts[0].points.is_empty());
        assert_eq!(charts[2].points.len(), 1);
        assert_eq!(charts[0].path_commands(100.0, 50.0), "");
    }

    #[test]
    fn path_spans_the_box() {
        let chart = ChartSpec {
            id: "t",
            title: "t",
            column: HUMIDITY,
            points: vec![
                ChartPoint { x: 0.0, label: "0".into(), y: 10.0 },
                ChartPoint { x: 5.0, label: "5".into(), y: 20.0 },
                ChartPoint { x: 10.0, label: "10".into(), y: 15.0 },
            ],
        };
        assert_eq!(
            chart.path_commands(100.0, 50.0),
            "M 0.0 50.0 L 50.0 0.0 L 100.0 25.0"
        );
    }

    #[test]
    fn single_point_draws_a_flat_line() {
        let chart = ChartSpec {
            id: "t",
            title: "t",
            column: HUMIDITY,
            points: vec![ChartPoint { x: 3.0, label: "3".into(), y: 7.0 }],
        };
        assert_eq!(chart.path_commands(80.0, 40.0), "M 0 20.0 L 80.0 20.0");
    }
}
