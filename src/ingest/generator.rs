//! Sample sensor data and the shared CSV writer
//!
//! Produces equipment readings with a daily temperature cycle, a slow
//! per-equipment drift, reduced activity on nights and weekends, and the odd
//! temperature spike. Output is reproducible for a given seed.

use crate::storage::Event;
use chrono::{DateTime, Datelike, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::io::Write;

const MINUTE: i64 = 60_000;
const DAY: i64 = 24 * 60 * MINUTE;

/// Chance of a temperature spike per reading
const SPIKE_PROBABILITY: f64 = 0.005;

/// Operating ranges of one piece of equipment
#[derive(Debug, Clone, Copy)]
pub struct EquipmentProfile {
    pub id: &'static str,
    pub kind: &'static str,
    /// Production line the equipment feeds
    pub line: &'static str,
    pub temp_range: (f64, f64),
    pub vib_range: (f64, f64),
}

pub const LINES: [&str; 2] = ["Line 1", "Line 2"];

pub const EQUIPMENT: [EquipmentProfile; 8] = [
    EquipmentProfile { id: "MOTOR_001", kind: "motor", line: "Line 1", temp_range: (45.0, 75.0), vib_range: (2.0, 12.0) },
    EquipmentProfile { id: "MOTOR_002", kind: "motor", line: "Line 1", temp_range: (45.0, 75.0), vib_range: (2.0, 12.0) },
    EquipmentProfile { id: "PUMP_001", kind: "pump", line: "Line 1", temp_range: (40.0, 70.0), vib_range: (5.0, 18.0) },
    EquipmentProfile { id: "PUMP_002", kind: "pump", line: "Line 2", temp_range: (40.0, 70.0), vib_range: (5.0, 18.0) },
    EquipmentProfile { id: "CONV_001", kind: "conveyor", line: "Line 1", temp_range: (25.0, 60.0), vib_range: (1.0, 8.0) },
    EquipmentProfile { id: "ROBOT_001", kind: "robot", line: "Line 1", temp_range: (35.0, 65.0), vib_range: (1.0, 6.0) },
    EquipmentProfile { id: "CONV_002", kind: "conveyor", line: "Line 2", temp_range: (25.0, 60.0), vib_range: (1.0, 8.0) },
    EquipmentProfile { id: "ROBOT_002", kind: "robot", line: "Line 2", temp_range: (35.0, 65.0), vib_range: (1.0, 6.0) },
];

/// Equipment assigned to `line`, in table order
pub fn line_equipment(line: &str) -> impl Iterator<Item = &'static EquipmentProfile> + '_ {
    EQUIPMENT.iter().filter(move |e| e.line == line)
}

/// Reduced activity on weekends and nights
pub(crate) fn operating_factor(time: &DateTime<Utc>) -> f64 {
    if time.weekday().number_from_monday() >= 6 {
        0.4
    } else if time.hour() < 6 || time.hour() > 22 {
        0.7
    } else {
        1.0
    }
}

/// A generated row that maps onto one table
pub trait CsvRecord {
    /// Column names, `time` first
    const HEADER: &'static [&'static str];

    fn timestamp(&self) -> i64;

    /// Cells after `time`, empty for missing values
    fn cells(&self) -> Vec<String>;

    fn to_event(&self) -> Event;
}

/// Health classification of a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Normal,
    Warning,
    Critical,
}

impl Status {
    /// Critical above the maximum, warning above 90% of it
    pub fn classify(temperature: f64, temp_max: f64, vibration: f64, vib_max: f64) -> Self {
        if temperature > temp_max || vibration > vib_max {
            Status::Critical
        } else if temperature > temp_max * 0.9 || vibration > vib_max * 0.9 {
            Status::Warning
        } else {
            Status::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Normal => "normal",
            Status::Warning => "warning",
            Status::Critical => "critical",
        }
    }
}

/// One generated reading
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub timestamp: i64,
    pub equipment_id: &'static str,
    pub temperature: f64,
    pub vibration: f64,
    pub status: Status,
}

impl CsvRecord for SensorReading {
    const HEADER: &'static [&'static str] = &["time", "equipment_id", "temperature", "vibration", "status"];

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.equipment_id.to_string(),
            format!("{:.1}", self.temperature),
            format!("{:.2}", self.vibration),
            self.status.as_str().to_string(),
        ]
    }

    fn to_event(&self) -> Event {
        Event::new(self.timestamp)
            .tag("equipment_id", self.equipment_id)
            .tag("status", self.status.as_str())
            .field("temperature", self.temperature)
            .field("vibration", self.vibration)
    }
}

/// Generator settings
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// First reading, defaults to `days` before now
    pub start: Option<i64>,
    pub days: i64,
    /// Milliseconds between readings of the same equipment
    pub interval: i64,
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            start: None,
            days: 3,
            interval: 2 * MINUTE,
            seed: 42,
        }
    }
}

/// Iterator over readings in time order, all equipment per step
pub struct SensorGenerator {
    rng: StdRng,
    start: i64,
    end: i64,
    interval: i64,
    current: i64,
    next_equipment: usize,
    /// Per-equipment temperature drift in degrees per day
    drift: Vec<f64>,
}

impl SensorGenerator {
    pub fn new(config: &GeneratorConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let span = config.days.max(0).saturating_mul(DAY);
        let start = config
            .start
            .unwrap_or_else(|| Utc::now().timestamp_millis().saturating_sub(span));
        let drift = EQUIPMENT.iter().map(|_| rng.gen_range(-0.1..0.1)).collect();

        Self {
            rng,
            start,
            end: start.saturating_add(span),
            interval: config.interval.max(1),
            current: start,
            next_equipment: 0,
            drift,
        }
    }

    /// Standard normal sample (Box-Muller)
    fn gauss(&mut self, std_dev: f64) -> f64 {
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos() * std_dev
    }

    fn reading(&mut self, ts: i64, index: usize) -> SensorReading {
        let profile = EQUIPMENT[index];
        let time: DateTime<Utc> = DateTime::from_timestamp_millis(ts).unwrap_or_default();
        let hour = time.hour() as f64;
        let operating_factor = operating_factor(&time);

        let (temp_min, temp_max) = profile.temp_range;
        let (vib_min, vib_max) = profile.vib_range;
        let days_elapsed = ((ts - self.start) / DAY) as f64;

        let mut temperature = (temp_min + temp_max) / 2.0
            + 4.0 * (2.0 * PI * hour / 24.0).sin()
            + self.gauss((temp_max - temp_min) * 0.2)
            + self.drift[index] * days_elapsed
            + (operating_factor - 0.7) * 5.0;

        let vibration = ((vib_min + vib_max) / 2.0 * operating_factor
            + self.gauss((vib_max - vib_min) * 0.3)
            + self.rng.gen_range(-1.0..1.0))
        .max(0.1);

        if self.rng.gen::<f64>() < SPIKE_PROBABILITY {
            temperature += self.rng.gen_range(5.0..15.0);
        }

        let temperature = (temperature * 10.0).round() / 10.0;
        let vibration = (vibration * 100.0).round() / 100.0;
        SensorReading {
            timestamp: ts,
            equipment_id: profile.id,
            temperature,
            vibration,
            status: Status::classify(temperature, temp_max, vibration, vib_max),
        }
    }
}

impl Iterator for SensorGenerator {
    type Item = SensorReading;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.end {
            return None;
        }
        let reading = self.reading(self.current, self.next_equipment);
        self.next_equipment += 1;
        if self.next_equipment == EQUIPMENT.len() {
            self.next_equipment = 0;
            self.current = self.current.saturating_add(self.interval);
        }
        Some(reading)
    }
}

/// Write records under their header, times as `%Y-%m-%d %H:%M:%S` UTC
pub fn write_csv<W: Write, R: CsvRecord>(
    writer: W,
    records: impl IntoIterator<Item = R>,
) -> Result<usize, csv::Error> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(R::HEADER)?;

    let mut rows = 0;
    for record in records {
        let ts = record.timestamp();
        let time = DateTime::from_timestamp_millis(ts)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| ts.to_string());
        let mut cells = record.cells();
        cells.insert(0, time);
        out.write_record(&cells)?;
        rows += 1;
    }
    out.flush()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GeneratorConfig {
        GeneratorConfig {
            // 2024-01-01 00:00:00 UTC, a Monday
            start: Some(1_704_067_200_000),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_volume() {
        let readings: Vec<_> = SensorGenerator::new(&config()).collect();
        // 3 days at 2 minutes for 8 pieces of equipment
        assert_eq!(readings.len(), 3 * 720 * 8);
        assert!(readings.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(readings[0].equipment_id, "MOTOR_001");
        assert_eq!(readings[7].equipment_id, "ROBOT_002");
        assert_eq!(readings[8].timestamp, readings[0].timestamp + 2 * MINUTE);
    }

    #[test]
    fn test_seeded_output_is_reproducible() {
        let a: Vec<_> = SensorGenerator::new(&config()).take(500).collect();
        let b: Vec<_> = SensorGenerator::new(&config()).take(500).collect();
        assert_eq!(a, b);

        let other = GeneratorConfig { seed: 7, ..config() };
        let c: Vec<_> = SensorGenerator::new(&other).take(500).collect();
        assert_ne!(a, c);
    }

    #[test]
    fn test_lines_partition_production_equipment() {
        let line1: Vec<_> = line_equipment("Line 1").map(|e| e.id).collect();
        let line2: Vec<_> = line_equipment("Line 2").map(|e| e.id).collect();
        assert_eq!(line1, ["MOTOR_001", "MOTOR_002", "PUMP_001", "CONV_001", "ROBOT_001"]);
        assert_eq!(line2, ["PUMP_002", "CONV_002", "ROBOT_002"]);
        assert_eq!(line1.len() + line2.len(), EQUIPMENT.len());
    }

    #[test]
    fn test_status_thresholds() {
        assert_eq!(Status::classify(60.0, 75.0, 5.0, 12.0), Status::Normal);
        assert_eq!(Status::classify(70.0, 75.0, 5.0, 12.0), Status::Warning);
        assert_eq!(Status::classify(76.0, 75.0, 5.0, 12.0), Status::Critical);
        assert_eq!(Status::classify(60.0, 75.0, 12.5, 12.0), Status::Critical);
    }

    #[test]
    fn test_write_csv_header_and_rows() {
        let mut out = Vec::new();
        let rows = write_csv(&mut out, SensorGenerator::new(&config()).take(3)).unwrap();
        assert_eq!(rows, 3);

        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("time,equipment_id,temperature,vibration,status"));
        assert!(lines.next().unwrap().starts_with("2024-01-01 00:00:00,MOTOR_001,"));
    }
}
