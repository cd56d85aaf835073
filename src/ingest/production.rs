//! Sample plant data beside the sensor feed
//!
//! Production metrics per line and machine, quality control tests per batch
//! and maintenance events per machine. Each feed is seeded and maps onto its
//! own table through [`CsvRecord`].

use crate::ingest::generator::{line_equipment, operating_factor, CsvRecord, GeneratorConfig, EQUIPMENT, LINES};
use crate::storage::Event;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const MINUTE: i64 = 60_000;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

/// Default spacing of production metric rows
pub const PRODUCTION_INTERVAL: i64 = 5 * MINUTE;

const PRODUCTS: [&str; 4] = ["PROD_A001", "PROD_B002", "PROD_C003", "PROD_D004"];
const TEST_TYPES: [&str; 4] = ["dimensional", "visual", "functional", "electrical"];
const INSPECTORS: [&str; 4] = ["INSP_001", "INSP_002", "INSP_003", "INSP_004"];
const TECHNICIANS: [&str; 5] = ["TECH_001", "TECH_002", "TECH_003", "TECH_004", "TECH_005"];
const FAULTS: [(&str, &str); 6] = [
    ("bearing failure", "bearings;seals"),
    ("sensor malfunction", "sensors;wiring"),
    ("electrical issue", "electrical_components"),
    ("hydraulic leak", "hydraulic_seals;hoses"),
    ("belt replacement", "belts;pulleys"),
    ("calibration drift", "calibration_tools"),
];

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

fn span(config: &GeneratorConfig) -> (i64, i64) {
    let span = config.days.max(0).saturating_mul(DAY);
    let start = config
        .start
        .unwrap_or_else(|| Utc::now().timestamp_millis().saturating_sub(span));
    (start, start.saturating_add(span))
}

fn opt_cell(value: Option<f64>, places: usize) -> String {
    value.map(|v| format!("{:.*}", places, v)).unwrap_or_default()
}

/// Throughput and efficiency of one machine over one interval
#[derive(Debug, Clone, PartialEq)]
pub struct ProductionMetric {
    pub timestamp: i64,
    pub line_id: &'static str,
    pub equipment_id: &'static str,
    /// Seconds per unit
    pub cycle_time: f64,
    /// Units per hour
    pub throughput: f64,
    /// 0 to 100
    pub efficiency_score: f64,
    /// kWh
    pub energy_consumption: f64,
    /// Minutes
    pub downtime_duration: f64,
    /// Percent
    pub defect_rate: f64,
}

impl CsvRecord for ProductionMetric {
    const HEADER: &'static [&'static str] = &[
        "time",
        "line_id",
        "equipment_id",
        "cycle_time",
        "throughput",
        "efficiency_score",
        "energy_consumption",
        "downtime_duration",
        "defect_rate",
    ];

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.line_id.to_string(),
            self.equipment_id.to_string(),
            format!("{:.1}", self.cycle_time),
            format!("{:.1}", self.throughput),
            format!("{:.1}", self.efficiency_score),
            format!("{:.2}", self.energy_consumption),
            format!("{:.1}", self.downtime_duration),
            format!("{:.2}", self.defect_rate),
        ]
    }

    fn to_event(&self) -> Event {
        Event::new(self.timestamp)
            .tag("line_id", self.line_id)
            .tag("equipment_id", self.equipment_id)
            .field("cycle_time", self.cycle_time)
            .field("throughput", self.throughput)
            .field("efficiency_score", self.efficiency_score)
            .field("energy_consumption", self.energy_consumption)
            .field("downtime_duration", self.downtime_duration)
            .field("defect_rate", self.defect_rate)
    }
}

/// Production metrics for every line's machines at each interval
///
/// All machines on a line share the interval's shift baseline, so their
/// efficiency and throughput move together.
pub struct ProductionGenerator {
    rng: StdRng,
    end: i64,
    interval: i64,
    current: i64,
    pending: Vec<ProductionMetric>,
}

impl ProductionGenerator {
    /// `config.interval` is the spacing between rows of one machine
    pub fn new(config: &GeneratorConfig) -> Self {
        let (start, end) = span(config);
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            end,
            interval: config.interval.max(1),
            current: start,
            pending: Vec::new(),
        }
    }

    fn step(&mut self, ts: i64) -> Vec<ProductionMetric> {
        let time: DateTime<Utc> = DateTime::from_timestamp_millis(ts).unwrap_or_default();
        let factor = operating_factor(&time);
        let mut rows = Vec::new();

        for line in LINES {
            let (base_efficiency, base_throughput) = if factor < 0.5 {
                (self.rng.gen_range(30.0..50.0), self.rng.gen_range(10.0..30.0))
            } else if factor < 1.0 {
                (self.rng.gen_range(60.0..80.0), self.rng.gen_range(40.0..70.0))
            } else {
                (self.rng.gen_range(80.0..95.0), self.rng.gen_range(70.0..120.0))
            };

            for equipment in line_equipment(line) {
                let cycle_time = self.rng.gen_range(35.0..55.0) * (100.0 / f64::max(base_efficiency, 50.0));
                let throughput = base_throughput * self.rng.gen_range(0.8..1.2);
                let efficiency: f64 = (base_efficiency * self.rng.gen_range(0.9..1.1)).clamp(0.0, 100.0);

                let energy_base = if line == LINES[0] { 8.0 } else { 7.5 };
                let energy = energy_base + throughput / 100.0 * 5.0 + self.rng.gen_range(-1.0..1.0);

                // Exponential downtime, more likely as efficiency drops
                let downtime_prob = (100.0 - efficiency) / 100.0 * 0.3;
                let downtime = if self.rng.gen::<f64>() < downtime_prob {
                    let u: f64 = self.rng.gen_range(f64::EPSILON..1.0);
                    -u.ln() * downtime_prob * 15.0
                } else {
                    0.0
                };
                let defect_rate = f64::max(0.0, (100.0 - efficiency) / 10.0 + self.rng.gen_range(-1.0..1.0));

                rows.push(ProductionMetric {
                    timestamp: ts,
                    line_id: line,
                    equipment_id: equipment.id,
                    cycle_time: round_to(cycle_time, 1),
                    throughput: round_to(throughput, 1),
                    efficiency_score: round_to(efficiency, 1),
                    energy_consumption: round_to(energy, 2),
                    downtime_duration: round_to(downtime, 1),
                    defect_rate: round_to(defect_rate, 2),
                });
            }
        }
        // Popped from the back
        rows.reverse();
        rows
    }
}

impl Iterator for ProductionGenerator {
    type Item = ProductionMetric;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pending.is_empty() {
            if self.current >= self.end {
                return None;
            }
            let ts = self.current;
            self.pending = self.step(ts);
            self.current = self.current.saturating_add(self.interval);
        }
        self.pending.pop()
    }
}

/// One quality control test of a production batch
#[derive(Debug, Clone, PartialEq)]
pub struct QualityTest {
    pub timestamp: i64,
    pub batch_id: String,
    pub line_id: &'static str,
    pub product_id: &'static str,
    pub test_type: &'static str,
    pub passed: bool,
    /// Only dimensional and electrical tests measure a value
    pub measurement: Option<f64>,
    pub tolerance: Option<(f64, f64)>,
    pub inspector_id: &'static str,
}

impl QualityTest {
    pub fn result(&self) -> &'static str {
        if self.passed {
            "pass"
        } else {
            "fail"
        }
    }
}

impl CsvRecord for QualityTest {
    const HEADER: &'static [&'static str] = &[
        "time",
        "batch_id",
        "line_id",
        "product_id",
        "test_type",
        "test_result",
        "measurement_value",
        "tolerance_min",
        "tolerance_max",
        "inspector_id",
    ];

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.batch_id.clone(),
            self.line_id.to_string(),
            self.product_id.to_string(),
            self.test_type.to_string(),
            self.result().to_string(),
            opt_cell(self.measurement, 2),
            opt_cell(self.tolerance.map(|t| t.0), 1),
            opt_cell(self.tolerance.map(|t| t.1), 1),
            self.inspector_id.to_string(),
        ]
    }

    fn to_event(&self) -> Event {
        let mut event = Event::new(self.timestamp)
            .tag("batch_id", self.batch_id.as_str())
            .tag("line_id", self.line_id)
            .tag("product_id", self.product_id)
            .tag("test_type", self.test_type)
            .tag("test_result", self.result())
            .tag("inspector_id", self.inspector_id);
        if let Some(value) = self.measurement {
            event = event.field("measurement_value", value);
        }
        if let Some((min, max)) = self.tolerance {
            event = event.field("tolerance_min", min).field("tolerance_max", max);
        }
        event
    }
}

/// Quality tests at irregular 30 minute to 3 hour gaps
///
/// Each line is tested with 70% probability per gap and 95% of tests pass.
pub struct QualityGenerator {
    rng: StdRng,
    end: i64,
    current: i64,
    next_batch: u32,
    pending: Vec<QualityTest>,
}

impl QualityGenerator {
    pub fn new(config: &GeneratorConfig) -> Self {
        let (start, end) = span(config);
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            end,
            current: start,
            next_batch: 1000,
            pending: Vec::new(),
        }
    }

    fn measure(&mut self, test_type: &str, passed: bool) -> (Option<f64>, Option<(f64, f64)>) {
        let (min, max, margin, spread) = match test_type {
            "dimensional" => (10.0, 10.5, 0.05, 0.2),
            "electrical" => (45.0, 55.0, 1.0, 5.0),
            _ => return (None, None),
        };
        let value = if passed {
            self.rng.gen_range(min + margin..max - margin)
        } else if self.rng.gen_bool(0.5) {
            self.rng.gen_range(min - spread..min - 0.01)
        } else {
            self.rng.gen_range(max + 0.01..max + spread)
        };
        (Some(round_to(value, 2)), Some((min, max)))
    }

    fn test(&mut self, ts: i64, line: &'static str) -> QualityTest {
        let batch_id = format!("BATCH_{:06}", self.next_batch);
        self.next_batch += 1;
        let product_id = PRODUCTS.choose(&mut self.rng).copied().unwrap_or(PRODUCTS[0]);
        let test_type = TEST_TYPES.choose(&mut self.rng).copied().unwrap_or(TEST_TYPES[0]);
        let inspector_id = INSPECTORS.choose(&mut self.rng).copied().unwrap_or(INSPECTORS[0]);
        let passed = self.rng.gen_bool(0.95);
        let (measurement, tolerance) = self.measure(test_type, passed);

        QualityTest {
            timestamp: ts,
            batch_id,
            line_id: line,
            product_id,
            test_type,
            passed,
            measurement,
            tolerance,
            inspector_id,
        }
    }
}

impl Iterator for QualityGenerator {
    type Item = QualityTest;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pending.is_empty() {
            let ts = self
                .current
                .saturating_add(self.rng.gen_range(30..=180) * MINUTE);
            if ts >= self.end {
                return None;
            }
            self.current = ts;
            for &line in LINES.iter().rev() {
                if self.rng.gen_bool(0.7) {
                    let test = self.test(ts, line);
                    self.pending.push(test);
                }
            }
        }
        self.pending.pop()
    }
}

/// Preventive or corrective work on one machine
#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceEvent {
    pub timestamp: i64,
    pub equipment_id: &'static str,
    /// `scheduled` or `unscheduled`
    pub event_type: &'static str,
    /// `preventive` or `corrective`
    pub maintenance_type: &'static str,
    /// Hours
    pub duration: f64,
    pub cost: f64,
    pub technician_id: &'static str,
    pub description: String,
    /// `;`-separated part list
    pub parts_replaced: Option<&'static str>,
}

impl CsvRecord for MaintenanceEvent {
    const HEADER: &'static [&'static str] = &[
        "time",
        "equipment_id",
        "event_type",
        "maintenance_type",
        "duration",
        "cost",
        "technician_id",
        "description",
        "parts_replaced",
    ];

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.equipment_id.to_string(),
            self.event_type.to_string(),
            self.maintenance_type.to_string(),
            format!("{:.1}", self.duration),
            format!("{:.2}", self.cost),
            self.technician_id.to_string(),
            self.description.clone(),
            self.parts_replaced.unwrap_or_default().to_string(),
        ]
    }

    fn to_event(&self) -> Event {
        let mut event = Event::new(self.timestamp)
            .tag("equipment_id", self.equipment_id)
            .tag("event_type", self.event_type)
            .tag("maintenance_type", self.maintenance_type)
            .tag("technician_id", self.technician_id)
            .tag("description", self.description.as_str())
            .field("duration", self.duration)
            .field("cost", self.cost);
        if let Some(parts) = self.parts_replaced {
            event = event.tag("parts_replaced", parts);
        }
        event
    }
}

/// Maintenance history over the configured span, sorted by time
///
/// Every machine gets preventive maintenance every 28 to 35 days and an
/// unscheduled repair on any given day with 2% probability.
pub fn maintenance_events(config: &GeneratorConfig) -> Vec<MaintenanceEvent> {
    let (start, end) = span(config);
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut events = Vec::new();

    for equipment in &EQUIPMENT {
        let mut next = start.saturating_add(rng.gen_range(28..=35) * DAY);
        while next < end {
            events.push(MaintenanceEvent {
                timestamp: next,
                equipment_id: equipment.id,
                event_type: "scheduled",
                maintenance_type: "preventive",
                duration: round_to(rng.gen_range(2.0..6.0), 1),
                cost: round_to(rng.gen_range(500.0..2000.0), 2),
                technician_id: TECHNICIANS.choose(&mut rng).copied().unwrap_or(TECHNICIANS[0]),
                description: format!("Scheduled preventive maintenance for {}", equipment.id),
                parts_replaced: rng.gen_bool(0.7).then_some("filters;lubricants"),
            });
            next = next.saturating_add(rng.gen_range(28..=35) * DAY);
        }

        let mut day = start;
        while day < end {
            if rng.gen_bool(0.02) {
                let ts = day.saturating_add(rng.gen_range(8..=18) * HOUR);
                let (fault, parts) = FAULTS.choose(&mut rng).copied().unwrap_or(FAULTS[0]);
                let event = MaintenanceEvent {
                    timestamp: ts,
                    equipment_id: equipment.id,
                    event_type: "unscheduled",
                    maintenance_type: "corrective",
                    duration: round_to(rng.gen_range(1.0..8.0), 1),
                    cost: round_to(rng.gen_range(200.0..5000.0), 2),
                    technician_id: TECHNICIANS.choose(&mut rng).copied().unwrap_or(TECHNICIANS[0]),
                    description: format!("Unscheduled repair: {}", fault),
                    parts_replaced: rng.gen_bool(0.8).then_some(parts),
                };
                if ts < end {
                    events.push(event);
                }
            }
            day = day.saturating_add(DAY);
        }
    }

    events.sort_by(|a, b| (a.timestamp, a.equipment_id).cmp(&(b.timestamp, b.equipment_id)));
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::generator::write_csv;
    use crate::ingest::loader::parse_csv;
    use crate::storage::TableConfig;

    // 2024-01-01 00:00:00 UTC, a Monday
    const MONDAY: i64 = 1_704_067_200_000;

    fn config(days: i64, interval: i64) -> GeneratorConfig {
        GeneratorConfig {
            start: Some(MONDAY),
            days,
            interval,
            seed: 42,
        }
    }

    fn production_table() -> TableConfig {
        TableConfig::new("production_metrics")
            .tags(["line_id", "equipment_id"])
            .fields([
                "cycle_time",
                "throughput",
                "efficiency_score",
                "energy_consumption",
                "downtime_duration",
                "defect_rate",
            ])
    }

    #[test]
    fn test_production_row_per_machine_every_interval() {
        let rows: Vec<_> = ProductionGenerator::new(&config(1, PRODUCTION_INTERVAL)).collect();
        // 288 five-minute steps, one row per machine on a line
        assert_eq!(rows.len(), 288 * EQUIPMENT.len());
        assert!(rows.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!((rows[0].line_id, rows[0].equipment_id), ("Line 1", "MOTOR_001"));
        assert_eq!(rows[EQUIPMENT.len()].timestamp, MONDAY + PRODUCTION_INTERVAL);
        assert!(rows
            .iter()
            .all(|r| (0.0..=100.0).contains(&r.efficiency_score) && r.defect_rate >= 0.0));

        let again: Vec<_> = ProductionGenerator::new(&config(1, PRODUCTION_INTERVAL)).collect();
        assert_eq!(rows, again);
    }

    #[test]
    fn test_production_follows_the_shift() {
        let rows: Vec<_> = ProductionGenerator::new(&config(7, HOUR)).collect();
        let mean = |pick: &dyn Fn(i64) -> bool| {
            let picked: Vec<f64> = rows
                .iter()
                .filter(|r| pick(r.timestamp - MONDAY))
                .map(|r| r.efficiency_score)
                .collect();
            picked.iter().sum::<f64>() / picked.len() as f64
        };
        let weekday_noon = mean(&|offset| offset < 5 * DAY && offset % DAY == 12 * HOUR);
        let weekend = mean(&|offset| offset >= 5 * DAY);
        assert!(weekday_noon > 70.0, "{}", weekday_noon);
        assert!(weekend < 60.0, "{}", weekend);
    }

    #[test]
    fn test_production_csv_loads_into_its_table() {
        let mut out = Vec::new();
        let written = write_csv(&mut out, ProductionGenerator::new(&config(1, HOUR))).unwrap();
        assert_eq!(written, 24 * EQUIPMENT.len());

        let parsed = parse_csv(out.as_slice(), &production_table()).unwrap();
        assert_eq!(parsed.rows_failed, 0);
        assert_eq!(parsed.events.len(), written);
        let expected: Vec<Event> = ProductionGenerator::new(&config(1, HOUR))
            .map(|r| r.to_event())
            .collect();
        assert_eq!(parsed.events[0].tags, expected[0].tags);
        assert_eq!(parsed.events[0].timestamp, MONDAY);
    }

    #[test]
    fn test_quality_tests_measure_only_numeric_types() {
        let tests: Vec<_> = QualityGenerator::new(&config(30, 0)).collect();
        assert!(tests.len() > 100);
        assert!(tests.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(tests[0].batch_id, "BATCH_001000");

        for test in &tests {
            match (test.test_type, test.tolerance, test.measurement) {
                ("dimensional" | "electrical", Some((min, max)), Some(value)) => {
                    assert_eq!(test.passed, (min..=max).contains(&value), "{:?}", test);
                }
                ("visual" | "functional", None, None) => {}
                _ => panic!("unexpected measurement shape: {:?}", test),
            }
        }
        let pass_rate = tests.iter().filter(|t| t.passed).count() as f64 / tests.len() as f64;
        assert!(pass_rate > 0.85, "{}", pass_rate);
    }

    #[test]
    fn test_quality_csv_leaves_missing_measurements_empty() {
        let schema = TableConfig::new("quality_control")
            .tags(["batch_id", "line_id", "product_id", "test_type", "test_result", "inspector_id"])
            .fields(["measurement_value", "tolerance_min", "tolerance_max"]);
        let tests: Vec<_> = QualityGenerator::new(&config(7, 0)).collect();

        let mut out = Vec::new();
        write_csv(&mut out, tests.clone()).unwrap();
        let parsed = parse_csv(out.as_slice(), &schema).unwrap();
        assert_eq!(parsed.rows_failed, 0);
        for (event, test) in parsed.events.iter().zip(&tests) {
            assert_eq!(event.fields.contains_key("measurement_value"), test.measurement.is_some());
            assert_eq!(event.tags, test.to_event().tags);
        }
    }

    #[test]
    fn test_maintenance_schedule() {
        let events = maintenance_events(&config(90, 0));
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(events.iter().all(|e| e.timestamp >= MONDAY && e.timestamp < MONDAY + 90 * DAY));

        // Two or three preventive visits per machine in 90 days
        for equipment in &EQUIPMENT {
            let visits = events
                .iter()
                .filter(|e| e.equipment_id == equipment.id && e.maintenance_type == "preventive")
                .count();
            assert!((2..=3).contains(&visits), "{} had {}", equipment.id, visits);
        }
        assert!(events
            .iter()
            .filter(|e| e.event_type == "unscheduled")
            .all(|e| e.description.starts_with("Unscheduled repair: ")));
        assert_eq!(events, maintenance_events(&config(90, 0)));
    }
}
