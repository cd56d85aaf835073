//! Sample data generation and CSV ingestion

pub mod generator;
pub mod loader;
pub mod production;

pub use generator::{
    line_equipment, write_csv, CsvRecord, EquipmentProfile, GeneratorConfig, SensorGenerator, SensorReading, Status,
    EQUIPMENT, LINES,
};
pub use loader::{load_csv, parse_csv, parse_timestamp, IngestError, LoadReport, ParsedCsv};
pub use production::{
    maintenance_events, MaintenanceEvent, ProductionGenerator, ProductionMetric, QualityGenerator, QualityTest,
    PRODUCTION_INTERVAL,
};
