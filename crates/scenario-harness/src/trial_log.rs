use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::Path;

use crate::error::{HarnessError, HarnessResult};
use crate::fsutil::{atomic_write_bytes, atomic_write_json_pretty};
use crate::space::ParameterSpace;

/// Fixed columns, in export order, ahead of one column per parameter.
pub const FIXED_COLUMNS: [&str; 8] = [
    "search_id",
    "ttc",
    "loss",
    "time",
    "distance",
    "collision_status",
    "attempts",
    "collision_flag",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRecord {
    pub trial_id: String,
    pub params: Vec<f64>,
    pub loss: f64,
    pub min_ttc: f64,
    pub collision_flag: bool,
    pub collision_status: String,
    pub distance: f64,
    pub attempts: u32,
    pub degraded: bool,
}

/// Append-only record of every finished trial of one search run.
#[derive(Debug, Clone)]
pub struct TrialLog {
    param_names: Vec<String>,
    records: Vec<TrialRecord>,
    elapsed_secs: Option<f64>,
}

impl TrialLog {
    pub fn new(space: &ParameterSpace) -> Self {
        Self {
            param_names: space.names().map(str::to_string).collect(),
            records: Vec::new(),
            elapsed_secs: None,
        }
    }

    pub fn append(&mut self, record: TrialRecord) -> HarnessResult<()> {
        if record.params.len() != self.param_names.len() {
            return Err(HarnessError::DimensionMismatch {
                expected: self.param_names.len(),
                actual: record.params.len(),
            });
        }
        self.records.push(record);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.elapsed_secs = None;
    }

    pub fn set_elapsed(&mut self, secs: f64) {
        self.elapsed_secs = Some(secs);
    }

    pub fn elapsed_secs(&self) -> Option<f64> {
        self.elapsed_secs
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TrialRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&TrialRecord> {
        self.records.last()
    }

    pub fn header(&self) -> Vec<String> {
        FIXED_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(self.param_names.iter().cloned())
            .collect()
    }

    /// Column-major view. Every column has `len()` cells; the run-level `time`
    /// value occupies the first row and the rest are `Null` padding.
    pub fn columns(&self) -> Vec<(String, Vec<Value>)> {
        let mut columns: Vec<(String, Vec<Value>)> = self
            .header()
            .into_iter()
            .map(|name| (name, Vec::with_capacity(self.records.len())))
            .collect();
        for (row, record) in self.records.iter().enumerate() {
            let time = match (row, self.elapsed_secs) {
                (0, Some(secs)) => json!(secs),
                _ => Value::Null,
            };
            let mut cells = vec![
                json!(record.trial_id),
                json!(record.min_ttc),
                json!(record.loss),
                time,
                json!(record.distance),
                json!(record.collision_status),
                json!(record.attempts),
                json!(record.collision_flag),
            ];
            cells.extend(record.params.iter().map(|v| json!(v)));
            for ((_, column), cell) in columns.iter_mut().zip(cells) {
                column.push(cell);
            }
        }
        columns
    }

    pub fn to_json(&self) -> Value {
        let mut values = Map::new();
        for (name, cells) in self.columns() {
            values.insert(name, Value::Array(cells));
        }
        json!({
            "column_order": self.header(),
            "rows": self.len(),
            "elapsed_secs": self.elapsed_secs,
            "columns": values,
        })
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, &self.to_json())
            .with_context(|| format!("writing trial log {}", path.display()))
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>> {
        let columns = self.columns();
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(self.header())?;
        for row in 0..self.len() {
            writer.write_record(columns.iter().map(|(_, cells)| cell_text(&cells[row])))?;
        }
        writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("csv flush failed: {}", e))
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let bytes = self.to_csv_bytes()?;
        atomic_write_bytes(path, &bytes)
            .with_context(|| format!("writing trial log {}", path.display()))
    }
}

fn cell_text(cell: &Value) -> String {
    match cell {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
