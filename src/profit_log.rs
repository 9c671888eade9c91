//! Append-only realized-profit log
//!
//! One JSON line per realized close-side fill. Purely optional: the engine
//! keeps no persistent state, this exists so a run's harvest survives the
//! process.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ProfitRecord<'a> {
    ts: &'a str,
    price: Decimal,
    amount: Decimal,
    profit: Decimal,
}

/// Append-only profit sink
pub struct ProfitLog {
    file: File,
}

impl ProfitLog {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    /// Append one realized fill.
    pub fn record(&mut self, price: Decimal, amount: Decimal, profit: Decimal) -> std::io::Result<()> {
        let ts = chrono::Utc::now().to_rfc3339();
        let record = ProfitRecord {
            ts: &ts,
            price,
            amount,
            profit,
        };
        let mut line = serde_json::to_string(&record).map_err(std::io::Error::other)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_records_append_as_json_lines() {
        let dir = std::env::temp_dir().join(format!("profit_log_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("profit.jsonl");
        let _ = std::fs::remove_file(&path);

        let mut log = ProfitLog::open(&path).unwrap();
        log.record(dec!(3000.0), dec!(0.01), dec!(0.015)).unwrap();
        log.record(dec!(3001.5), dec!(0.01), dec!(0.015)).unwrap();
        drop(log);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let row: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(row["profit"], serde_json::json!("0.015"));

        let _ = std::fs::remove_file(&path);
    }
}
