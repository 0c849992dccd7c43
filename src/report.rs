use crate::param::Param;
use crate::tensor::Tensor;
use log::warn;
use serde::{Deserialize, Serialize};

/// Result of the variance metric for one prediction stack.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CaseResult {
    pub case_id: String,
    pub source: String,
    pub checksum: String,
    pub members: usize,
    pub channels: usize,
    pub spatial_shape: Vec<usize>,
    /// One summary variance per retained class.
    pub class_variance: Vec<f64>,
    /// Full per-location map, present when metric.spatial_map is set.
    pub variance_map: Option<Tensor>,
}

/// A complete pipeline run: which inputs were processed, with which
/// parameters and software version, and what came out.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Report {
    pub id: String,
    pub ensvar_version: String,
    pub timestamp: String,
    pub parameters: Param,
    pub cases: Vec<CaseResult>,
    pub execution_time: f64,
}

impl Report {
    /// Saves the report in a suitable format based on file extension.
    pub fn save_auto<P: AsRef<std::path::Path>>(
        &self,
        path: P,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        match ext.as_str() {
            "json" => self.save_json(path),
            "bin" | "bincode" => self.save_bincode(path),
            _ => {
                warn!("Unknown format. Saving report as JSON.");
                let json_path = path.with_extension("json");
                self.save_json(json_path)
            }
        }
    }

    /// Saves to JSON (human readable, but may have slight inaccuracies for decimal values)
    fn save_json<P: AsRef<std::path::Path>>(
        &self,
        path: P,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Saves as Bincode (compact binary, Rust-only)
    fn save_bincode<P: AsRef<std::path::Path>>(
        &self,
        path: P,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let encoded = bincode::serialize(self)?;
        std::fs::write(path, encoded)?;
        Ok(())
    }

    /// Loads a report, automatically detecting the format based on file extension.
    pub fn load_auto<P: AsRef<std::path::Path>>(
        path: P,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        match ext.as_str() {
            "json" => Self::load_json(path),
            "bin" | "bincode" => Self::load_bincode(path),
            _ => {
                if let Ok(report) = Self::load_bincode(path) {
                    return Ok(report);
                }
                Self::load_json(path)
            }
        }
    }

    /// Loads from JSON format
    fn load_json<P: AsRef<std::path::Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let report: Report = serde_json::from_str(&content)?;
        Ok(report)
    }

    /// Loads from Bincode format
    fn load_bincode<P: AsRef<std::path::Path>>(
        path: P,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let bytes = std::fs::read(path)?;
        let report: Report = bincode::deserialize(&bytes)?;
        Ok(report)
    }
}

// unit tests
#[cfg(test)]
mod tests {
    use super::*;

    fn test_report() -> Report {
        Report {
            id: "unit_test_report".to_string(),
            ensvar_version: "0.0.0#test".to_string(),
            timestamp: "2026-01-01_00-00-00".to_string(),
            parameters: Param::default(),
            cases: vec![CaseResult {
                case_id: "case_a".to_string(),
                source: "case_a.tsv".to_string(),
                checksum: "deadbeef".to_string(),
                members: 4,
                channels: 2,
                spatial_shape: vec![3],
                class_variance: vec![0.25, 0.0],
                variance_map: Some(Tensor::from_elem(0.25, vec![2, 3])),
            }],
            execution_time: 0.1,
        }
    }

    #[test]
    fn test_serialization_json_roundtrip() {
        let original = test_report();
        let path = std::env::temp_dir().join("ensvar_report_roundtrip.json");
        original.save_auto(&path).unwrap();
        let loaded = Report::load_auto(&path).unwrap();
        assert_eq!(original, loaded);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_serialization_bincode_roundtrip() {
        let original = test_report();
        let path = std::env::temp_dir().join("ensvar_report_roundtrip.bin");
        original.save_auto(&path).unwrap();
        let loaded = Report::load_auto(&path).unwrap();
        assert_eq!(original, loaded);
        std::fs::remove_file(&path).unwrap();
    }
}
