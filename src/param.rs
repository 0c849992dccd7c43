use crate::variance::VarianceConfig;
use log::warn;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs::File;
use std::io::BufReader;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum GpuMemoryPolicy {
    Strict,
    Adaptive,
    Performance,
}

// Field definitions and associated default values

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Param {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub metric: VarianceConfig,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub gpu: GPU,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct General {
    #[serde(default = "one_default")]
    pub thread_number: usize,
    #[serde(default = "log_base_default")]
    pub log_base: String,
    #[serde(default = "log_suffix_default")]
    pub log_suffix: String,
    #[serde(default = "log_level_default")]
    pub log_level: String,
    #[serde(default = "false_default")]
    pub gpu: bool,
    #[serde(default = "save_report_default")]
    pub save_report: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Data {
    #[serde(default = "stacks_default")]
    pub stacks: Vec<String>,
    #[serde(default = "spatial_shape_default")]
    pub spatial_shape: Vec<usize>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GPU {
    #[serde(default = "memory_policy_default")]
    pub memory_policy: GpuMemoryPolicy,
    #[serde(default = "max_total_memory_mb_default")]
    pub max_total_memory_mb: u64,
    #[serde(default = "max_buffer_size_mb_default")]
    pub max_buffer_size_mb: u32,
    #[serde(default = "fallback_to_cpu_default")]
    pub fallback_to_cpu: bool,
}

// Default section definitions

impl Default for General {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Data {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for GPU {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap_or_else(|_| GPU {
            memory_policy: memory_policy_default(),
            max_total_memory_mb: max_total_memory_mb_default(),
            max_buffer_size_mb: max_buffer_size_mb_default(),
            fallback_to_cpu: fallback_to_cpu_default(),
        })
    }
}

impl Default for Param {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Param {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn get(param_file: String) -> Result<Param, Box<dyn Error>> {
    let param_file_reader = File::open(param_file)?;
    let param_reader = BufReader::new(param_file_reader);

    let mut config: Param = serde_yaml::from_reader(param_reader)?;

    validate(&mut config)?;

    Ok(config)
}

pub fn validate(param: &mut Param) -> Result<(), String> {
    if param.data.stacks.is_empty() {
        return Err(
            "No input stacks provided: data.stacks must list at least one file.".to_string(),
        );
    }

    if let Some(threshold) = param.metric.threshold {
        if threshold < 0.0 {
            return Err(format!(
                "Invalid metric.threshold={:.4}. Must be >= 0.",
                threshold
            ));
        }
    }

    if param.data.spatial_shape.iter().any(|&d| d == 0) {
        return Err(format!(
            "Invalid data.spatial_shape={:?}. Every dimension must be > 0.",
            param.data.spatial_shape
        ));
    }

    if param.general.gpu {
        warn!(
            "GPU acceleration enabled: computations use f32 precision for performance.\n  \
            CPU uses f64 precision. Minor numerical differences (order of 1e-7) are expected\n  \
            between CPU and GPU runs. For perfect reproducibility, use the same backend\n  \
            (CPU or GPU) across all runs."
        );
    }

    if !param.general.save_report.is_empty() {
        let known = ["json", "bin", "bincode"]
            .iter()
            .any(|ext| param.general.save_report.ends_with(&format!(".{}", ext)));
        if !known {
            warn!(
                "save_report={} has no recognised extension, the report will be saved as JSON.",
                param.general.save_report
            );
        }
    }

    Ok(())
}

// Default value definitions

fn empty_string() -> String {
    "".to_string()
}
fn log_base_default() -> String {
    empty_string()
}
fn log_suffix_default() -> String {
    "log".to_string()
}
fn log_level_default() -> String {
    "info".to_string()
}
fn save_report_default() -> String {
    empty_string()
}
fn stacks_default() -> Vec<String> {
    Vec::new()
}
fn spatial_shape_default() -> Vec<usize> {
    Vec::new()
}
fn memory_policy_default() -> GpuMemoryPolicy {
    GpuMemoryPolicy::Adaptive
}
fn max_total_memory_mb_default() -> u64 {
    256
}
fn max_buffer_size_mb_default() -> u32 {
    128
}
fn fallback_to_cpu_default() -> bool {
    true
}
fn false_default() -> bool {
    false
}
fn one_default() -> usize {
    1
}

// unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let param = Param::default();
        assert_eq!(param.general.thread_number, 1);
        assert_eq!(param.general.log_level, "info");
        assert!(!param.general.gpu);
        assert!(param.metric.include_background);
        assert!(!param.metric.spatial_map);
        assert!(param.metric.threshold.is_none());
        assert!(param.data.stacks.is_empty());
        assert_eq!(param.gpu.memory_policy, GpuMemoryPolicy::Adaptive);
        assert!(param.gpu.fallback_to_cpu);
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
general:
  thread_number: 4
metric:
  include_background: false
  spatial_map: true
  threshold: 0.001
data:
  stacks:
    - case_001.tsv
  spatial_shape: [8, 8]
"#;
        let mut param: Param = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(param.general.thread_number, 4);
        assert!(!param.metric.include_background);
        assert!(param.metric.spatial_map);
        assert_eq!(param.metric.threshold, Some(0.001));
        assert_eq!(param.data.stacks, vec!["case_001.tsv".to_string()]);
        assert_eq!(param.data.spatial_shape, vec![8, 8]);
        assert!(validate(&mut param).is_ok());
    }

    #[test]
    fn test_validate_rejects_negative_threshold() {
        let mut param = Param::default();
        param.data.stacks.push("case.tsv".to_string());
        param.metric.threshold = Some(-0.1);
        assert!(validate(&mut param).is_err());
    }

    #[test]
    fn test_validate_rejects_missing_stacks() {
        let mut param = Param::default();
        assert!(validate(&mut param).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_spatial_dim() {
        let mut param = Param::default();
        param.data.stacks.push("case.tsv".to_string());
        param.data.spatial_shape = vec![4, 0];
        assert!(validate(&mut param).is_err());
    }
}
