use crate::error::VarianceError;
use crate::tensor::Tensor;
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;

/// A stacked ensemble of predictions for one case, loaded from a TSV
/// "stack file".
///
/// Stack file format: one row per (member, channel) pair, tab-separated:
/// `member <TAB> channel <TAB> v0 <TAB> v1 <TAB> ...`
/// Lines starting with `#` are ignored. Every member x channel pair must
/// appear exactly once and every row must carry the same number of
/// values (the flat spatial axis).
#[derive(Clone, Serialize, Deserialize)]
pub struct PredictionStack {
    pub values: Vec<f64>, // member-major, then channel, then location
    pub members: usize,
    pub channels: usize,
    pub spatial_shape: Vec<usize>,
    pub case_id: String,
    pub source: String,
    pub checksum: String, // sha256 of the raw stack file
}

impl PredictionStack {
    /// Create a new `PredictionStack` instance with default values
    pub fn new() -> PredictionStack {
        PredictionStack {
            values: Vec::new(),
            members: 0,
            channels: 0,
            spatial_shape: Vec::new(),
            case_id: String::new(),
            source: String::new(),
            checksum: String::new(),
        }
    }

    /// Load a stack file, replacing any previously held content.
    pub fn load_stack(&mut self, path: &str) -> Result<(), Box<dyn Error>> {
        info!("Loading stack file {}...", path);
        let bytes = fs::read(path)?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let checksum = format!("{:x}", hasher.finalize());

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .comment(Some(b'#'))
            .from_reader(bytes.as_slice());

        let mut rows: Vec<(usize, usize, Vec<f64>)> = Vec::new();
        let mut seen: HashSet<(usize, usize)> = HashSet::new();
        let mut width: Option<usize> = None;

        for (line, record) in reader.records().enumerate() {
            let record = record?;
            if record.len() < 3 {
                return Err(format!(
                    "{}: row {} has {} fields, expected member, channel and at least one value",
                    path,
                    line,
                    record.len()
                )
                .into());
            }
            let member: usize = record[0].trim().parse()?;
            let channel: usize = record[1].trim().parse()?;
            let values = record
                .iter()
                .skip(2)
                .map(|field| field.trim().parse::<f64>())
                .collect::<Result<Vec<f64>, _>>()?;

            match width {
                None => width = Some(values.len()),
                Some(w) if w != values.len() => {
                    return Err(format!(
                        "{}: row {} has {} values where previous rows had {}",
                        path,
                        line,
                        values.len(),
                        w
                    )
                    .into());
                }
                _ => {}
            }
            if !seen.insert((member, channel)) {
                return Err(format!(
                    "{}: duplicate row for member {} channel {}",
                    path, member, channel
                )
                .into());
            }
            rows.push((member, channel, values));
        }

        if rows.is_empty() {
            return Err(format!("{}: stack file contains no rows", path).into());
        }

        let members = rows.iter().map(|(m, _, _)| m + 1).max().unwrap();
        let channels = rows.iter().map(|(_, c, _)| c + 1).max().unwrap();
        let spatial = width.unwrap();
        if rows.len() != members * channels {
            return Err(format!(
                "{}: incomplete stack, found {} rows for {} members x {} channels",
                path,
                rows.len(),
                members,
                channels
            )
            .into());
        }

        let mut values = vec![0.0; members * channels * spatial];
        for (member, channel, row) in rows {
            let start = (member * channels + channel) * spatial;
            values[start..start + spatial].copy_from_slice(&row);
        }

        self.values = values;
        self.members = members;
        self.channels = channels;
        self.spatial_shape = vec![spatial];
        self.case_id = Path::new(path)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string());
        self.source = path.to_string();
        self.checksum = checksum;

        info!("{}", self);
        Ok(())
    }

    /// Reinterpret the flat spatial axis as the given dimensions.
    pub fn reshape_spatial(&mut self, dims: &[usize]) -> Result<(), VarianceError> {
        let actual: usize = self.spatial_shape.iter().product();
        let requested: usize = dims.iter().product();
        if requested != actual {
            return Err(VarianceError::SpatialMismatch {
                requested: dims.to_vec(),
                actual,
            });
        }
        self.spatial_shape = dims.to_vec();
        Ok(())
    }

    /// View the stack as a (members, channels, spatial...) tensor.
    pub fn to_tensor(&self) -> Result<Tensor, VarianceError> {
        let mut shape = vec![self.members, self.channels];
        shape.extend_from_slice(&self.spatial_shape);
        Tensor::new(self.values.clone(), shape)
    }
}

impl fmt::Display for PredictionStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PredictionStack \"{}\": {} members x {} channels x {:?} locations [sha256 {}]",
            self.case_id,
            self.members,
            self.channels,
            self.spatial_shape,
            &self.checksum[..self.checksum.len().min(12)]
        )
    }
}

impl fmt::Debug for PredictionStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Reuse the Display formatter
        write!(f, "{}", self)
    }
}
