pub mod data;
pub mod error;
pub mod gpu;
pub mod param;
pub mod report;
pub mod tensor;
pub mod variance;

use crate::data::PredictionStack;
use crate::gpu::GpuVariance;
use crate::param::Param;
use crate::report::{CaseResult, Report};
use crate::variance::VarianceMetric;

use chrono::Local;
use log::{info, warn};
use rayon::ThreadPoolBuilder;

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Version string embedded in reports and logs: crate version plus the
/// short git SHA captured at build time.
pub fn version() -> String {
    format!(
        "{}#{}",
        env!("CARGO_PKG_VERSION"),
        option_env!("ENSVAR_GIT_SHA").unwrap_or("unknown")
    )
}

/// Process every configured prediction stack and assemble the report.
///
/// `running` is checked between stacks: clearing it (e.g. from a signal
/// handler) stops the loop after the current case, and the report covers
/// the cases processed so far.
pub fn run(param: &Param, running: Arc<AtomicBool>) -> Result<Report, Box<dyn Error>> {
    let start = std::time::Instant::now();
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();

    if param.general.thread_number > 1 {
        if let Err(e) = ThreadPoolBuilder::new()
            .num_threads(param.general.thread_number)
            .build_global()
        {
            warn!("Could not size the thread pool ({}), keeping current one", e);
        }
    }

    let metric = VarianceMetric::from_config(&param.metric);
    let assay = if param.general.gpu {
        let assay = GpuVariance::new(&param.gpu);
        assay.log_memory_status();
        Some(assay)
    } else {
        None
    };

    let mut cases: Vec<CaseResult> = Vec::new();
    for path in &param.data.stacks {
        if !running.load(Ordering::Relaxed) {
            warn!(
                "Interrupt received: stopping after {} of {} stacks",
                cases.len(),
                param.data.stacks.len()
            );
            break;
        }

        let mut stack = PredictionStack::new();
        stack.load_stack(path)?;
        if !param.data.spatial_shape.is_empty() {
            stack.reshape_spatial(&param.data.spatial_shape)?;
        }

        let y_pred = stack.to_tensor()?;
        let result = match assay {
            Some(ref assay) => metric.compute_with_gpu(&y_pred, assay)?,
            None => metric.compute(&y_pred)?,
        };

        // the scalar summary is always reported; the map only on request
        let summary = if param.metric.spatial_map {
            result.leading_axis_means()
        } else {
            result.clone()
        };
        info!(
            "{}: per-class variance {:?}",
            stack.case_id,
            summary.values()
        );

        cases.push(CaseResult {
            case_id: stack.case_id.clone(),
            source: stack.source.clone(),
            checksum: stack.checksum.clone(),
            members: stack.members,
            channels: stack.channels,
            spatial_shape: stack.spatial_shape.clone(),
            class_variance: summary.values().to_vec(),
            variance_map: if param.metric.spatial_map {
                Some(result)
            } else {
                None
            },
        });
    }

    let stem = if param.general.save_report.is_empty() {
        "ensvar"
    } else {
        param
            .general
            .save_report
            .split('.')
            .next()
            .unwrap_or("ensvar")
    };

    Ok(Report {
        id: format!("{}_{}", stem, timestamp),
        ensvar_version: version(),
        timestamp,
        parameters: param.clone(),
        cases,
        execution_time: start.elapsed().as_secs_f64(),
    })
}
