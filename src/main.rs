use ensvar::param;
use ensvar::run;

use flexi_logger::{FileSpec, Logger};
use log::{error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use std::env;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn main() {
    let args: Vec<String> = env::args().collect();
    let param_path = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| "param.yaml".to_string());

    let param = match param::get(param_path.clone()) {
        Ok(param) => param,
        Err(e) => {
            eprintln!("Could not load parameter file {}: {}", param_path, e);
            exit(1);
        }
    };

    let logger = Logger::try_with_env_or_str(&param.general.log_level).unwrap();
    let logger = if param.general.log_base.is_empty() {
        logger.start()
    } else {
        logger
            .log_to_file(
                FileSpec::default()
                    .basename(param.general.log_base.as_str())
                    .suffix(param.general.log_suffix.as_str()),
            )
            .start()
    };
    // the handle must outlive the run for the writers to flush
    let _logger_handle = match logger {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Logger initialization failed: {}", e);
            None
        }
    };

    info!("ensvar {}", ensvar::version());

    let running = Arc::new(AtomicBool::new(true));
    let mut signals = Signals::new([SIGINT, SIGTERM]).expect("Cannot register signal handlers");
    {
        let running = running.clone();
        thread::spawn(move || {
            for signal in signals.forever() {
                warn!(
                    "Signal {} received: finishing the current stack before stopping",
                    signal
                );
                running.store(false, Ordering::Relaxed);
            }
        });
    }

    match run(&param, running) {
        Ok(report) => {
            info!(
                "Processed {} stack(s) in {:.2}s",
                report.cases.len(),
                report.execution_time
            );
            if !param.general.save_report.is_empty() {
                if let Err(e) = report.save_auto(&param.general.save_report) {
                    error!("Failed to save report {}: {}", param.general.save_report, e);
                    exit(1);
                }
                info!("Report saved to {}", param.general.save_report);
            }
        }
        Err(e) => {
            error!("Run failed: {}", e);
            exit(1);
        }
    }
}
