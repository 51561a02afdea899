//! Logging setup

use std::fmt;
use std::fs::File;
use std::time::SystemTime as StdSystemTime;

use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{
    fmt::format::Writer, fmt::layer, fmt::time::FormatTime, layer::SubscriberExt, util::SubscriberInitExt,
    Layer, Registry,
};

/// Wall-clock time of day, seconds precision
struct SecondPrecisionTimer;

impl FormatTime for SecondPrecisionTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let total_seconds = StdSystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let hours = (total_seconds / 3600) % 24;
        let minutes = (total_seconds / 60) % 60;
        let seconds = total_seconds % 60;
        write!(w, "{:02}:{:02}:{:02}", hours, minutes, seconds)
    }
}

/// Send log records to `output_path`, or to stdout when none is given.
///
/// Falls back to stdout if the log file cannot be created. A second call is
/// a no-op.
pub fn setup_output(output_path: Option<&str>, verbose: bool) {
    let level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    if let Some(path) = output_path {
        match File::create(path) {
            Ok(log) => {
                let file_layer = layer()
                    .with_writer(log)
                    .with_timer(SecondPrecisionTimer)
                    .with_ansi(false)
                    .with_filter(level);
                if Registry::default().with(file_layer).try_init().is_ok() {
                    info!("Log written to: {}", path);
                }
                return;
            }
            Err(e) => eprintln!("Could not create log file {}: {}", path, e),
        }
    }
    let stdout_layer = layer()
        .with_writer(std::io::stdout)
        .with_timer(SecondPrecisionTimer)
        .with_ansi(true)
        .with_filter(level);
    let _ = Registry::default().with(stdout_layer).try_init();
}
