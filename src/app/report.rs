use std::fmt::Write as _;

use tracing::{info, warn};

use crate::coordinator::RunSummary;

/// Plain-text result table, one line per diagram order.
pub fn format_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "N = {}  T = {}  reference integral = {:.10e}",
        summary.n_points, summary.temperature, summary.reference_integral
    );
    let _ = writeln!(
        out,
        "{:>5} {:>16} {:>12} {:>16} {:>12}",
        "order", "ratio", "error", "B_N", "error"
    );
    for o in &summary.orders {
        let _ = writeln!(
            out,
            "{:>5} {:>16.8e} {:>12.4e} {:>16.8e} {:>12.4e}",
            o.order, o.ratio, o.error, o.coefficient, o.coefficient_error
        );
    }
    out
}

/// Log worker diagnostics and print the result table to stdout.
pub fn report_summary(summary: &RunSummary) {
    info!("\nRun finished.");
    for w in &summary.workers {
        info!(
            "  worker {:>2}: {} macro-steps ({} production), alpha = {:.6}, box-0 fraction = {:.3}",
            w.id, w.macro_steps, w.production_steps, w.alpha, w.fraction
        );
        for m in &w.moves {
            info!(
                "    box {} {:<14} acceptance {:.3}  step {}",
                m.box_index,
                m.name,
                m.acceptance,
                m.step.map_or_else(|| "-".to_string(), |s| format!("{s:.4}"))
            );
        }
        if w.resets > 0 || w.sanitized > 0 {
            warn!(
                "  worker {}: {} seed resets, {} non-finite values zeroed",
                w.id, w.resets, w.sanitized
            );
        }
    }
    if !summary.failed_workers.is_empty() {
        warn!("Workers terminated early: {:?}", summary.failed_workers);
    }
    for (b, (n, bins)) in summary.samples.iter().zip(&summary.bins).enumerate() {
        info!("  box {}: {} samples in {} bins", b, n, bins);
    }
    print!("{}", format_summary(summary));
}
