//! End-to-end runs through the configuration layer and the coordinator,
//! checked against exactly known hard-sphere integrals.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use virial::config::Config;
use virial::coordinator::{RunOutcome, RunParams, WorkerCoordinator};
use virial::io::read_summary;

fn run(params: RunParams) -> RunOutcome {
    let coordinator = WorkerCoordinator::new(params).unwrap();
    let outcome = coordinator.run(&AtomicBool::new(false)).unwrap();
    coordinator.publish(&outcome).unwrap();
    outcome
}

fn params(yaml: &str) -> RunParams {
    let config = Config::from_yaml(yaml).unwrap();
    config.validate().unwrap();
    config.to_run_params().unwrap()
}

fn example_path(filename: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("example").join(filename)
}

const HS_OVERLAP: &str = r#"
points: 3
potential: { type: hard_sphere, sigma: 1.0 }
reference: { type: hard_sphere, sigma: 1.5 }
sampling:
  mode: overlap
  workers: 1
  seed: 2024
  block_size: 500
  equilibration_steps: 20
  production_steps: 100
  alpha_interval: 5
"#;

const HS_TREE_DIRECT: &str = r#"
points: 3
potential: { type: hard_sphere, sigma: 1.0 }
reference: { type: tree, sigma: 1.0 }
sampling:
  mode: direct
  workers: 1
  seed: 99
  block_size: 1000
  equilibration_steps: 0
  production_steps: 50
"#;

fn assert_within(value: f64, error: f64, exact: f64, sigmas: f64) {
    assert!(error.is_finite() && error > 0.0, "error estimate {error}");
    assert!(
        (value - exact).abs() < sigmas * error,
        "{value} ± {error} is not within {sigmas} errors of {exact}"
    );
}

#[test]
fn test_identical_reference_gives_unit_ratio() {
    let yaml = HS_OVERLAP.replace("reference: { type: hard_sphere, sigma: 1.5 }", "reference: { type: hard_sphere, sigma: 1.0 }");
    let outcome = run(params(&yaml));
    let order = &outcome.summary.orders[0];
    assert!((order.ratio - 1.0).abs() < 1e-10, "ratio {}", order.ratio);
}

#[test]
fn test_hard_sphere_diameter_scaling() {
    // B3 scales as σ⁶
    let exact = (1.0f64 / 1.5).powi(6);
    let outcome = run(params(HS_OVERLAP));
    let order = &outcome.summary.orders[0];
    assert_within(order.ratio, order.error, exact, 5.0);
    assert!(order.error / exact < 0.1);
    let w = &outcome.summary.workers[0];
    assert!(w.alpha > 0.0 && w.alpha.is_finite());
    assert!(w.fraction >= 0.01 && w.fraction <= 0.99);
}

fn umbrella(yaml: &str) -> String {
    yaml.replace("  mode: overlap\n", "  mode: overlap\n  weighting: umbrella\n")
}

#[test]
fn test_umbrella_weighting_end_to_end() {
    let exact = (1.0f64 / 1.5).powi(6);
    let outcome = run(params(&umbrella(HS_OVERLAP)));
    let order = &outcome.summary.orders[0];
    assert_within(order.ratio, order.error, exact, 5.0);
    assert!(order.error / exact < 0.1);
}

/// Every worker's own error bar, against the spread of its ratio around
/// the exact value.
fn assert_errors_calibrated(yaml: &str) {
    let exact = (1.0f64 / 1.5).powi(6);
    let yaml = yaml
        .replace("workers: 1", "workers: 8")
        .replace("production_steps: 100", "production_steps: 200");
    let outcome = run(params(&yaml));
    let workers = &outcome.summary.workers;
    assert_eq!(workers.len(), 8);
    let z2: f64 = workers
        .iter()
        .map(|w| {
            let r = w.ratios[0];
            assert!(r.error > 0.0 && r.error.is_finite(), "worker {} error {}", w.id, r.error);
            let z = (r.ratio - exact) / r.error;
            z * z
        })
        .sum();
    let rms = (z2 / workers.len() as f64).sqrt();
    assert!(rms > 0.3 && rms < 2.0, "rms deviation {rms} errors");
}

#[test]
fn test_worker_errors_calibrated() {
    assert_errors_calibrated(HS_OVERLAP);
}

#[test]
fn test_worker_errors_calibrated_with_umbrella() {
    assert_errors_calibrated(&umbrella(HS_OVERLAP));
}

#[test]
fn test_direct_sampling_from_tree_reference() {
    // Γ_HS / Γ_tree = -(15/8) b² / (4 b²)
    let outcome = run(params(HS_TREE_DIRECT));
    let order = &outcome.summary.orders[0];
    assert_within(order.ratio, order.error, -15.0 / 32.0, 5.0);
    assert_eq!(outcome.summary.samples, vec![50 * 1000]);
}

#[test]
fn test_worker_count_does_not_change_result() {
    let single = run(params(&HS_TREE_DIRECT.replace("production_steps: 50", "production_steps: 80")));
    let many = run(params(
        &HS_TREE_DIRECT.replace("workers: 1", "workers: 4").replace("production_steps: 50", "production_steps: 20"),
    ));
    assert_eq!(single.summary.samples, many.summary.samples);
    let (a, b) = (&single.summary.orders[0], &many.summary.orders[0]);
    let combined = (a.error * a.error + b.error * b.error).sqrt();
    assert!((a.ratio - b.ratio).abs() < 4.0 * combined, "{a:?} vs {b:?}");
}

#[test]
fn test_shared_reweighted_accumulator() {
    let yaml = format!(
        "{}bins: {{ shared: true, reweight_interval: 5, cost_ratio: 10.0 }}\n",
        HS_TREE_DIRECT.replace("workers: 1", "workers: 3")
    );
    let outcome = run(params(&yaml));
    let acc = &outcome.accumulators[0];
    assert_eq!(acc.total(), 3 * 50 * 1000);
    for (_, w) in acc.weights() {
        assert!((0.01..=1.0).contains(&w));
    }
    let order = &outcome.summary.orders[0];
    assert_within(order.ratio, order.error, -15.0 / 32.0, 5.0);
}

#[test]
fn test_restart_adds_saved_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let raw = dir.path().join("raw.dat");
    let weights = dir.path().join("weights.dat");
    let summary = dir.path().join("summary.json");

    let mut first = params(HS_OVERLAP);
    first.raw_output = Some(raw.clone());
    first.weights_output = Some(weights.clone());
    let outcome = run(first);
    // two boxes, two files each
    for b in 0..2 {
        assert!(dir.path().join(format!("raw_box{b}.dat")).exists());
        assert!(dir.path().join(format!("weights_box{b}.dat")).exists());
    }

    let mut second = params(HS_OVERLAP);
    second.seed += 1;
    second.restart_raw = Some(raw);
    second.restart_weights = Some(weights);
    second.summary_output = Some(summary.clone());
    let coordinator = WorkerCoordinator::new(second).unwrap();
    let resumed = coordinator.run(&AtomicBool::new(false)).unwrap();
    let total = |o: &RunOutcome| o.summary.samples.iter().sum::<u64>();
    assert_eq!(total(&resumed), 2 * total(&outcome));

    virial::io::write_summary(&summary, &resumed.summary).unwrap();
    let reread = read_summary(&summary).unwrap();
    assert_eq!(reread.orders.len(), 1);
    assert_eq!(reread.samples, resumed.summary.samples);
}

#[test]
fn test_example_configurations_parse() {
    for name in ["lj_b3.yaml", "hs_b5_tree.yaml", "sw_b4_split.yaml"] {
        let text = std::fs::read_to_string(example_path(name)).unwrap();
        let config = Config::from_yaml(&text).unwrap();
        config.validate().unwrap();
    }
}

#[test]
fn test_lennard_jones_b3_regression() {
    let text = std::fs::read_to_string(example_path("lj_b3.yaml")).unwrap();
    let mut p = Config::from_yaml(&text).unwrap().to_run_params().unwrap();
    p.summary_output = None;
    p.settings.production_steps = 400;
    let outcome = run(p);
    let order = &outcome.summary.orders[0];
    assert_within(order.ratio, order.error, 0.06035, 5.0);
    let alpha = outcome.summary.workers[0].alpha;
    assert!((alpha - 1.34).abs() < 0.08, "alpha {alpha}");
    assert!((order.ratio - 0.0604).abs() < 0.007, "ratio {}", order.ratio);
}
