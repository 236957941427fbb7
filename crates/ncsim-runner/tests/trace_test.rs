//! Runs the `ncsim` binary on small scenarios and checks the JSON it writes.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

#[derive(Debug, Deserialize, Clone)]
struct TraceEntry {
    origin: String,
    time_us: u64,
    timestamp: String,
    kind: String,
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default)]
    actuator: Option<String>,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    ber: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Stats {
    seed: u64,
    total_events: u64,
    transmissions: u64,
    schedules_sent: u64,
    controls_applied: u64,
    payloads_received: u64,
    halted_entities: Vec<serde_json::Value>,
    simulation_time_us: u64,
    metrics: serde_json::Value,
}

const TDMA_SCENARIO: &str = r#"
kind: ncs
seed: 9
ncs:
  protocol: tdma
  scheduler: round_robin
  timeslots: 5
  loops:
    - sensor: { name: s1, x: 2.0, y: 1.0, source: { constant: 2.0 } }
      actuator: { name: a1, x: 2.0, y: -1.0 }
      gain: 0.5
    - sensor: { name: s2, x: -2.0, y: 1.0, source: { random_walk: { initial: 1.0, std_dev: 0.1 } } }
      actuator: { name: a2, x: -2.0, y: -1.0 }
"#;

const CONTENTION_FREE_SCENARIO: &str = r#"
kind: contention_free
contention_free:
  assign_slots: 50000
  devices:
    - name: d1
      x: 1.0
      traffic: { dest: d2, interval_s: 0.1, bytes: 20 }
    - name: d2
      x: 2.0
"#;

/// Run `ncsim run` on `yaml` and return the parsed trace and statistics.
fn run_and_collect(yaml: &str, seed: u64, duration: &str) -> (Vec<TraceEntry>, Stats) {
    // CARGO_BIN_EXE_ncsim is set by cargo when running tests for this crate
    let binary = env!("CARGO_BIN_EXE_ncsim");
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let scenario = temp_dir.path().join("scenario.yaml");
    fs::write(&scenario, yaml).expect("Failed to write scenario");
    let trace_path = temp_dir.path().join("trace.json");
    let stats_path = temp_dir.path().join("stats.json");

    let output = Command::new(binary)
        .arg("run")
        .arg(&scenario)
        .arg("--seed")
        .arg(seed.to_string())
        .arg("--duration")
        .arg(duration)
        .arg("--trace")
        .arg(&trace_path)
        .arg("--output")
        .arg(&stats_path)
        .output()
        .expect("Failed to execute ncsim");
    if !output.status.success() {
        panic!(
            "Simulation failed:\nstdout: {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    (read_json(&trace_path), read_json(&stats_path))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> T {
    let text = fs::read_to_string(path).expect("Failed to read output file");
    serde_json::from_str(&text).expect("Failed to parse JSON output")
}

#[test]
fn test_tdma_trace_contains_schedules_and_controls() {
    let (trace, stats) = run_and_collect(TDMA_SCENARIO, 42, "1s");

    assert_eq!(stats.seed, 42);
    assert_eq!(stats.simulation_time_us, 1_000_000);
    assert!(stats.total_events > 0);
    assert!(stats.halted_entities.is_empty());

    let schedules: Vec<&TraceEntry> = trace.iter().filter(|e| e.kind == "schedule_sent").collect();
    assert_eq!(schedules.len() as u64, stats.schedules_sent);
    assert!(schedules.iter().all(|e| e.origin == "gateway"));
    assert!(schedules.iter().all(|e| e.schedule.as_deref().is_some_and(|s| !s.is_empty())));

    let applied: Vec<&TraceEntry> = trace.iter().filter(|e| e.kind == "control_applied").collect();
    assert_eq!(applied.len() as u64, stats.controls_applied);
    assert!(applied
        .iter()
        .any(|e| e.actuator.as_deref() == Some("a1") && e.value == Some(-1.0)));

    let transmissions = trace.iter().filter(|e| e.kind == "transmission_started").count();
    assert_eq!(transmissions as u64, stats.transmissions);
    assert!(trace
        .iter()
        .filter(|e| e.kind == "frame_delivered")
        .all(|e| e.ber.is_some_and(|ber| (0.0..=0.5).contains(&ber))));

    assert!(trace.windows(2).all(|w| w[0].time_us <= w[1].time_us));
    assert!(trace.iter().all(|e| e.timestamp.ends_with('s')));
    assert!(stats.metrics["counters"]["ncsim.phy.tx_frames"].as_u64().unwrap() > 0);
}

#[test]
fn test_same_seed_same_trace() {
    let (first, _) = run_and_collect(TDMA_SCENARIO, 7, "500ms");
    let (second, _) = run_and_collect(TDMA_SCENARIO, 7, "500ms");
    let key = |t: &[TraceEntry]| -> Vec<(String, u64, String)> {
        t.iter()
            .map(|e| (e.kind.clone(), e.time_us, e.origin.clone()))
            .collect()
    };
    assert!(!first.is_empty());
    assert_eq!(key(&first), key(&second));
}

#[test]
fn test_contention_free_delivers_traffic() {
    let (trace, stats) = run_and_collect(CONTENTION_FREE_SCENARIO, 1, "300ms");
    assert!(stats.payloads_received > 0);
    assert!(trace
        .iter()
        .any(|e| e.kind == "payload_received" && e.origin == "d2"));
    assert!(trace
        .iter()
        .any(|e| e.kind == "slots_assigned" && e.origin == "d1"));
}

#[test]
fn test_validate_rejects_unknown_fields() {
    let binary = env!("CARGO_BIN_EXE_ncsim");
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let scenario = temp_dir.path().join("bad.yaml");
    fs::write(&scenario, "kind: ncs\nspeed: 3\n").expect("Failed to write scenario");

    let output = Command::new(binary)
        .arg("validate")
        .arg(&scenario)
        .output()
        .expect("Failed to execute ncsim");
    assert!(!output.status.success());
}

#[test]
fn test_schedule_command_prints_round_robin() {
    let binary = env!("CARGO_BIN_EXE_ncsim");
    let output = Command::new(binary)
        .args(["schedule", "--kind", "round_robin", "--sensors", "1", "--actuators", "1", "-n", "2"])
        .output()
        .expect("Failed to execute ncsim");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 3);
}
