//! # ncsim-runner
//!
//! CLI runner for NCSim scenarios.

use clap::{Args, Parser, Subcommand, ValueEnum};
use ncsim_common::metric_defs;
use ncsim_control::{create_scheduler, SchedulerDevices, SchedulerKind};
use ncsim_model::{build_simulation, load_scenario};
use ncsim_packet::{MacAddress, ProtocolType};
use ncsim_runner::metrics_export::InMemoryRecorder;
use ncsim_runner::{EventLoop, RunnerError, SimTime, SimulationStats};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Duration Parsing
// ============================================================================

/// Parse a duration string with units into seconds.
///
/// Accepts a plain number of seconds (`60`), a single unit (`45s`, `250ms`,
/// `10m`, `2h`, `1d`) or a combination (`1h30m`, `2m30s500ms`).
fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        if secs < 0.0 {
            return Err(format!("Duration must not be negative: '{}'", s));
        }
        return Ok(secs);
    }

    let mut total_seconds = 0.0;
    let mut current_number = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            current_number.push(c);
            continue;
        }
        if current_number.is_empty() {
            return Err(format!("Invalid duration format: unexpected '{}' in '{}'", c, s));
        }
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;
        total_seconds += match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                value / 1000.0
            }
            's' => value,
            'm' => value * 60.0,
            'h' => value * 3600.0,
            'd' => value * 86400.0,
            _ => return Err(format!("Unknown duration unit '{}' in '{}'. Use ms, s, m, h, or d.", c, s)),
        };
        current_number.clear();
    }

    if !current_number.is_empty() {
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;
        total_seconds += value;
    }

    if s.is_empty() {
        return Err("Empty duration".to_string());
    }
    Ok(total_seconds)
}

fn parse_scheduler(s: &str) -> Result<SchedulerKind, String> {
    s.parse().map_err(|e: ncsim_control::SchedulerError| e.to_string())
}

// ============================================================================
// CLI Configuration
// ============================================================================

/// Medium access protocol, as named on the command line.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ProtocolArg {
    /// Time division.
    Tdma,
    /// Probabilistic access.
    Csma,
}

impl From<ProtocolArg> for ProtocolType {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Tdma => ProtocolType::Tdma,
            ProtocolArg::Csma => ProtocolType::Csma,
        }
    }
}

#[derive(Parser)]
#[command(name = "ncsim")]
#[command(author, version, about = "Wireless networked control system simulator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a scenario and print statistics as JSON.
    Run(RunConfig),
    /// Check a scenario and list its devices.
    Validate {
        /// Scenario YAML file.
        scenario: PathBuf,
    },
    /// Print schedules a scheduler produces for placeholder devices.
    Schedule(ScheduleConfig),
    /// List the metrics the simulator emits.
    Metrics,
}

#[derive(Args)]
pub struct RunConfig {
    /// Scenario YAML file.
    pub scenario: PathBuf,

    /// Simulated time, e.g. `10s`, `1h30m`, `250ms`. Defaults to the
    /// scenario's `duration_s`.
    #[arg(short, long, value_parser = parse_duration)]
    pub duration: Option<f64>,

    /// Seed overriding the scenario seed.
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Write the JSON trace of the run to this file.
    #[arg(short, long)]
    pub trace: Option<PathBuf>,

    /// Write the statistics to this file instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct ScheduleConfig {
    /// Scheduler kind, e.g. `round_robin`, `greedy_wait`.
    #[arg(short, long, value_parser = parse_scheduler, default_value = "round_robin")]
    pub kind: SchedulerKind,

    /// Protocol of the schedules.
    #[arg(short, long, value_enum, default_value = "tdma")]
    pub protocol: ProtocolArg,

    /// Number of sensors.
    #[arg(long, default_value = "2")]
    pub sensors: u64,

    /// Number of actuators.
    #[arg(long, default_value = "2")]
    pub actuators: u64,

    /// Slots per schedule.
    #[arg(long, default_value = "5")]
    pub timeslots: u32,

    /// Number of schedules to print.
    #[arg(short = 'n', long, default_value = "3")]
    pub count: usize,

    /// Seed of random schedulers.
    #[arg(long, default_value = "0")]
    pub seed: u64,
}

// ============================================================================
// Commands
// ============================================================================

fn run_simulation(config: &RunConfig) -> Result<SimulationStats, RunnerError> {
    let recorder = InMemoryRecorder::new();
    if let Err(e) = metrics::set_global_recorder(recorder.clone()) {
        warn!(error = %e, "failed to install metrics recorder");
    }

    let scenario = load_scenario(&config.scenario)?;
    let duration = config.duration.unwrap_or(scenario.duration_s);
    if !duration.is_finite() || duration <= 0.0 {
        return Err(RunnerError::ConfigError(format!("duration must be positive, got {}", duration)));
    }
    let simulation = build_simulation(&scenario, config.seed)?;
    info!(
        scenario = %config.scenario.display(),
        seed = simulation.seed,
        devices = simulation.devices.len(),
        entities = simulation.entities.len(),
        "built simulation"
    );

    let mut event_loop = EventLoop::new(simulation).with_metrics(recorder);
    if let Some(path) = &config.trace {
        let file = File::create(path)?;
        event_loop = event_loop.with_trace(Box::new(BufWriter::new(file)));
    }
    event_loop.run(SimTime::from_secs(duration))?;
    event_loop.finish()
}

fn write_stats(stats: &SimulationStats, output: Option<&Path>) -> Result<(), RunnerError> {
    let json = serde_json::to_string_pretty(stats)?;
    match output {
        Some(path) => {
            let mut file = File::create(path)?;
            writeln!(file, "{}", json)?;
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn validate_command(scenario: &Path) -> Result<(), RunnerError> {
    let model = load_scenario(scenario)?;
    let simulation = build_simulation(&model, None)?;
    println!(
        "{}: ok, {} devices, {} entities",
        scenario.display(),
        simulation.devices.len(),
        simulation.entities.len()
    );
    for device in &simulation.devices {
        println!("  {:<16} {:<18} {}", device.name, format!("{:?}", device.role), device.mac);
    }
    Ok(())
}

fn schedule_command(config: &ScheduleConfig) -> Result<(), RunnerError> {
    let devices = SchedulerDevices {
        sensors: (1..=config.sensors).map(MacAddress::from_counter).collect(),
        actuators: (1..=config.actuators)
            .map(|i| MacAddress::from_counter(config.sensors + i))
            .collect(),
    };
    let mut scheduler = create_scheduler(
        config.kind,
        config.protocol.into(),
        &devices,
        config.timeslots,
        config.seed,
    )?;
    let observation = vec![0.0; devices.all().len()];
    println!("{} ({})", scheduler.name(), scheduler.protocol());
    for i in 0..config.count {
        let schedule = scheduler.next_schedule(&observation, 0.0)?;
        println!(
            "{:>3}: {}  [{} slots, {} bytes]",
            i,
            schedule,
            schedule.end_time(),
            schedule.encoded_len(false)
        );
    }
    Ok(())
}

fn print_metrics_info() {
    println!("NCSim Metrics");
    println!("=============\n");
    for def in metric_defs::ALL {
        let labels = if def.labels.is_empty() {
            String::new()
        } else {
            format!(" [{}]", def.labels.join(", "))
        };
        println!("  {} ({}){}", def.name, def.kind, labels);
        println!("      {}", def.description);
    }
}

fn main() -> Result<(), RunnerError> {
    // RUST_LOG, default "warn"
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(config) => {
            let stats = run_simulation(&config)?;
            write_stats(&stats, config.output.as_deref())?;
        }
        Commands::Validate { scenario } => validate_command(&scenario)?,
        Commands::Schedule(config) => schedule_command(&config)?,
        Commands::Metrics => print_metrics_info(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_bare_seconds() {
        assert_eq!(parse_duration("60").unwrap(), 60.0);
        assert_eq!(parse_duration("0.5").unwrap(), 0.5);
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("45s").unwrap(), 45.0);
        assert_eq!(parse_duration("250ms").unwrap(), 0.25);
        assert_eq!(parse_duration("10m").unwrap(), 600.0);
        assert_eq!(parse_duration("2h").unwrap(), 7200.0);
        assert_eq!(parse_duration("1d").unwrap(), 86400.0);
    }

    #[test]
    fn test_parse_duration_combined() {
        assert_eq!(parse_duration("1h30m").unwrap(), 5400.0);
        assert_eq!(parse_duration("1m30s500ms").unwrap(), 90.5);
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("-3").is_err());
        assert!(parse_duration("2m 5").is_err());
    }

    #[test]
    fn test_parse_scheduler_accepts_dashes() {
        assert_eq!(parse_scheduler("round-robin").unwrap(), SchedulerKind::RoundRobin);
        assert!(parse_scheduler("fifo").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from(["ncsim", "run", "s.yaml", "--duration", "1m", "--seed", "4"]).unwrap();
        let Commands::Run(config) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(config.duration, Some(60.0));
        assert_eq!(config.seed, Some(4));
        assert!(config.trace.is_none());
    }
}
