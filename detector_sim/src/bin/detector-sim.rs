//! Runs every failure scenario under both detectors and prints a comparison.
//!
//! ```bash
//! detector-sim --sizes 5,10,20 --loss-rate 0.01 --delay-ms 50 --seed 7
//! RUST_LOG=detector_sim=debug detector-sim --sizes 5
//! ```

use clap::Parser;
use detector_sim::core::SimError;
use detector_sim::harness::{Protocol, Simulator, SimulatorConfig, TestResult};
use itertools::Itertools;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "detector-sim")]
#[command(version, about, long_about = None)]
struct Args {
  /// Network sizes to run, comma separated
  #[arg(short = 'n', long, value_delimiter = ',', default_value = "5,10,20")]
  sizes: Vec<usize>,

  /// Probability that any single message is lost (0.0-1.0)
  #[arg(long, default_value = "0.01")]
  loss_rate: f64,

  /// Mean one-way delay in milliseconds
  #[arg(long, default_value = "50")]
  delay_ms: u64,

  /// Standard deviation of the delay in milliseconds
  #[arg(long, default_value = "10")]
  jitter_ms: u64,

  /// Seed for loss, delay and workload randomness
  #[arg(long)]
  seed: Option<u64>,
}

fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,detector_sim=info")),
    )
    .init();

  let args = Args::parse();
  let mut config = SimulatorConfig::default();
  config.network.message_loss_rate = args.loss_rate;
  config.network.delay_mean = Duration::from_millis(args.delay_ms);
  config.network.delay_std_dev = Duration::from_millis(args.jitter_ms);
  config.network.seed = args.seed;

  let rt = match tokio::runtime::Builder::new_multi_thread()
    .enable_time()
    .build()
  {
    Ok(rt) => rt,
    Err(e) => {
      error!(error = %e, "could not build the runtime");
      return ExitCode::FAILURE;
    }
  };
  match rt.block_on(run(config, &args.sizes)) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      error!(error = %e, "simulation failed");
      ExitCode::FAILURE
    }
  }
}

async fn run(config: SimulatorConfig, sizes: &[usize]) -> Result<(), SimError> {
  let mut sim = Simulator::new(config)?;
  info!(?sizes, "starting comparison");
  for (n, results) in sim.run_all_tests(sizes).await? {
    print_table(n, &results);
  }
  Ok(())
}

fn print_table(n: usize, results: &[TestResult]) {
  println!();
  println!("=== {} nodes ===", n);
  println!(
    "{:<34} {:>12} {:>6} {:>6} {:>10} {:>9} {:>5}",
    "test", "detect (ms)", "fp", "fn", "messages", "accuracy", "done"
  );
  for r in results {
    println!(
      "{:<34} {:>12.1} {:>6} {:>6} {:>10} {:>8.1}% {:>5}",
      r.test_name,
      r.detection_time_ms,
      r.false_positives,
      r.false_negatives,
      r.messages_sent,
      r.accuracy * 100.0,
      if r.converged { "yes" } else { "no" }
    );
  }
  for protocol in Protocol::ALL {
    let mine = results
      .iter()
      .filter(|r| r.protocol == Some(protocol))
      .collect_vec();
    if mine.is_empty() {
      continue;
    }
    let count = mine.len() as f64;
    println!(
      "{:<10} mean detect {:>8.1} ms, mean accuracy {:>5.1}%, {} messages",
      protocol.to_string(),
      mine.iter().map(|r| r.detection_time_ms).sum::<f64>() / count,
      mine.iter().map(|r| r.accuracy).sum::<f64>() / count * 100.0,
      mine.iter().map(|r| r.messages_sent).sum::<u64>()
    );
  }
}
