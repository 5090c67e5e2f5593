//! Scenario driving and scoring.

mod accuracy;
mod simulator;

#[rustfmt::skip]
pub use {
  accuracy::calculate_accuracy,
  accuracy::Score,
  simulator::Protocol,
  simulator::Simulator,
  simulator::SimulatorConfig,
  simulator::TestResult,
};
