use rand::distributions::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;
use std::time::Duration;
use validator::Validate;

/// How unreliable the simulated network is.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct NetworkConfig {
  /// Probability in `[0, 1]` that a send is dropped outright.
  #[validate(range(min = 0.0, max = 1.0))]
  pub message_loss_rate: f64,
  pub delay_mean: Duration,
  /// Zero makes every delay exactly `delay_mean`.
  pub delay_std_dev: Duration,
  /// Seed for loss, delay and gossip peer selection. `None` seeds from
  /// entropy.
  pub seed: Option<u64>,
}
impl Default for NetworkConfig {
  fn default() -> Self {
    NetworkConfig {
      message_loss_rate: 0.01,
      delay_mean: Duration::from_millis(50),
      delay_std_dev: Duration::from_millis(10),
      seed: None,
    }
  }
}
impl NetworkConfig {
  /// No loss, no delay.
  pub fn reliable() -> Self {
    NetworkConfig {
      message_loss_rate: 0.0,
      delay_mean: Duration::ZERO,
      delay_std_dev: Duration::ZERO,
      seed: None,
    }
  }
}

/// Normal delays clipped at zero.
#[derive(Debug)]
pub(crate) enum DelayModel {
  Fixed(Duration),
  Normal(Normal),
}
impl DelayModel {
  pub fn new(config: &NetworkConfig) -> DelayModel {
    let mean = config.delay_mean.as_secs_f64() * 1000.0;
    let std_dev = config.delay_std_dev.as_secs_f64() * 1000.0;
    if std_dev <= 0.0 {
      return DelayModel::Fixed(config.delay_mean);
    }
    match Normal::new(mean, std_dev) {
      Ok(normal) => DelayModel::Normal(normal),
      Err(_) => DelayModel::Fixed(config.delay_mean),
    }
  }

  pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
    match self {
      DelayModel::Fixed(d) => *d,
      DelayModel::Normal(normal) => {
        let millis = normal.sample(rng).max(0.0);
        Duration::from_millis(millis.round() as u64)
      }
    }
  }
}

#[cfg(test)]
use rand::{rngs::SmallRng, SeedableRng};

#[test]
fn test_loss_rate_validation() {
  assert!(NetworkConfig::default().validate().is_ok());
  let mut cfg = NetworkConfig::reliable();
  cfg.message_loss_rate = 1.0;
  assert!(cfg.validate().is_ok());
  cfg.message_loss_rate = 1.5;
  assert!(cfg.validate().is_err());
  cfg.message_loss_rate = -0.1;
  assert!(cfg.validate().is_err());
}

#[test]
fn test_delay_sampling() {
  let mut rng = SmallRng::seed_from_u64(7);
  let fixed = DelayModel::new(&NetworkConfig::reliable());
  assert_eq!(fixed.sample(&mut rng), Duration::ZERO);

  let cfg = NetworkConfig::default();
  let model = DelayModel::new(&cfg);
  let samples = (0..2000).map(|_| model.sample(&mut rng)).collect::<Vec<_>>();
  let mean = samples.iter().map(|d| d.as_millis() as f64).sum::<f64>()
    / samples.len() as f64;
  assert!((mean - 50.0).abs() < 3.0, "mean was {}", mean);

  let mut wide = NetworkConfig::default();
  wide.delay_mean = Duration::from_millis(5);
  wide.delay_std_dev = Duration::from_millis(50);
  let model = DelayModel::new(&wide);
  // Clipped, never negative; many samples land on zero.
  let zeros = (0..1000)
    .filter(|_| model.sample(&mut rng) == Duration::ZERO)
    .count();
  assert!(zeros > 100);
}
