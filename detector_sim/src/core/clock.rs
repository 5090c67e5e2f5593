use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Milliseconds since the unix epoch.
#[derive(
  Clone,
  Copy,
  Debug,
  Default,
  Hash,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
)]
pub struct Timestamp(u64);
impl Timestamp {
  pub const fn from_millis(millis: u64) -> Self {
    Timestamp(millis)
  }

  pub const fn from_secs(secs: u64) -> Self {
    Timestamp(secs.saturating_mul(1000))
  }

  pub const fn as_millis(&self) -> u64 {
    self.0
  }

  /// Whole seconds, truncated. This is the precision of the gossip wire
  /// format.
  pub const fn as_secs(&self) -> u64 {
    self.0 / 1000
  }

  /// Zero when `earlier` is actually later.
  pub fn since(&self, earlier: Timestamp) -> Duration {
    Duration::from_millis(self.0.saturating_sub(earlier.0))
  }
}
impl Add<Duration> for Timestamp {
  type Output = Timestamp;

  fn add(self, rhs: Duration) -> Timestamp {
    Timestamp(self.0.saturating_add(dur2u64(&rhs)))
  }
}
impl fmt::Display for Timestamp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{:03}", self.0 / 1000, self.0 % 1000)
  }
}

/// Wall-clock-like time driven by tokio's time source.
///
/// The epoch offset is read once from the system clock; after that only the
/// tokio [`Instant`] advances the clock. On a paused runtime the clock is
/// frozen until tokio auto-advances it.
#[derive(Clone, Debug)]
pub struct Clock {
  origin: Instant,
  epoch: Timestamp,
}
impl Clock {
  pub fn new() -> Clock {
    let epoch = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| Timestamp(dur2u64(&d)))
      .unwrap_or_default();
    Clock {
      origin: Instant::now(),
      epoch: epoch,
    }
  }

  pub fn now(&self) -> Timestamp {
    self.epoch + self.origin.elapsed()
  }
}
impl Default for Clock {
  fn default() -> Self {
    Clock::new()
  }
}

pub(crate) fn dur2u64(dur: &Duration) -> u64 {
  dur.as_millis() as u64
}

#[test]
fn test_timestamp_arithmetic() {
  let t = Timestamp::from_millis(12_345);
  assert_eq!(t.as_secs(), 12);
  assert_eq!(Timestamp::from_secs(t.as_secs()).as_millis(), 12_000);
  assert_eq!(t + Duration::from_millis(655), Timestamp::from_secs(13));
  assert_eq!(t.since(Timestamp::from_secs(12)), Duration::from_millis(345));
  assert_eq!(Timestamp::from_secs(12).since(t), Duration::ZERO);
  assert_eq!(t.to_string(), "12.345");
}

#[tokio::test(start_paused = true)]
async fn test_clock_follows_tokio_time() {
  let clock = Clock::new();
  let start = clock.now();
  tokio::time::sleep(Duration::from_millis(1500)).await;
  assert_eq!(clock.now().since(start), Duration::from_millis(1500));
}
