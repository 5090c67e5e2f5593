use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::core::dur2u64;

#[derive(
  Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize,
)]
pub struct NetworkStats {
  pub delivered: u64,
  /// Lost, partitioned away, or addressed to an unregistered node.
  pub dropped: u64,
  /// Sends that made it into the pending queue.
  pub scheduled: u64,
  pub total_delay_ms: u64,
  pub average_delay_ms: f64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
  delivered: AtomicU64,
  dropped: AtomicU64,
  scheduled: AtomicU64,
  total_delay_ms: AtomicU64,
}
impl StatsCounters {
  pub fn record_drop(&self) {
    self.dropped.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_scheduled(&self) {
    self.scheduled.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_delivery(&self, delay: Duration) {
    self.delivered.fetch_add(1, Ordering::Relaxed);
    self
      .total_delay_ms
      .fetch_add(dur2u64(&delay), Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> NetworkStats {
    let delivered = self.delivered.load(Ordering::Relaxed);
    let total_delay_ms = self.total_delay_ms.load(Ordering::Relaxed);
    NetworkStats {
      delivered: delivered,
      dropped: self.dropped.load(Ordering::Relaxed),
      scheduled: self.scheduled.load(Ordering::Relaxed),
      total_delay_ms: total_delay_ms,
      average_delay_ms: if delivered > 0 {
        total_delay_ms as f64 / delivered as f64
      } else {
        0.0
      },
    }
  }

  pub fn reset(&self) {
    self.delivered.store(0, Ordering::Relaxed);
    self.dropped.store(0, Ordering::Relaxed);
    self.scheduled.store(0, Ordering::Relaxed);
    self.total_delay_ms.store(0, Ordering::Relaxed);
  }
}

#[test]
fn test_concurrent_increments() {
  use std::sync::Arc;
  let stats = Arc::new(StatsCounters::default());
  let handles = (0..8)
    .map(|_| {
      let stats = stats.clone();
      std::thread::spawn(move || {
        for _ in 0..1000 {
          stats.record_delivery(Duration::from_millis(2));
          stats.record_drop();
        }
      })
    })
    .collect::<Vec<_>>();
  for h in handles {
    h.join().unwrap();
  }
  let snap = stats.snapshot();
  assert_eq!(snap.delivered, 8000);
  assert_eq!(snap.dropped, 8000);
  assert_eq!(snap.total_delay_ms, 16000);
  assert_eq!(snap.average_delay_ms, 2.0);
  stats.reset();
  assert_eq!(stats.snapshot(), NetworkStats::default());
}
