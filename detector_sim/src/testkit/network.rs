use crate::core::{Clock, Node, NodeId, SimError, Timestamp};
use crate::testkit::{
  DelayModel, NetworkConfig, NetworkStats, PartitionMap, StatsCounters,
};
use im::OrdMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{self, AtomicU64};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use validator::Validate;

struct Pending {
  delivery_time: Timestamp,
  seq: u64,
  from: NodeId,
  to: NodeId,
  content: String,
  delay: Duration,
}
impl PartialEq for Pending {
  fn eq(&self, other: &Self) -> bool {
    self.cmp(other) == Ordering::Equal
  }
}
impl Eq for Pending {}
impl PartialOrd for Pending {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}
impl Ord for Pending {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .delivery_time
      .cmp(&other.delivery_time)
      .then(self.seq.cmp(&other.seq))
  }
}

/// The in-process, unreliable transport every node talks through.
///
/// [`send`](Network::send) never delivers anything itself. It either drops
/// the message or schedules it at `now + delay`; whoever drives the
/// simulation calls [`process_messages`](Network::process_messages) to hand
/// due messages to their receivers.
pub struct Network {
  config: NetworkConfig,
  delay: DelayModel,
  clock: Clock,
  nodes: RwLock<OrdMap<NodeId, Arc<dyn Node>>>,
  pending: Mutex<BinaryHeap<Reverse<Pending>>>,
  partition: Mutex<Option<PartitionMap>>,
  rng: Mutex<SmallRng>,
  seq: AtomicU64,
  stats: StatsCounters,
}
impl Network {
  pub fn new(config: NetworkConfig) -> Result<Arc<Network>, SimError> {
    config.validate()?;
    let rng = match config.seed {
      Some(seed) => SmallRng::seed_from_u64(seed),
      None => SmallRng::from_entropy(),
    };
    Ok(Arc::new(Network {
      delay: DelayModel::new(&config),
      config: config,
      clock: Clock::new(),
      nodes: RwLock::new(OrdMap::new()),
      pending: Mutex::new(BinaryHeap::new()),
      partition: Mutex::new(None),
      rng: Mutex::new(rng),
      seq: AtomicU64::new(0),
      stats: StatsCounters::default(),
    }))
  }

  pub fn config(&self) -> &NetworkConfig {
    &self.config
  }

  pub fn clock(&self) -> &Clock {
    &self.clock
  }

  pub fn add_node(&self, id: impl Into<NodeId>, node: Arc<dyn Node>) {
    self.nodes.write().insert(id.into(), node);
  }

  /// Messages already in flight to `id` are dropped when they come due.
  pub fn remove_node(&self, id: &str) -> Option<Arc<dyn Node>> {
    self.nodes.write().remove(id)
  }

  pub fn get_node(&self, id: &str) -> Option<Arc<dyn Node>> {
    self.nodes.read().get(id).cloned()
  }

  /// A snapshot of the registry, ordered by id.
  pub fn nodes(&self) -> OrdMap<NodeId, Arc<dyn Node>> {
    self.nodes.read().clone()
  }

  pub fn node_ids(&self) -> Vec<NodeId> {
    self.nodes.read().keys().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.nodes.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.read().is_empty()
  }

  /// Empties the registry and returns what was in it.
  pub fn clear(&self) -> OrdMap<NodeId, Arc<dyn Node>> {
    std::mem::take(&mut *self.nodes.write())
  }

  pub fn simulate_node_failure(&self, id: &str) -> bool {
    self.get_node(id).map(|n| n.set_alive(false)).is_some()
  }

  pub fn simulate_node_recovery(&self, id: &str) -> bool {
    self.get_node(id).map(|n| n.set_alive(true)).is_some()
  }

  pub fn send(&self, from: &str, to: &str, content: String) {
    let now = self.clock.now();
    if !self.reachable(from, to, now) {
      trace!(from, to, "partitioned, dropping");
      self.stats.record_drop();
      return;
    }
    let delay = {
      let mut rng = self.rng.lock();
      if rng.gen::<f64>() < self.config.message_loss_rate {
        None
      } else {
        Some(self.delay.sample(&mut *rng))
      }
    };
    let delay = match delay {
      Some(delay) => delay,
      None => {
        trace!(from, to, "lost");
        self.stats.record_drop();
        return;
      }
    };
    let entry = Pending {
      delivery_time: now + delay,
      seq: self.seq.fetch_add(1, atomic::Ordering::Relaxed),
      from: from.to_string(),
      to: to.to_string(),
      content: content,
      delay: delay,
    };
    self.pending.lock().push(Reverse(entry));
    self.stats.record_scheduled();
  }

  /// Delivers every pending message that is due, in delivery-time order.
  /// Returns how many reached a receiver.
  pub fn process_messages(&self) -> usize {
    let now = self.clock.now();
    let due = {
      let mut pending = self.pending.lock();
      let mut due = Vec::new();
      while pending
        .peek()
        .map_or(false, |Reverse(p)| p.delivery_time <= now)
      {
        if let Some(Reverse(p)) = pending.pop() {
          due.push(p);
        }
      }
      due
    };
    let mut delivered = 0;
    for p in due {
      match self.get_node(&p.to) {
        Some(node) if self.reachable(&p.from, &p.to, now) => {
          node.receive(&p.from, p.content);
          self.stats.record_delivery(p.delay);
          delivered += 1;
        }
        Some(_) => {
          trace!(from = %p.from, to = %p.to, "partitioned in flight");
          self.stats.record_drop();
        }
        None => {
          trace!(from = %p.from, to = %p.to, "no such node");
          self.stats.record_drop();
        }
      }
    }
    delivered
  }

  /// Messages scheduled but not yet due or not yet driven.
  pub fn pending(&self) -> usize {
    self.pending.lock().len()
  }

  /// Cuts every member of `group_a` off from every member of `group_b` for
  /// `duration`. Replaces any partition already in place.
  pub fn simulate_network_partition(
    &self,
    group_a: &[NodeId],
    group_b: &[NodeId],
    duration: Duration,
  ) {
    self.split(&[group_a.to_vec(), group_b.to_vec()], duration)
  }

  /// N-way version of
  /// [`simulate_network_partition`](Network::simulate_network_partition).
  pub fn split(&self, groups: &[Vec<NodeId>], duration: Duration) {
    let map = PartitionMap::new(groups, self.clock.now() + duration);
    debug!(
      groups = groups.len(),
      until = %map.expires_at(),
      "network partitioned"
    );
    *self.partition.lock() = Some(map);
  }

  pub fn heal_network_partition(&self) {
    if self.partition.lock().take().is_some() {
      debug!("network partition healed");
    }
  }

  pub fn is_partitioned(&self) -> bool {
    let now = self.clock.now();
    self
      .partition
      .lock()
      .as_ref()
      .map_or(false, |p| p.is_active(now))
  }

  fn reachable(&self, from: &str, to: &str, now: Timestamp) -> bool {
    self
      .partition
      .lock()
      .as_ref()
      .map_or(true, |p| p.reachable(from, to, now))
  }

  pub fn get_stats(&self) -> NetworkStats {
    self.stats.snapshot()
  }

  pub fn reset_stats(&self) {
    self.stats.reset()
  }

  /// An rng for a node, drawn from the network's own. Deterministic for a
  /// seeded network as long as nodes are created in the same order.
  pub fn fork_rng(&self) -> SmallRng {
    SmallRng::seed_from_u64(self.rng.lock().gen())
  }
}

#[test]
fn test_seeded_forks_repeat() {
  let seeded = || {
    let mut cfg = NetworkConfig::reliable();
    cfg.seed = Some(11);
    Network::new(cfg).unwrap()
  };
  let (a, b) = (seeded(), seeded());
  let draws = |net: &Network| {
    (0..3).map(|_| net.fork_rng().gen::<u64>()).collect::<Vec<_>>()
  };
  let first = draws(&a);
  assert_eq!(first, draws(&b));
  assert_ne!(first[0], first[1]);
}
