use crate::core::{Message, Metrics, Node, NodeCore, NodeId, Timestamp};
use crate::testkit::Network;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

pub const HEARTBEAT: &str = "HEARTBEAT";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatConfig {
  pub heartbeat_interval: Duration,
  /// A worker silent for longer than this is marked dead.
  pub failure_threshold: Duration,
  pub master_id: NodeId,
}
impl Default for HeartbeatConfig {
  fn default() -> Self {
    HeartbeatConfig {
      heartbeat_interval: Duration::from_millis(1000),
      failure_threshold: Duration::from_millis(3000),
      master_id: "master".to_string(),
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
  Master,
  Worker,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerState {
  pub is_alive: bool,
  pub last_heartbeat: Timestamp,
}

struct HeartbeatState {
  nodes: BTreeMap<NodeId, WorkerState>,
  metrics: Metrics,
  last_sent: Option<Timestamp>,
}

/// Centralized detector. Workers ping the master every
/// `heartbeat_interval`; the master flips a worker to dead once its gap
/// exceeds `failure_threshold`, and back to alive on its next heartbeat.
pub struct HeartbeatNode {
  core: NodeCore,
  config: HeartbeatConfig,
  role: Role,
  network: Weak<Network>,
  state: Mutex<HeartbeatState>,
}
impl HeartbeatNode {
  pub fn new(
    id: impl Into<NodeId>,
    role: Role,
    network: &Arc<Network>,
    config: HeartbeatConfig,
  ) -> Arc<HeartbeatNode> {
    let core = NodeCore::new(id, network.clock().clone());
    let now = core.now();
    let mut nodes = BTreeMap::new();
    nodes.insert(
      core.id().to_string(),
      WorkerState {
        is_alive: true,
        last_heartbeat: now,
      },
    );
    Arc::new(HeartbeatNode {
      core: core,
      config: config,
      role: role,
      network: Arc::downgrade(network),
      state: Mutex::new(HeartbeatState {
        nodes: nodes,
        metrics: Metrics::new(now),
        last_sent: None,
      }),
    })
  }

  pub fn is_master(&self) -> bool {
    self.role == Role::Master
  }

  pub fn role(&self) -> Role {
    self.role
  }

  pub fn config(&self) -> &HeartbeatConfig {
    &self.config
  }

  /// Starts tracking `id` as a worker that was just heard from.
  pub fn add_node(&self, id: impl Into<NodeId>) {
    let now = self.core.now();
    self.state.lock().nodes.insert(
      id.into(),
      WorkerState {
        is_alive: true,
        last_heartbeat: now,
      },
    );
  }

  pub fn remove_node(&self, id: &str) -> Option<WorkerState> {
    if id == self.core.id() {
      return None;
    }
    self.state.lock().nodes.remove(id)
  }

  pub fn worker_state(&self, id: &str) -> Option<WorkerState> {
    self.state.lock().nodes.get(id).copied()
  }

  pub(crate) fn tick_at(&self, now: Timestamp) {
    match self.role {
      Role::Master => self.check_health(now),
      Role::Worker => self.maybe_send_heartbeat(now),
    }
  }

  fn maybe_send_heartbeat(&self, now: Timestamp) {
    let due = {
      let mut state = self.state.lock();
      let due = state
        .last_sent
        .map_or(true, |t| now.since(t) >= self.config.heartbeat_interval);
      if due {
        state.last_sent = Some(now);
        state.metrics.messages_sent += 1;
      }
      due
    };
    if due {
      trace!(node = self.core.id(), "heartbeat");
      self.send(&self.config.master_id, HEARTBEAT.to_string());
    }
  }

  /// Every flip counts as a false positive locally. Whether it really was one
  /// is only known against ground truth.
  pub(crate) fn check_health(&self, now: Timestamp) {
    let mut state = self.state.lock();
    let state = &mut *state;
    for (id, worker) in state.nodes.iter_mut() {
      if id == self.core.id() || !worker.is_alive {
        continue;
      }
      let gap = now.since(worker.last_heartbeat);
      if gap > self.config.failure_threshold {
        debug!(
          node = self.core.id(),
          worker = %id,
          gap_ms = gap.as_millis() as u64,
          "worker marked dead"
        );
        worker.is_alive = false;
        state.metrics.false_positives += 1;
      }
    }
  }
}
impl Node for HeartbeatNode {
  fn core(&self) -> &NodeCore {
    &self.core
  }

  fn send(&self, to: &str, content: String) {
    if let Some(network) = self.network.upgrade() {
      network.send(self.core.id(), to, content);
    }
  }

  fn process(&self, msg: Message) {
    let mut state = self.state.lock();
    state.metrics.messages_received += 1;
    if self.role == Role::Worker {
      return;
    }
    match state.nodes.get_mut(&msg.from) {
      Some(worker) => {
        if !worker.is_alive {
          debug!(node = self.core.id(), worker = %msg.from, "worker is back");
        }
        worker.is_alive = true;
        worker.last_heartbeat = msg.timestamp;
      }
      None => trace!(node = self.core.id(), from = %msg.from, "unknown sender"),
    }
  }

  fn periodic_task(&self) {
    self.tick_at(self.core.now())
  }

  fn failed_nodes(&self) -> Vec<NodeId> {
    self
      .state
      .lock()
      .nodes
      .iter()
      .filter(|(_, w)| !w.is_alive)
      .map(|(id, _)| id.clone())
      .collect()
  }

  fn is_detector(&self) -> bool {
    self.is_master()
  }

  fn metrics(&self) -> Metrics {
    self.state.lock().metrics
  }

  fn reset_metrics(&self) {
    let now = self.core.now();
    self.state.lock().metrics.reset(now);
  }
}

#[cfg(test)]
use crate::testkit::NetworkConfig;

#[cfg(test)]
fn heartbeat(from: &str, at: Timestamp) -> Message {
  Message {
    from: from.to_string(),
    to: "master".to_string(),
    content: HEARTBEAT.to_string(),
    timestamp: at,
  }
}

#[tokio::test]
async fn test_roles() {
  let net = Network::new(NetworkConfig::reliable()).unwrap();
  let cfg = HeartbeatConfig::default();
  let master = HeartbeatNode::new("master", Role::Master, &net, cfg.clone());
  let worker = HeartbeatNode::new("worker0", Role::Worker, &net, cfg);
  assert!(master.is_master() && master.is_detector());
  assert!(!worker.is_master() && !worker.is_detector());
  master.add_node("worker0");
  assert!(master.worker_state("worker0").unwrap().is_alive);
  assert!(master.remove_node("worker0").is_some());
  assert!(master.worker_state("worker0").is_none());
  assert!(master.remove_node("master").is_none());
}

#[tokio::test]
async fn test_threshold_is_strict() {
  let net = Network::new(NetworkConfig::reliable()).unwrap();
  let master = HeartbeatNode::new(
    "master",
    Role::Master,
    &net,
    HeartbeatConfig::default(),
  );
  master.add_node("w");
  let t0 = master.worker_state("w").unwrap().last_heartbeat;

  master.check_health(t0 + Duration::from_millis(3000));
  assert!(master.failed_nodes().is_empty());
  master.check_health(t0 + Duration::from_millis(3001));
  assert_eq!(master.failed_nodes(), vec!["w".to_string()]);
  assert_eq!(master.metrics().false_positives, 1);
  // Already dead, not counted again.
  master.check_health(t0 + Duration::from_millis(5000));
  assert_eq!(master.metrics().false_positives, 1);

  master.process(heartbeat("w", t0 + Duration::from_millis(5100)));
  assert!(master.failed_nodes().is_empty());
  assert_eq!(
    master.worker_state("w").unwrap().last_heartbeat,
    t0 + Duration::from_millis(5100)
  );
  master.check_health(t0 + Duration::from_millis(8100));
  assert!(master.failed_nodes().is_empty());
}

#[tokio::test]
async fn test_worker_ignores_content_and_paces_heartbeats() {
  let net = Network::new(NetworkConfig::reliable()).unwrap();
  let worker = HeartbeatNode::new(
    "worker0",
    Role::Worker,
    &net,
    HeartbeatConfig::default(),
  );
  let now = worker.core().now();
  worker.process(heartbeat("master", now));
  assert!(worker.failed_nodes().is_empty());
  assert_eq!(worker.metrics().messages_received, 1);

  worker.tick_at(now);
  worker.tick_at(now + Duration::from_millis(500));
  assert_eq!(net.pending(), 1);
  worker.tick_at(now + Duration::from_millis(1000));
  assert_eq!(net.pending(), 2);
  assert_eq!(worker.metrics().messages_sent, 2);
}

#[tokio::test]
async fn test_master_ignores_unknown_sender() {
  let net = Network::new(NetworkConfig::reliable()).unwrap();
  let master = HeartbeatNode::new(
    "master",
    Role::Master,
    &net,
    HeartbeatConfig::default(),
  );
  master.process(heartbeat("stranger", master.core().now()));
  assert!(master.worker_state("stranger").is_none());
  assert_eq!(master.metrics().messages_received, 1);
}

#[tokio::test(start_paused = true)]
async fn test_silent_worker_detected_after_threshold() {
  let net = Network::new(NetworkConfig::reliable()).unwrap();
  let master = HeartbeatNode::new(
    "master",
    Role::Master,
    &net,
    HeartbeatConfig::default(),
  );
  master.add_node("w");
  master.clone().start().unwrap();
  tokio::time::sleep(Duration::from_millis(2900)).await;
  assert!(master.failed_nodes().is_empty());
  tokio::time::sleep(Duration::from_millis(400)).await;
  assert_eq!(master.failed_nodes(), vec!["w".to_string()]);
  master.stop().await;
}
