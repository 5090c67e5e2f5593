use crate::core::{Node, NodeId, SimError};
use crate::detectors::{
  GossipConfig, GossipNode, HeartbeatConfig, HeartbeatNode, Role,
};
use crate::harness::Score;
use crate::testkit::{Network, NetworkConfig};
use itertools::Itertools;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const BASELINE_MSG: &str = "PING";
const LOAD_MSG: &str = "test_message";

#[derive(
  Clone,
  Copy,
  Debug,
  Hash,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
)]
pub enum Protocol {
  Gossip,
  Heartbeat,
}
impl Protocol {
  pub const ALL: [Protocol; 2] = [Protocol::Gossip, Protocol::Heartbeat];
}
impl fmt::Display for Protocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Protocol::Gossip => write!(f, "Gossip"),
      Protocol::Heartbeat => write!(f, "Heartbeat"),
    }
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
  pub test_name: String,
  pub protocol: Option<Protocol>,
  pub detection_time_ms: f64,
  pub true_positives: u64,
  pub false_positives: u64,
  pub false_negatives: u64,
  pub messages_sent: u64,
  pub accuracy: f64,
  /// False when the wait hit its timeout.
  pub converged: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulatorConfig {
  pub network: NetworkConfig,
  pub gossip: GossipConfig,
  pub heartbeat: HeartbeatConfig,
  pub poll_interval: Duration,
  pub convergence_timeout: Duration,
  pub baseline_timeout: Duration,
  pub partition_duration: Duration,
  pub high_load_messages: usize,
  /// Messages sent per poll tick while flooding.
  pub high_load_batch: usize,
}
impl Default for SimulatorConfig {
  fn default() -> Self {
    SimulatorConfig {
      network: NetworkConfig::default(),
      gossip: GossipConfig::default(),
      heartbeat: HeartbeatConfig::default(),
      poll_interval: Duration::from_millis(50),
      convergence_timeout: Duration::from_millis(6000),
      baseline_timeout: Duration::from_millis(2000),
      partition_duration: Duration::from_millis(5000),
      high_load_messages: 1000,
      high_load_batch: 10,
    }
  }
}

/// Drives failure scenarios against a population of detector nodes and
/// scores their views against ground truth.
///
/// Ground truth is what the scenario did to the nodes, never what any node
/// believes. Only nodes that are alive and whose view means something
/// ([`Node::is_detector`]) are polled and scored.
pub struct Simulator {
  config: SimulatorConfig,
  network: Arc<Network>,
  protocol: Option<Protocol>,
  ids: Vec<NodeId>,
  ground_truth: BTreeMap<NodeId, bool>,
  rng: SmallRng,
}
impl Simulator {
  pub fn new(config: SimulatorConfig) -> Result<Simulator, SimError> {
    let rng = match config.network.seed {
      Some(seed) => SmallRng::seed_from_u64(seed),
      None => SmallRng::from_entropy(),
    };
    Ok(Simulator {
      network: Network::new(config.network.clone())?,
      config: config,
      protocol: None,
      ids: Vec::new(),
      ground_truth: BTreeMap::new(),
      rng: rng,
    })
  }

  pub fn config(&self) -> &SimulatorConfig {
    &self.config
  }

  pub fn network(&self) -> &Arc<Network> {
    &self.network
  }

  pub fn protocol(&self) -> Option<Protocol> {
    self.protocol
  }

  /// Node ids in creation order.
  pub fn node_ids(&self) -> &[NodeId] {
    &self.ids
  }

  pub fn ground_truth(&self) -> &BTreeMap<NodeId, bool> {
    &self.ground_truth
  }

  pub async fn setup_gossip_network(
    &mut self,
    n: usize,
  ) -> Result<(), SimError> {
    self.cleanup_network().await;
    self.network = Network::new(self.config.network.clone())?;
    let ids = (0..n).map(|i| format!("node{}", i)).collect::<Vec<_>>();
    let mut nodes = Vec::<Arc<dyn Node>>::with_capacity(n);
    for id in &ids {
      let peers = ids.iter().filter(|p| *p != id).cloned();
      let node = GossipNode::new(
        id.clone(),
        peers,
        &self.network,
        self.config.gossip.clone(),
      );
      nodes.push(node);
    }
    self.install(Protocol::Gossip, ids, nodes)
  }

  /// One master, `n - 1` workers already registered with it.
  pub async fn setup_heartbeat_network(
    &mut self,
    n: usize,
  ) -> Result<(), SimError> {
    if n == 0 {
      return Err(SimError::EmptyHeartbeatNetwork);
    }
    self.cleanup_network().await;
    self.network = Network::new(self.config.network.clone())?;
    let cfg = self.config.heartbeat.clone();
    let master = HeartbeatNode::new(
      cfg.master_id.clone(),
      Role::Master,
      &self.network,
      cfg.clone(),
    );
    let mut ids = vec![cfg.master_id.clone()];
    let mut nodes = Vec::<Arc<dyn Node>>::with_capacity(n);
    nodes.push(master.clone());
    for i in 0..n - 1 {
      let id = format!("worker{}", i);
      let worker = HeartbeatNode::new(
        id.clone(),
        Role::Worker,
        &self.network,
        cfg.clone(),
      );
      master.add_node(id.clone());
      ids.push(id);
      nodes.push(worker);
    }
    self.install(Protocol::Heartbeat, ids, nodes)
  }

  fn install(
    &mut self,
    protocol: Protocol,
    ids: Vec<NodeId>,
    nodes: Vec<Arc<dyn Node>>,
  ) -> Result<(), SimError> {
    for node in &nodes {
      self.network.add_node(node.id(), node.clone());
    }
    for node in nodes {
      node.start()?;
    }
    self.ground_truth = ids.iter().map(|id| (id.clone(), true)).collect();
    self.ids = ids;
    self.protocol = Some(protocol);
    debug!(%protocol, n = self.ids.len(), "network up");
    Ok(())
  }

  /// Stops every registered actor and empties the registry.
  pub async fn cleanup_network(&mut self) {
    self.network.heal_network_partition();
    for (_, node) in self.network.clear() {
      node.stop().await;
    }
    self.ids.clear();
    self.ground_truth.clear();
    self.protocol = None;
  }

  /// Ids a scenario may kill: everyone except a heartbeat master.
  pub fn candidates(&self) -> Vec<NodeId> {
    let master = &self.config.heartbeat.master_id;
    self
      .ids
      .iter()
      .filter(|id| self.protocol != Some(Protocol::Heartbeat) || *id != master)
      .cloned()
      .collect()
  }

  pub fn simulate_failures(&mut self, ids: &[NodeId]) {
    for id in ids {
      if self.network.simulate_node_failure(id) {
        self.ground_truth.insert(id.clone(), false);
      }
    }
  }

  pub fn simulate_recoveries(&mut self, ids: &[NodeId]) {
    for id in ids {
      if self.network.simulate_node_recovery(id) {
        self.ground_truth.insert(id.clone(), true);
      }
    }
  }

  /// The failure view of every live detector.
  pub fn views(&self) -> Vec<(NodeId, BTreeSet<NodeId>)> {
    self
      .network
      .nodes()
      .into_iter()
      .filter(|(id, node)| {
        node.is_detector() && self.ground_truth.get(id).copied().unwrap_or(true)
      })
      .map(|(id, node)| (id, node.failed_nodes().into_iter().collect()))
      .collect()
  }

  pub fn check_convergence(&self, must_be_failed: &BTreeSet<NodeId>) -> bool {
    self
      .views()
      .iter()
      .all(|(_, failed)| must_be_failed.is_subset(failed))
  }

  /// Polls until every live detector reports all of `must_be_failed`, driving
  /// message delivery as it goes. Gives up quietly at `timeout`; the return
  /// value says which happened.
  pub async fn wait_for_convergence(
    &self,
    must_be_failed: &BTreeSet<NodeId>,
    timeout: Duration,
  ) -> bool {
    self
      .wait_until(timeout, |s| s.check_convergence(must_be_failed))
      .await
  }

  /// Like [`wait_for_convergence`](Simulator::wait_for_convergence), but
  /// waits for no live detector to report any of `recovered`.
  pub async fn wait_for_recovery(
    &self,
    recovered: &BTreeSet<NodeId>,
    timeout: Duration,
  ) -> bool {
    self
      .wait_until(timeout, |s| {
        s.views()
          .iter()
          .all(|(_, failed)| failed.is_disjoint(recovered))
      })
      .await
  }

  async fn wait_until<F>(&self, timeout: Duration, done: F) -> bool
  where
    F: Fn(&Simulator) -> bool,
  {
    let start = Instant::now();
    loop {
      self.network.process_messages();
      if done(self) {
        return true;
      }
      if start.elapsed() >= timeout {
        return false;
      }
      sleep(self.config.poll_interval).await;
    }
  }

  pub fn reset_statistics(&self) {
    self.network.reset_stats();
    for (_, node) in self.network.nodes() {
      node.reset_metrics();
    }
  }

  /// Scores the current views. `detection_time_ms` is left at zero for the
  /// scenario to fill in.
  pub fn collect_metrics(&self, test_name: &str) -> TestResult {
    let mut score = Score::default();
    for (id, failed) in self.views() {
      score.add_view(&id, &failed, &self.ground_truth);
    }
    let stats = self.network.get_stats();
    TestResult {
      test_name: test_name.to_string(),
      protocol: self.protocol,
      detection_time_ms: 0.0,
      true_positives: score.true_positives,
      false_positives: score.false_positives,
      false_negatives: score.false_negatives,
      messages_sent: stats.delivered + stats.dropped,
      accuracy: score.accuracy(),
      converged: true,
    }
  }

  /// All-pairs traffic, drained, then a clean slate for the counters.
  async fn establish_baseline(&self) {
    let mut sent = 0u64;
    for (from, to) in self.ids.iter().tuple_combinations() {
      self.network.send(from, to, BASELINE_MSG.to_string());
      self.network.send(to, from, BASELINE_MSG.to_string());
      sent += 2;
    }
    let settled = self
      .wait_until(self.config.baseline_timeout, |s| {
        let stats = s.network.get_stats();
        stats.delivered + stats.dropped >= sent
          && s.check_convergence(&BTreeSet::new())
      })
      .await;
    if !settled {
      warn!("baseline did not settle before its timeout");
    }
    self.reset_statistics();
  }

  async fn prepare(
    &mut self,
    protocol: Protocol,
    n: usize,
  ) -> Result<(), SimError> {
    if n < 2 {
      return Err(SimError::NotEnoughNodes { needed: 2, got: n });
    }
    match protocol {
      Protocol::Gossip => self.setup_gossip_network(n).await?,
      Protocol::Heartbeat => self.setup_heartbeat_network(n).await?,
    }
    self.establish_baseline().await;
    Ok(())
  }

  async fn finish(
    &mut self,
    name: &str,
    elapsed: Duration,
    converged: bool,
  ) -> TestResult {
    let protocol = self.protocol.map(|p| p.to_string()).unwrap_or_default();
    let mut result = self.collect_metrics(&format!("{}: {}", protocol, name));
    result.detection_time_ms = elapsed.as_secs_f64() * 1000.0;
    result.converged = converged;
    self.cleanup_network().await;
    info!(
      test = %result.test_name,
      detection_ms = result.detection_time_ms,
      accuracy = result.accuracy,
      fp = result.false_positives,
      fn_ = result.false_negatives,
      messages = result.messages_sent,
      converged,
      "scenario finished"
    );
    result
  }

  pub async fn single_node_failure(
    &mut self,
    protocol: Protocol,
    n: usize,
  ) -> Result<TestResult, SimError> {
    self.prepare(protocol, n).await?;
    let victims = self.candidates().into_iter().take(1).collect::<Vec<_>>();
    self.run_failure(victims, "Single Node Failure").await
  }

  /// Kills the first `failures` candidates at once. Asking for more than
  /// there are kills them all.
  pub async fn multiple_failures(
    &mut self,
    protocol: Protocol,
    n: usize,
    failures: usize,
  ) -> Result<TestResult, SimError> {
    self.prepare(protocol, n).await?;
    let victims = self
      .candidates()
      .into_iter()
      .take(failures)
      .collect::<Vec<_>>();
    self.run_failure(victims, "Multiple Failures").await
  }

  async fn run_failure(
    &mut self,
    victims: Vec<NodeId>,
    name: &str,
  ) -> Result<TestResult, SimError> {
    let must = victims.iter().cloned().collect::<BTreeSet<_>>();
    let started = Instant::now();
    self.simulate_failures(&victims);
    let converged = self
      .wait_for_convergence(&must, self.config.convergence_timeout)
      .await;
    Ok(self.finish(name, started.elapsed(), converged).await)
  }

  /// Splits the nodes in half for `partition_duration` and measures how long
  /// each side takes to give up on the other. Metrics are taken while the
  /// partition holds, so every cross-cut suspicion is a false positive.
  pub async fn network_partition(
    &mut self,
    protocol: Protocol,
    n: usize,
  ) -> Result<TestResult, SimError> {
    self.prepare(protocol, n).await?;
    let half = std::cmp::max(1, self.ids.len() / 2);
    let side_a = self.ids[..half].to_vec();
    let side_b = self.ids[half..].to_vec();
    let started = Instant::now();
    self.network.simulate_network_partition(
      &side_a,
      &side_b,
      self.config.partition_duration,
    );
    let converged = self
      .wait_until(self.config.partition_duration, |s| {
        s.views().iter().all(|(id, failed)| {
          let other = if side_a.contains(id) { &side_b } else { &side_a };
          other.iter().all(|o| failed.contains(o))
        })
      })
      .await;
    let elapsed = started.elapsed();
    let result = self.finish("Network Partition", elapsed, converged).await;
    Ok(result)
  }

  /// Floods random pairs with traffic, then checks nobody was wrongly
  /// suspected. The detection time is the length of the flood.
  pub async fn high_load(
    &mut self,
    protocol: Protocol,
    n: usize,
  ) -> Result<TestResult, SimError> {
    self.prepare(protocol, n).await?;
    let total = self.config.high_load_messages;
    let batch = std::cmp::max(1, self.config.high_load_batch);
    let started = Instant::now();
    let mut sent = 0;
    while sent < total {
      for _ in 0..std::cmp::min(batch, total - sent) {
        let pair = self.ids.choose_multiple(&mut self.rng, 2).collect_vec();
        if let [from, to] = pair[..] {
          self.network.send(from, to, LOAD_MSG.to_string());
        }
        sent += 1;
      }
      self.network.process_messages();
      sleep(self.config.poll_interval).await;
    }
    let flood = started.elapsed();
    let converged = self
      .wait_for_convergence(&BTreeSet::new(), self.config.convergence_timeout)
      .await;
    Ok(self.finish("High Load", flood, converged).await)
  }

  /// Kills a node, waits for it to be noticed, revives it, and measures how
  /// long until no detector still reports it.
  pub async fn recovery(
    &mut self,
    protocol: Protocol,
    n: usize,
  ) -> Result<TestResult, SimError> {
    self.prepare(protocol, n).await?;
    let victims = self.candidates().into_iter().take(1).collect::<Vec<_>>();
    let set = victims.iter().cloned().collect::<BTreeSet<_>>();
    self.simulate_failures(&victims);
    if !self
      .wait_for_convergence(&set, self.config.convergence_timeout)
      .await
    {
      warn!(?victims, "failure was not detected before revival");
    }
    let started = Instant::now();
    self.simulate_recoveries(&victims);
    let converged = self
      .wait_for_recovery(&set, self.config.convergence_timeout)
      .await;
    Ok(self.finish("Node Recovery", started.elapsed(), converged).await)
  }

  /// Every scenario under both protocols.
  pub async fn compare_algorithms(
    &mut self,
    n: usize,
  ) -> Result<Vec<TestResult>, SimError> {
    let mut results = Vec::with_capacity(10);
    for protocol in Protocol::ALL {
      results.push(self.single_node_failure(protocol, n).await?);
      let failures = std::cmp::max(1, n / 2);
      results.push(self.multiple_failures(protocol, n, failures).await?);
      results.push(self.network_partition(protocol, n).await?);
      results.push(self.high_load(protocol, n).await?);
      results.push(self.recovery(protocol, n).await?);
    }
    Ok(results)
  }

  /// [`compare_algorithms`](Simulator::compare_algorithms) for every size,
  /// with a per-protocol summary in the log.
  pub async fn run_all_tests(
    &mut self,
    sizes: &[usize],
  ) -> Result<Vec<(usize, Vec<TestResult>)>, SimError> {
    let mut all = Vec::with_capacity(sizes.len());
    for &n in sizes {
      info!(n, "running all scenarios");
      let results = self.compare_algorithms(n).await?;
      for protocol in Protocol::ALL {
        let mine = results
          .iter()
          .filter(|r| r.protocol == Some(protocol))
          .collect_vec();
        if mine.is_empty() {
          continue;
        }
        let accuracy =
          mine.iter().map(|r| r.accuracy).sum::<f64>() / mine.len() as f64;
        let messages = mine.iter().map(|r| r.messages_sent).sum::<u64>();
        info!(n, %protocol, accuracy, messages, "summary");
      }
      all.push((n, results));
    }
    Ok(all)
  }
}

#[test]
fn test_protocol_names() {
  assert_eq!(Protocol::Gossip.to_string(), "Gossip");
  assert_eq!(Protocol::Heartbeat.to_string(), "Heartbeat");
}

#[tokio::test(start_paused = true)]
async fn test_candidates_skip_master() {
  let mut sim = Simulator::new(SimulatorConfig::default()).unwrap();
  sim.setup_heartbeat_network(3).await.unwrap();
  assert_eq!(sim.candidates(), vec!["worker0", "worker1"]);
  sim.setup_gossip_network(3).await.unwrap();
  assert_eq!(sim.candidates(), vec!["node0", "node1", "node2"]);
  assert_eq!(sim.protocol(), Some(Protocol::Gossip));
  sim.cleanup_network().await;
  assert!(sim.candidates().is_empty());
  assert!(sim.ground_truth().is_empty());
}
