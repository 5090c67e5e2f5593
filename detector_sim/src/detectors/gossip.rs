use crate::core::{Message, Metrics, Node, NodeCore, NodeId, Timestamp};
use crate::detectors::codec::{self, PeerRecord};
use crate::testkit::Network;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipConfig {
  pub gossip_interval: Duration,
  /// Consecutive silent rounds before a peer is declared dead.
  pub suspicion_threshold: u32,
  pub fanout: usize,
}
impl Default for GossipConfig {
  fn default() -> Self {
    GossipConfig {
      gossip_interval: Duration::from_millis(1000),
      suspicion_threshold: 3,
      fanout: 3,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
  pub is_alive: bool,
  pub last_seen: Timestamp,
  pub suspicion_level: u32,
}
impl PeerState {
  fn fresh(now: Timestamp) -> PeerState {
    PeerState {
      is_alive: true,
      last_seen: now,
      suspicion_level: 0,
    }
  }
}

struct GossipState {
  peers: BTreeMap<NodeId, PeerState>,
  metrics: Metrics,
  last_gossip: Option<Timestamp>,
  rng: SmallRng,
}

/// Anti-entropy failure detector.
///
/// Once per `gossip_interval` the node stamps its own entry, ships its whole
/// table to up to `fanout` random peers, and ages every peer it has not heard
/// from within the interval. A peer whose suspicion reaches
/// `suspicion_threshold` is marked dead. Hearing from a peer, directly or
/// through a fresher entry in someone else's table, clears its suspicion.
pub struct GossipNode {
  core: NodeCore,
  config: GossipConfig,
  network: Weak<Network>,
  state: Mutex<GossipState>,
}
impl GossipNode {
  pub fn new(
    id: impl Into<NodeId>,
    peers: impl IntoIterator<Item = NodeId>,
    network: &Arc<Network>,
    config: GossipConfig,
  ) -> Arc<GossipNode> {
    let core = NodeCore::new(id, network.clock().clone());
    let now = core.now();
    let mut table = peers
      .into_iter()
      .map(|p| (p, PeerState::fresh(now)))
      .collect::<BTreeMap<_, _>>();
    table.insert(core.id().to_string(), PeerState::fresh(now));
    Arc::new(GossipNode {
      core: core,
      config: config,
      network: Arc::downgrade(network),
      state: Mutex::new(GossipState {
        peers: table,
        metrics: Metrics::new(now),
        last_gossip: None,
        rng: network.fork_rng(),
      }),
    })
  }

  pub fn config(&self) -> &GossipConfig {
    &self.config
  }

  pub fn add_peer(&self, id: impl Into<NodeId>) {
    let now = self.core.now();
    self.state.lock().peers.insert(id.into(), PeerState::fresh(now));
  }

  /// Our own entry cannot be removed.
  pub fn remove_peer(&self, id: &str) -> Option<PeerState> {
    if id == self.core.id() {
      return None;
    }
    self.state.lock().peers.remove(id)
  }

  pub fn peer_state(&self, id: &str) -> Option<PeerState> {
    self.state.lock().peers.get(id).copied()
  }

  /// Every known id, ourselves included.
  pub fn peer_ids(&self) -> Vec<NodeId> {
    self.state.lock().peers.keys().cloned().collect()
  }

  /// The whole table in wire format.
  pub fn serialize_state(&self) -> String {
    let state = self.state.lock();
    codec::encode(
      state
        .peers
        .iter()
        .map(|(id, s)| (id.as_str(), s.is_alive, s.last_seen)),
    )
  }

  /// Folds a peer's table into ours.
  ///
  /// Only ids we already know, other than our own, are considered. An entry
  /// is adopted when it is strictly fresher than ours, or when it reports the
  /// peer dead and is at least as fresh at wire precision. Either way the
  /// entry's suspicion is cleared.
  pub fn merge_state(&self, payload: &str) -> usize {
    let records = codec::decode(payload);
    let mut state = self.state.lock();
    let mut updated = 0;
    for PeerRecord {
      id,
      alive,
      last_seen,
    } in records
    {
      if id == self.core.id() {
        continue;
      }
      let entry = match state.peers.get_mut(&id) {
        Some(entry) => entry,
        None => continue,
      };
      if last_seen > entry.last_seen {
        entry.is_alive = alive;
        entry.last_seen = last_seen;
        entry.suspicion_level = 0;
        updated += 1;
      } else if !alive
        && entry.is_alive
        && last_seen.as_secs() >= entry.last_seen.as_secs()
      {
        debug!(node = self.core.id(), peer = %id, "peer reported dead");
        entry.is_alive = false;
        entry.suspicion_level = 0;
        updated += 1;
      }
    }
    updated
  }

  fn is_failed(&self, s: &PeerState) -> bool {
    !s.is_alive || s.suspicion_level >= self.config.suspicion_threshold
  }

  /// Runs a round if one is due at `now`.
  pub(crate) fn tick_at(&self, now: Timestamp) {
    let due = {
      let mut state = self.state.lock();
      let due = state
        .last_gossip
        .map_or(true, |t| now.since(t) >= self.config.gossip_interval);
      if due {
        state.last_gossip = Some(now);
      }
      due
    };
    if due {
      self.gossip_round(now);
      self.age_suspicion(now);
    }
  }

  fn gossip_round(&self, now: Timestamp) {
    let (targets, payload) = {
      let mut state = self.state.lock();
      let state = &mut *state;
      if let Some(me) = state.peers.get_mut(self.core.id()) {
        *me = PeerState::fresh(now);
      }
      let mut others = state
        .peers
        .keys()
        .filter(|id| id.as_str() != self.core.id())
        .cloned()
        .collect::<Vec<_>>();
      if others.len() > self.config.fanout {
        others.shuffle(&mut state.rng);
        others.truncate(self.config.fanout);
      }
      let payload = codec::encode(
        state
          .peers
          .iter()
          .map(|(id, s)| (id.as_str(), s.is_alive, s.last_seen)),
      );
      state.metrics.messages_sent += others.len() as u64;
      (others, payload)
    };
    trace!(node = self.core.id(), ?targets, "gossip round");
    for to in targets {
      self.send(&to, payload.clone());
    }
  }

  pub(crate) fn age_suspicion(&self, now: Timestamp) {
    let mut state = self.state.lock();
    for (id, peer) in state.peers.iter_mut() {
      if id == self.core.id() {
        continue;
      }
      if now.since(peer.last_seen) > self.config.gossip_interval {
        peer.suspicion_level += 1;
        if peer.suspicion_level >= self.config.suspicion_threshold
          && peer.is_alive
        {
          debug!(
            node = self.core.id(),
            peer = %id,
            silent_ms = now.since(peer.last_seen).as_millis() as u64,
            "peer suspected dead"
          );
          peer.is_alive = false;
        }
      }
    }
  }
}
impl Node for GossipNode {
  fn core(&self) -> &NodeCore {
    &self.core
  }

  fn send(&self, to: &str, content: String) {
    if let Some(network) = self.network.upgrade() {
      network.send(self.core.id(), to, content);
    }
  }

  fn process(&self, msg: Message) {
    {
      let mut state = self.state.lock();
      state.metrics.messages_received += 1;
      if let Some(sender) = state.peers.get_mut(&msg.from) {
        sender.is_alive = true;
        sender.suspicion_level = 0;
        sender.last_seen = msg.timestamp;
      }
    }
    self.merge_state(&msg.content);
  }

  fn periodic_task(&self) {
    self.tick_at(self.core.now())
  }

  fn failed_nodes(&self) -> Vec<NodeId> {
    let state = self.state.lock();
    state
      .peers
      .iter()
      .filter(|(_, s)| self.is_failed(s))
      .map(|(id, _)| id.clone())
      .collect()
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
use maplit::btreeset;
#[cfg(test)]
use std::collections::BTreeSet;

#[cfg(test)]
fn ids(xs: &[&str]) -> Vec<NodeId> {
  xs.iter().map(|x| x.to_string()).collect()
}

#[cfg(test)]
fn failed(node: &GossipNode) -> BTreeSet<NodeId> {
  node.failed_nodes().into_iter().collect()
}

#[tokio::test]
async fn test_self_present_after_construction() {
  let net = Network::new(NetworkConfig::reliable()).unwrap();
  let node = GossipNode::new(
    "a",
    ids(&["b", "c"]),
    &net,
    GossipConfig::default(),
  );
  let me = node.peer_state("a").unwrap();
  assert!(me.is_alive);
  assert_eq!(me.suspicion_level, 0);
  assert_eq!(node.peer_ids(), ids(&["a", "b", "c"]));
  assert!(node.failed_nodes().is_empty());
  assert!(node.remove_peer("a").is_none());
  node.add_peer("d");
  assert!(node.remove_peer("b").is_some());
  assert_eq!(node.peer_ids(), ids(&["a", "c", "d"]));
}

#[tokio::test]
async fn test_suspicion_ages_per_interval() {
  let net = Network::new(NetworkConfig::reliable()).unwrap();
  let node = GossipNode::new("a", ids(&["b"]), &net, GossipConfig::default());
  let t0 = node.peer_state("b").unwrap().last_seen;
  let at = |ms: u64| t0 + Duration::from_millis(ms);

  // Exactly one interval of silence is not yet suspicious.
  node.age_suspicion(at(1000));
  assert_eq!(node.peer_state("b").unwrap().suspicion_level, 0);
  node.age_suspicion(at(1001));
  node.age_suspicion(at(2001));
  assert_eq!(node.peer_state("b").unwrap().suspicion_level, 2);
  assert!(failed(&node).is_empty());
  node.age_suspicion(at(3001));
  let b = node.peer_state("b").unwrap();
  assert_eq!(b.suspicion_level, 3);
  assert!(!b.is_alive);
  assert_eq!(failed(&node), btreeset! {"b".to_string()});
  // We never suspect ourselves.
  assert_eq!(node.peer_state("a").unwrap().suspicion_level, 0);
}

#[tokio::test]
async fn test_message_clears_suspicion() {
  let net = Network::new(NetworkConfig::reliable()).unwrap();
  let node = GossipNode::new("a", ids(&["b"]), &net, GossipConfig::default());
  let t0 = node.peer_state("b").unwrap().last_seen;
  for s in 1..=3 {
    node.age_suspicion(t0 + Duration::from_secs(s * 2));
  }
  assert!(!node.peer_state("b").unwrap().is_alive);

  let later = t0 + Duration::from_secs(7);
  node.process(Message {
    from: "b".to_string(),
    to: "a".to_string(),
    content: "ping".to_string(),
    timestamp: later,
  });
  let b = node.peer_state("b").unwrap();
  assert_eq!(
    b,
    PeerState {
      is_alive: true,
      last_seen: later,
      suspicion_level: 0
    }
  );
  assert!(node.failed_nodes().is_empty());
  assert_eq!(node.metrics().messages_received, 1);
}

#[tokio::test]
async fn test_merge_is_freshness_guarded() {
  let net = Network::new(NetworkConfig::reliable()).unwrap();
  let node = GossipNode::new(
    "a",
    ids(&["b", "c", "d"]),
    &net,
    GossipConfig::default(),
  );
  let now = node.peer_state("b").unwrap().last_seen;
  let newer = now.as_secs() + 5;
  let older = now.as_secs() - 5;
  let payload = format!(
    "a:0:{n};b:1:{n};c:1:{o};d:0:{s};zz:1:{n}",
    n = newer,
    o = older,
    s = now.as_secs()
  );
  assert_eq!(node.merge_state(&payload), 2);
  // Claims about ourselves are ignored.
  assert!(node.peer_state("a").unwrap().is_alive);
  // Fresher entry adopted.
  assert_eq!(
    node.peer_state("b").unwrap().last_seen,
    Timestamp::from_secs(newer)
  );
  // Stale entry ignored.
  assert_eq!(node.peer_state("c").unwrap().last_seen, now);
  // Death at the same second wins.
  assert!(!node.peer_state("d").unwrap().is_alive);
  // Unknown ids are not fabricated.
  assert!(node.peer_state("zz").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_state_round_trip() {
  let net = Network::new(NetworkConfig::reliable()).unwrap();
  let cfg = GossipConfig::default();
  let receiver = GossipNode::new("r", ids(&["s", "x", "y"]), &net, cfg.clone());
  tokio::time::sleep(Duration::from_secs(3)).await;
  let sender = GossipNode::new("s", ids(&["r", "x", "y"]), &net, cfg);
  let t = sender.peer_state("x").unwrap().last_seen;
  for s in 1..=3 {
    sender.age_suspicion(t + Duration::from_secs(s * 2));
  }
  // y hears from the sender again; x stays dead.
  sender.process(Message {
    from: "y".to_string(),
    to: "s".to_string(),
    content: String::new(),
    timestamp: t + Duration::from_secs(7),
  });

  receiver.merge_state(&sender.serialize_state());
  for id in ["s", "x", "y"] {
    let sent = sender.peer_state(id).unwrap();
    let got = receiver.peer_state(id).unwrap();
    assert_eq!(got.is_alive, sent.is_alive, "{}", id);
    assert_eq!(got.last_seen.as_secs(), sent.last_seen.as_secs(), "{}", id);
    assert_eq!(got.suspicion_level, 0);
  }
  assert_eq!(failed(&receiver), btreeset! {"x".to_string()});
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_detected_between_three_and_four_intervals() {
  let net = Network::new(NetworkConfig::reliable()).unwrap();
  let node = GossipNode::new(
    "a",
    ids(&["ghost"]),
    &net,
    GossipConfig::default(),
  );
  node.clone().start().unwrap();
  tokio::time::sleep(Duration::from_millis(2900)).await;
  assert!(node.failed_nodes().is_empty());
  tokio::time::sleep(Duration::from_millis(1500)).await;
  assert_eq!(failed(&node), btreeset! {"ghost".to_string()});
  node.stop().await;
  // One round per interval went out, each to the only peer.
  let sent = node.metrics().messages_sent;
  assert!((4..=5).contains(&sent), "sent {}", sent);
  assert_eq!(net.pending() as u64, sent);
}

#[tokio::test]
async fn test_fanout_limits_round() {
  let net = Network::new(NetworkConfig::reliable()).unwrap();
  let peers = (0..10).map(|i| format!("p{}", i)).collect::<Vec<_>>();
  let node = GossipNode::new("a", peers, &net, GossipConfig::default());
  let now = node.core().now();
  node.tick_at(now);
  assert_eq!(net.pending(), 3);
  // Not due again until a full interval has passed.
  node.tick_at(now + Duration::from_millis(999));
  assert_eq!(net.pending(), 3);
  node.tick_at(now + Duration::from_millis(1000));
  assert_eq!(net.pending(), 6);
  assert_eq!(node.metrics().messages_sent, 6);
  node.reset_metrics();
  assert_eq!(node.metrics().messages_sent, 0);
}

#[tokio::test]
async fn test_seeded_network_repeats_peer_choice() {
  let targets = || {
    let mut cfg = NetworkConfig::reliable();
    cfg.seed = Some(5);
    let net = Network::new(cfg).unwrap();
    let gossip = GossipConfig::default();
    let peers = (0..10).map(|i| format!("p{}", i)).collect::<Vec<_>>();
    let receivers = peers
      .iter()
      .map(|p| {
        let node = GossipNode::new(p.clone(), Vec::new(), &net, gossip.clone());
        net.add_node(p.clone(), node.clone());
        node
      })
      .collect::<Vec<_>>();
    let node = GossipNode::new("a", peers.clone(), &net, gossip);
    let now = node.core().now();
    node.tick_at(now);
    node.tick_at(now + Duration::from_millis(1000));
    assert_eq!(net.process_messages(), 6);
    receivers
      .iter()
      .map(|r| r.core().inbox_len())
      .collect::<Vec<_>>()
  };
  assert_eq!(targets(), targets());
}
