use crate::core::{Clock, SimError, Timestamp};
use async_trait::async_trait;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

pub type NodeId = String;

/// Period of every node's actor loop.
pub const TICK: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
  pub from: NodeId,
  pub to: NodeId,
  pub content: String,
  /// When the message landed in the receiver's inbox.
  pub timestamp: Timestamp,
}

#[derive(
  Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct Metrics {
  pub messages_sent: u64,
  pub messages_received: u64,
  pub false_positives: u64,
  pub false_negatives: u64,
  pub reset_at: Timestamp,
}
impl Metrics {
  pub fn new(now: Timestamp) -> Metrics {
    Metrics {
      reset_at: now,
      ..Metrics::default()
    }
  }

  pub fn reset(&mut self, now: Timestamp) {
    *self = Metrics::new(now);
  }
}

struct ActorHandle {
  stop: oneshot::Sender<()>,
  task: JoinHandle<()>,
}

/// State every node has regardless of protocol.
///
/// `alive` is ground truth, set by whoever runs the scenario. It is unrelated
/// to what any detector believes.
pub struct NodeCore {
  id: NodeId,
  alive: AtomicBool,
  inbox: SegQueue<Message>,
  clock: Clock,
  tick: Duration,
  actor: Mutex<Option<ActorHandle>>,
}
impl NodeCore {
  pub fn new(id: impl Into<NodeId>, clock: Clock) -> NodeCore {
    NodeCore {
      id: id.into(),
      alive: AtomicBool::new(true),
      inbox: SegQueue::new(),
      clock: clock,
      tick: TICK,
      actor: Mutex::new(None),
    }
  }

  pub fn with_tick(mut self, tick: Duration) -> NodeCore {
    self.tick = tick;
    self
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn clock(&self) -> &Clock {
    &self.clock
  }

  pub fn now(&self) -> Timestamp {
    self.clock.now()
  }

  pub fn is_alive(&self) -> bool {
    self.alive.load(Ordering::SeqCst)
  }

  pub fn set_alive(&self, alive: bool) {
    let was = self.alive.swap(alive, Ordering::SeqCst);
    if was != alive {
      debug!(node = %self.id, alive, "ground truth changed");
    }
  }

  pub fn enqueue(&self, from: &str, content: String) {
    self.inbox.push(Message {
      from: from.to_string(),
      to: self.id.clone(),
      content: content,
      timestamp: self.now(),
    });
  }

  /// Everything currently queued, oldest first.
  pub fn drain(&self) -> Vec<Message> {
    let mut msgs = Vec::with_capacity(self.inbox.len());
    while let Some(msg) = self.inbox.pop() {
      msgs.push(msg);
    }
    msgs
  }

  pub fn inbox_len(&self) -> usize {
    self.inbox.len()
  }
}

/// A failure-detecting actor.
///
/// Implementors supply the protocol: [`process`](Node::process),
/// [`periodic_task`](Node::periodic_task) and
/// [`failed_nodes`](Node::failed_nodes). Lifecycle, ground truth and the inbox
/// are provided on top of [`core`](Node::core).
#[async_trait]
pub trait Node: Send + Sync + 'static {
  fn core(&self) -> &NodeCore;

  /// Hand `content` to the transport, addressed to `to`.
  fn send(&self, to: &str, content: String);

  fn process(&self, msg: Message);

  fn periodic_task(&self);

  /// Ids this node currently believes to be dead.
  fn failed_nodes(&self) -> Vec<NodeId>;

  fn metrics(&self) -> Metrics;

  fn reset_metrics(&self);

  /// Whether [`failed_nodes`](Node::failed_nodes) is a view worth scoring.
  fn is_detector(&self) -> bool {
    true
  }

  fn id(&self) -> &str {
    self.core().id()
  }

  fn is_alive(&self) -> bool {
    self.core().is_alive()
  }

  fn set_alive(&self, alive: bool) {
    self.core().set_alive(alive)
  }

  /// Never blocks. Safe to call from any thread.
  fn receive(&self, from: &str, content: String) {
    self.core().enqueue(from, content)
  }

  fn is_running(&self) -> bool {
    self.core().actor.lock().is_some()
  }

  /// Spawns the actor loop on the current tokio runtime.
  fn start(self: Arc<Self>) -> Result<(), SimError> {
    let mut slot = self.core().actor.lock();
    if slot.is_some() {
      return Err(SimError::AlreadyStarted(self.id().to_string()));
    }
    let (tx, rx) = oneshot::channel();
    let task = tokio::spawn(run_actor(self.clone(), rx));
    *slot = Some(ActorHandle { stop: tx, task: task });
    Ok(())
  }

  /// Signals the actor and waits for its loop to exit. A no-op on a node
  /// that is not running.
  async fn stop(&self) {
    let handle = self.core().actor.lock().take();
    if let Some(handle) = handle {
      let _ = handle.stop.send(());
      if let Err(e) = handle.task.await {
        warn!(node = self.id(), error = %e, "actor did not exit cleanly");
      }
    }
  }
}

async fn run_actor<N: Node + ?Sized>(
  node: Arc<N>,
  mut stop: oneshot::Receiver<()>,
) {
  let mut ticker = interval(node.core().tick);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  debug!(node = node.id(), "actor started");
  loop {
    tokio::select! {
      _ = &mut stop => break,
      _ = ticker.tick() => {
        let inbox = node.core().drain();
        if !node.is_alive() {
          if !inbox.is_empty() {
            trace!(node = node.id(), n = inbox.len(), "down, discarding inbox");
          }
          continue;
        }
        for msg in inbox {
          node.process(msg);
        }
        node.periodic_task();
      }
    }
  }
  debug!(node = node.id(), "actor stopped");
}

#[cfg(test)]
struct Echo {
  core: NodeCore,
  seen: Mutex<Vec<Message>>,
  ticks: std::sync::atomic::AtomicUsize,
}
#[cfg(test)]
impl Node for Echo {
  fn core(&self) -> &NodeCore {
    &self.core
  }

  fn send(&self, _: &str, _: String) {}

  fn process(&self, msg: Message) {
    self.seen.lock().push(msg);
  }

  fn periodic_task(&self) {
    self.ticks.fetch_add(1, Ordering::SeqCst);
  }

  fn failed_nodes(&self) -> Vec<NodeId> {
    vec![]
  }

  fn metrics(&self) -> Metrics {
    Metrics::default()
  }

  fn reset_metrics(&self) {}
}
#[cfg(test)]
fn echo(id: &str) -> Arc<Echo> {
  Arc::new(Echo {
    core: NodeCore::new(id, Clock::new()),
    seen: Mutex::new(vec![]),
    ticks: std::sync::atomic::AtomicUsize::new(0),
  })
}

#[tokio::test(start_paused = true)]
async fn test_actor_processes_in_arrival_order() {
  let node = echo("a");
  node.receive("x", "1".to_string());
  node.receive("y", "2".to_string());
  node.receive("x", "3".to_string());
  node.clone().start().unwrap();
  tokio::time::sleep(TICK * 2).await;
  let seen = node.seen.lock().clone();
  let contents = seen.iter().map(|m| m.content.as_str()).collect::<Vec<_>>();
  assert_eq!(contents, vec!["1", "2", "3"]);
  assert!(seen.iter().all(|m| m.to == "a"));
  assert_eq!(seen[1].from, "y");
  node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_fails_and_stop_joins() {
  let node = echo("a");
  node.clone().start().unwrap();
  assert!(matches!(
    node.clone().start(),
    Err(SimError::AlreadyStarted(id)) if id == "a"
  ));
  assert!(node.is_running());
  node.stop().await;
  assert!(!node.is_running());
  let ticks = node.ticks.load(Ordering::SeqCst);
  tokio::time::sleep(TICK * 5).await;
  assert_eq!(node.ticks.load(Ordering::SeqCst), ticks);
  // Stopping twice is harmless.
  node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_dead_node_discards_inbox() {
  let node = echo("a");
  node.set_alive(false);
  node.clone().start().unwrap();
  node.receive("x", "lost".to_string());
  tokio::time::sleep(TICK * 3).await;
  assert!(node.seen.lock().is_empty());
  assert_eq!(node.ticks.load(Ordering::SeqCst), 0);
  assert_eq!(node.core().inbox_len(), 0);

  node.set_alive(true);
  node.receive("x", "kept".to_string());
  tokio::time::sleep(TICK * 2).await;
  assert_eq!(node.seen.lock().len(), 1);
  assert!(node.ticks.load(Ordering::SeqCst) > 0);
  node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_custom_tick_rate() {
  let node = Arc::new(Echo {
    core: NodeCore::new("fast", Clock::new())
      .with_tick(Duration::from_millis(10)),
    seen: Mutex::new(vec![]),
    ticks: std::sync::atomic::AtomicUsize::new(0),
  });
  let slow = echo("slow");
  node.clone().start().unwrap();
  slow.clone().start().unwrap();
  tokio::time::sleep(Duration::from_millis(95)).await;
  assert_eq!(node.ticks.load(Ordering::SeqCst), 10);
  assert_eq!(slow.ticks.load(Ordering::SeqCst), 1);
  node.stop().await;
  slow.stop().await;
}
