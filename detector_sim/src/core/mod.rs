//! Building blocks shared by every detector: time, errors, and the node actor.
//!
//! ### Nodes
//! A [`Node`] is anything with a [`NodeCore`] that knows how to
//! [`process`](Node::process) an inbound [`Message`] and what to do on each
//! [`periodic_task`](Node::periodic_task). The core owns the node's identity,
//! its ground-truth liveness flag and its inbox. Calling
//! [`start`](Node::start) spawns the actor on the current tokio runtime.
//!
//! ```ignore
//! let node: Arc<dyn Node> = GossipNode::new("node0", peers, &network, cfg);
//! network.add_node(node.id(), node.clone());
//! node.clone().start()?;
//! // ...
//! node.stop().await;
//! ```
//!
//! ### Time
//! All timestamps are [`Timestamp`]s read from the [`Clock`] owned by the
//! network. The clock follows tokio's time driver, so tests running on a
//! paused runtime see consistent, deterministic timestamps.

mod clock;
mod error;
mod node;

pub(crate) use clock::dur2u64;

#[rustfmt::skip]
pub use {
  clock::Clock,
  clock::Timestamp,
  error::SimError,
  node::Message,
  node::Metrics,
  node::Node,
  node::NodeCore,
  node::NodeId,
  node::TICK,
};
