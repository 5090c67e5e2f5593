//! A testbed for comparing two failure detectors under an unreliable,
//! in-process network.
//!
//! - [`GossipNode`](crate::detectors::GossipNode) runs anti-entropy gossip:
//!   every round it ships its whole peer table to a few random peers and
//!   raises suspicion on peers it has not heard from.
//! - [`HeartbeatNode`](crate::detectors::HeartbeatNode) is a centralized
//!   detector: workers ping a master, and the master declares a worker dead
//!   once its heartbeat gap exceeds a threshold.
//!
//! Every node is its own actor (a tokio task with a fixed tick). Nodes talk
//! through a [`Network`](crate::testkit::Network), which drops messages with a
//! configurable probability, delays the rest by a sampled amount, and can be
//! partitioned. The [`Simulator`](crate::harness::Simulator) wires it all
//! together, injects failures, and scores every node's view against ground
//! truth.

pub mod core;
pub mod detectors;
pub mod harness;
pub mod testkit;
