pub mod codec;
mod gossip;
mod heartbeat;

#[rustfmt::skip]
pub use {
  gossip::GossipConfig,
  gossip::GossipNode,
  gossip::PeerState,
  heartbeat::HeartbeatConfig,
  heartbeat::HeartbeatNode,
  heartbeat::Role,
  heartbeat::WorkerState,
  heartbeat::HEARTBEAT,
};
