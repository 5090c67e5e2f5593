mod failure_config;
mod network;
mod partition;
mod stats;

#[rustfmt::skip]
pub(crate) use {
  failure_config::DelayModel,
  stats::StatsCounters,
};

#[rustfmt::skip]
pub use {
  failure_config::NetworkConfig,
  network::Network,
  partition::PartitionId,
  partition::PartitionMap,
  stats::NetworkStats,
};
