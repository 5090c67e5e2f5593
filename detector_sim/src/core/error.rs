use crate::core::NodeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
  #[error("node {0} has already been started")]
  AlreadyStarted(NodeId),
  #[error("a heartbeat network needs at least one node")]
  EmptyHeartbeatNetwork,
  #[error("scenario needs at least {needed} nodes, got {got}")]
  NotEnoughNodes { needed: usize, got: usize },
  #[error("invalid network configuration: {0}")]
  InvalidConfig(#[from] validator::ValidationErrors),
}
