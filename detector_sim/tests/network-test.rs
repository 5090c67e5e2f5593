use detector_sim::core::{Node, SimError};
use detector_sim::detectors::{GossipConfig, GossipNode};
use detector_sim::testkit::{Network, NetworkConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_test::{assert_err, assert_ok};
use validator::Validate;

fn config(loss: f64, delay_ms: u64) -> NetworkConfig {
  NetworkConfig {
    message_loss_rate: loss,
    delay_mean: Duration::from_millis(delay_ms),
    delay_std_dev: Duration::ZERO,
    seed: Some(42),
  }
}

fn register(net: &Arc<Network>, ids: &[&str]) -> Vec<Arc<GossipNode>> {
  ids
    .iter()
    .map(|id| {
      let node = GossipNode::new(
        id.to_string(),
        Vec::new(),
        net,
        GossipConfig::default(),
      );
      net.add_node(id.to_string(), node.clone());
      node
    })
    .collect()
}

#[tokio::test(start_paused = true)]
async fn lossless_transport_delivers_everything() {
  let net = assert_ok!(Network::new(config(0.0, 50)));
  let nodes = register(&net, &["a", "b"]);
  for i in 0..100 {
    net.send("a", "b", format!("msg{}", i));
  }
  assert_eq!(net.pending(), 100);
  // Nothing is due yet.
  assert_eq!(net.process_messages(), 0);
  sleep(Duration::from_millis(50)).await;
  assert_eq!(net.process_messages(), 100);
  assert_eq!(net.pending(), 0);

  let stats = net.get_stats();
  assert_eq!(stats.delivered, 100);
  assert_eq!(stats.dropped, 0);
  assert_eq!(stats.average_delay_ms, 50.0);

  let inbox = nodes[1].core().drain();
  assert_eq!(inbox.len(), 100);
  assert_eq!(inbox[0].content, "msg0");
  assert_eq!(inbox[99].content, "msg99");
  assert!(inbox.iter().all(|m| m.from == "a" && m.to == "b"));
}

#[tokio::test(start_paused = true)]
async fn total_loss_drops_everything() {
  let net = assert_ok!(Network::new(config(1.0, 0)));
  let nodes = register(&net, &["a", "b"]);
  for _ in 0..100 {
    net.send("a", "b", "x".to_string());
  }
  assert_eq!(net.pending(), 0);
  assert_eq!(net.process_messages(), 0);
  let stats = net.get_stats();
  assert_eq!(stats.delivered, 0);
  assert_eq!(stats.dropped, 100);
  assert_eq!(nodes[1].core().inbox_len(), 0);

  net.reset_stats();
  assert_eq!(net.get_stats().dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn delivery_follows_delay_not_send_order() {
  let mut cfg = config(0.0, 50);
  cfg.delay_std_dev = Duration::from_millis(30);
  let net = assert_ok!(Network::new(cfg));
  let nodes = register(&net, &["a", "b"]);
  for i in 0..50 {
    net.send("a", "b", i.to_string());
  }
  sleep(Duration::from_millis(500)).await;
  assert_eq!(net.process_messages(), 50);
  // Everything arrived, each exactly once.
  let mut seen = nodes[1]
    .core()
    .drain()
    .into_iter()
    .map(|m| m.content.parse::<u32>().unwrap())
    .collect::<Vec<_>>();
  seen.sort();
  assert_eq!(seen, (0..50).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn partition_blocks_until_healed() {
  let net = assert_ok!(Network::new(config(0.0, 0)));
  let nodes = register(&net, &["a", "b", "c"]);
  net.simulate_network_partition(
    &["a".to_string()],
    &["b".to_string()],
    Duration::from_secs(10),
  );
  assert!(net.is_partitioned());
  net.send("a", "b", "blocked".to_string());
  net.send("b", "a", "blocked".to_string());
  // c is in neither group.
  net.send("a", "c", "through".to_string());
  assert_eq!(net.process_messages(), 1);
  assert_eq!(net.get_stats().dropped, 2);

  net.heal_network_partition();
  assert!(!net.is_partitioned());
  net.send("a", "b", "through".to_string());
  assert_eq!(net.process_messages(), 1);
  assert_eq!(nodes[1].core().drain()[0].content, "through");
  assert_eq!(nodes[2].core().inbox_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn partition_lapses_on_its_own() {
  let net = assert_ok!(Network::new(config(0.0, 0)));
  register(&net, &["a", "b"]);
  net.simulate_network_partition(
    &["a".to_string()],
    &["b".to_string()],
    Duration::from_millis(1000),
  );
  net.send("a", "b", "blocked".to_string());
  sleep(Duration::from_millis(1000)).await;
  assert!(!net.is_partitioned());
  net.send("a", "b", "through".to_string());
  assert_eq!(net.process_messages(), 1);
  assert_eq!(net.get_stats().dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn partition_catches_messages_in_flight() {
  let net = assert_ok!(Network::new(config(0.0, 100)));
  register(&net, &["a", "b"]);
  net.send("a", "b", "late".to_string());
  net.simulate_network_partition(
    &["a".to_string()],
    &["b".to_string()],
    Duration::from_secs(10),
  );
  sleep(Duration::from_millis(100)).await;
  assert_eq!(net.process_messages(), 0);
  let stats = net.get_stats();
  assert_eq!(stats.scheduled, 1);
  assert_eq!(stats.dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_destination_is_a_drop() {
  let net = assert_ok!(Network::new(config(0.0, 0)));
  register(&net, &["a"]);
  net.send("a", "ghost", "hello".to_string());
  assert_eq!(net.process_messages(), 0);
  assert_eq!(net.get_stats().dropped, 1);

  // Removing a node strands what is already on its way.
  register(&net, &["b"]);
  net.send("a", "b", "hello".to_string());
  assert!(net.remove_node("b").is_some());
  assert_eq!(net.process_messages(), 0);
  assert_eq!(net.get_stats().dropped, 2);
}

#[tokio::test]
async fn invalid_loss_rate_is_rejected() {
  match Network::new(config(1.5, 0)) {
    Err(SimError::InvalidConfig(_)) => {}
    Err(e) => panic!("unexpected error: {}", e),
    Ok(_) => panic!("loss rate 1.5 was accepted"),
  }
  assert_err!(config(-0.1, 0).validate());
}

#[tokio::test]
async fn failure_injection_flips_ground_truth() {
  let net = assert_ok!(Network::new(config(0.0, 0)));
  let nodes = register(&net, &["a"]);
  assert!(net.simulate_node_failure("a"));
  assert!(!nodes[0].is_alive());
  assert!(net.simulate_node_recovery("a"));
  assert!(nodes[0].is_alive());
  assert!(!net.simulate_node_failure("ghost"));
  assert_eq!(net.node_ids(), vec!["a".to_string()]);
}
