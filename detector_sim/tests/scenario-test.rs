use detector_sim::core::{Node, SimError};
use detector_sim::harness::{Protocol, Simulator, SimulatorConfig};
use detector_sim::testkit::NetworkConfig;
use maplit::btreeset;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::assert_ok;

fn config() -> SimulatorConfig {
  let mut config = SimulatorConfig::default();
  config.network = NetworkConfig {
    message_loss_rate: 0.0,
    delay_mean: Duration::from_millis(50),
    delay_std_dev: Duration::ZERO,
    seed: Some(7),
  };
  config.high_load_messages = 200;
  config
}

#[tokio::test(start_paused = true)]
async fn gossip_detects_single_failure() {
  let mut sim = assert_ok!(Simulator::new(config()));
  assert_eq!(sim.config().gossip.fanout, 3);
  assert_ok!(sim.setup_gossip_network(5).await);
  assert_eq!(
    sim.node_ids(),
    &["node0", "node1", "node2", "node3", "node4"]
  );
  sim.reset_statistics();

  sim.simulate_failures(&["node0".to_string()]);
  let must = btreeset! {"node0".to_string()};
  assert!(
    sim
      .wait_for_convergence(&must, Duration::from_millis(6000))
      .await
  );
  for id in &sim.node_ids()[1..] {
    let node = sim.network().get_node(id).unwrap();
    assert!(node.failed_nodes().contains(&"node0".to_string()));
  }

  let result = sim.collect_metrics("single");
  assert_eq!(result.protocol, Some(Protocol::Gossip));
  assert_eq!(result.false_positives, 0);
  assert_eq!(result.false_negatives, 0);
  assert_eq!(result.accuracy, 1.0);
  assert!(result.messages_sent > 0);
  sim.cleanup_network().await;
  assert!(sim.network().is_empty());
}

#[tokio::test(start_paused = true)]
async fn heartbeat_master_detects_worker() {
  let mut sim = assert_ok!(Simulator::new(config()));
  assert_ok!(sim.setup_heartbeat_network(10).await);
  assert_eq!(sim.node_ids().len(), 10);
  assert_eq!(sim.node_ids()[0], "master");
  assert_eq!(sim.candidates().len(), 9);

  let cfg = sim.config().heartbeat.clone();
  sim.simulate_failures(&["worker3".to_string()]);
  let started = Instant::now();
  let must = btreeset! {"worker3".to_string()};
  assert!(
    sim
      .wait_for_convergence(
        &must,
        cfg.failure_threshold + cfg.heartbeat_interval
      )
      .await
  );
  assert!(started.elapsed() > Duration::from_millis(2000));

  // Only the master's view is scored.
  assert_eq!(sim.views().len(), 1);
  let result = sim.collect_metrics("worker");
  assert_eq!(result.accuracy, 1.0);

  sim.simulate_recoveries(&["worker3".to_string()]);
  assert!(
    sim
      .wait_for_recovery(&must, Duration::from_millis(3000))
      .await
  );
  sim.cleanup_network().await;
}

#[tokio::test(start_paused = true)]
async fn undetected_failure_is_a_false_negative() {
  let mut sim = assert_ok!(Simulator::new(config()));
  assert_ok!(sim.setup_heartbeat_network(3).await);
  sim.simulate_failures(&["worker0".to_string()]);
  // Too soon for the master to have noticed.
  let result = sim.collect_metrics("early");
  assert_eq!(result.false_negatives, 1);
  assert_eq!(result.accuracy, 0.0);
  sim.cleanup_network().await;
}

#[tokio::test(start_paused = true)]
async fn quiet_network_is_fully_accurate() {
  let mut sim = assert_ok!(Simulator::new(config()));
  assert_ok!(sim.setup_gossip_network(4).await);
  for _ in 0..100 {
    sim.network().process_messages();
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
  let result = sim.collect_metrics("quiet");
  assert_eq!(result.false_positives, 0);
  assert_eq!(result.false_negatives, 0);
  assert_eq!(result.accuracy, 1.0);
  sim.cleanup_network().await;
}

#[tokio::test(start_paused = true)]
async fn bad_population_sizes() {
  let mut sim = assert_ok!(Simulator::new(config()));
  match sim.setup_heartbeat_network(0).await {
    Err(SimError::EmptyHeartbeatNetwork) => {}
    other => panic!("expected an error, got {:?}", other),
  }
  match sim.single_node_failure(Protocol::Gossip, 1).await {
    Err(SimError::NotEnoughNodes { needed: 2, got: 1 }) => {}
    Err(e) => panic!("unexpected error: {}", e),
    Ok(r) => panic!("ran with one node: {:?}", r),
  }
  // One heartbeat node is just a master with nothing to watch.
  assert_ok!(sim.setup_heartbeat_network(1).await);
  assert!(sim.candidates().is_empty());
  sim.cleanup_network().await;
}

#[tokio::test(start_paused = true)]
async fn single_failure_scenarios() {
  let mut sim = assert_ok!(Simulator::new(config()));
  for protocol in Protocol::ALL {
    let result = assert_ok!(sim.single_node_failure(protocol, 5).await);
    assert!(result.converged, "{:?}", result);
    assert_eq!(result.accuracy, 1.0, "{:?}", result);
    assert!(result.detection_time_ms > 0.0);
    assert!(result.detection_time_ms <= 6000.0);
    assert!(result.test_name.contains("Single Node Failure"));
  }
  assert!(sim.network().is_empty());
}

#[tokio::test(start_paused = true)]
async fn multiple_failures_kills_the_requested_count() {
  let mut sim = assert_ok!(Simulator::new(config()));
  // One master view, so every victim is one true positive.
  let result =
    assert_ok!(sim.multiple_failures(Protocol::Heartbeat, 6, 3).await);
  assert!(result.converged);
  assert_eq!(result.true_positives, 3);
  assert_eq!(result.false_negatives, 0);
  assert_eq!(result.accuracy, 1.0);

  // More than there are workers kills every worker.
  let result =
    assert_ok!(sim.multiple_failures(Protocol::Heartbeat, 6, 99).await);
  assert!(result.converged);
  assert_eq!(result.true_positives, 5);
  assert_eq!(result.accuracy, 1.0);

  // Three survivors each report both victims.
  let result =
    assert_ok!(sim.multiple_failures(Protocol::Gossip, 5, 2).await);
  assert!(result.converged, "{:?}", result);
  assert_eq!(result.true_positives, 6);
  assert_eq!(result.accuracy, 1.0);
}

#[tokio::test(start_paused = true)]
async fn partition_shows_up_as_false_positives() {
  let mut sim = assert_ok!(Simulator::new(config()));
  // master and worker0 on one side, worker1 and worker2 on the other.
  let result =
    assert_ok!(sim.network_partition(Protocol::Heartbeat, 4).await);
  assert!(result.converged);
  assert_eq!(result.false_positives, 2);
  assert_eq!(result.false_negatives, 0);
  assert_eq!(result.accuracy, 0.0);
  assert!(result.detection_time_ms < 5000.0);

  let result = assert_ok!(sim.network_partition(Protocol::Gossip, 4).await);
  assert!(result.converged);
  assert_eq!(result.false_positives, 8);
}

#[tokio::test(start_paused = true)]
async fn high_load_keeps_views_clean() {
  let mut sim = assert_ok!(Simulator::new(config()));
  let result = assert_ok!(sim.high_load(Protocol::Heartbeat, 4).await);
  assert!(result.converged);
  assert_eq!(result.false_positives, 0);
  assert_eq!(result.accuracy, 1.0);
  assert!(result.messages_sent >= 200);
  // 200 messages in batches of 10, one batch per 50ms poll.
  assert!(result.detection_time_ms >= 1000.0);
}

#[tokio::test(start_paused = true)]
async fn revived_node_is_cleared() {
  let mut sim = assert_ok!(Simulator::new(config()));
  for protocol in Protocol::ALL {
    let result = assert_ok!(sim.recovery(protocol, 4).await);
    assert!(result.converged, "{:?}", result);
    assert_eq!(result.accuracy, 1.0, "{:?}", result);
  }
}

#[tokio::test(start_paused = true)]
async fn compare_runs_everything_twice() {
  let mut sim = assert_ok!(Simulator::new(config()));
  let results = assert_ok!(sim.compare_algorithms(3).await);
  assert_eq!(results.len(), 10);
  for protocol in Protocol::ALL {
    assert_eq!(
      results
        .iter()
        .filter(|r| r.protocol == Some(protocol))
        .count(),
      5
    );
  }
}
