use crate::core::{NodeId, Timestamp};
use hashbrown::HashMap;

pub type PartitionId = usize;

/// Which side of a split every partitioned node is on.
///
/// Two nodes can talk iff they share a partition id, or at least one of them
/// is in no group, or the partition has lapsed.
#[derive(Clone, Debug)]
pub struct PartitionMap {
  groups: HashMap<NodeId, PartitionId>,
  expires_at: Timestamp,
}
impl PartitionMap {
  /// Group `i` of `groups` becomes partition `i`. An id listed in several
  /// groups ends up in the last one.
  pub fn new(groups: &[Vec<NodeId>], expires_at: Timestamp) -> PartitionMap {
    let groups = groups
      .iter()
      .enumerate()
      .flat_map(|(pid, group)| group.iter().map(move |id| (id.clone(), pid)))
      .collect();
    PartitionMap {
      groups: groups,
      expires_at: expires_at,
    }
  }

  pub fn partition_of(&self, id: &str) -> Option<PartitionId> {
    self.groups.get(id).copied()
  }

  pub fn expires_at(&self) -> Timestamp {
    self.expires_at
  }

  pub fn is_active(&self, now: Timestamp) -> bool {
    now < self.expires_at
  }

  pub fn reachable(&self, from: &str, to: &str, now: Timestamp) -> bool {
    if !self.is_active(now) {
      return true;
    }
    match (self.partition_of(from), self.partition_of(to)) {
      (Some(a), Some(b)) => a == b,
      _ => true,
    }
  }
}

#[test]
fn test_every_member_is_keyed() {
  let ids = |xs: &[&str]| xs.iter().map(|x| x.to_string()).collect::<Vec<_>>();
  let map = PartitionMap::new(
    &[ids(&["a", "b", "c"]), ids(&["d", "e"])],
    Timestamp::from_secs(10),
  );
  let now = Timestamp::from_secs(5);
  // Not just the first member of each group.
  assert!(!map.reachable("c", "e", now));
  assert!(!map.reachable("e", "b", now));
  assert!(map.reachable("b", "c", now));
  assert!(map.reachable("d", "e", now));
  assert!(map.reachable("z", "a", now));
  assert_eq!(map.partition_of("c"), Some(0));
  assert_eq!(map.partition_of("d"), Some(1));
  assert_eq!(map.partition_of("z"), None);
  // Lapsed.
  assert!(map.reachable("c", "e", Timestamp::from_secs(10)));
}
