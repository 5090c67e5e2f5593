use crate::core::NodeId;
use std::collections::{BTreeMap, BTreeSet};

/// Agreement between reported failure views and ground truth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Score {
  pub true_positives: u64,
  pub false_positives: u64,
  pub false_negatives: u64,
}
impl Score {
  /// Scores what `observer` reports against `truth` (id → alive). Ids
  /// missing from `truth` count as alive. The observer is never expected to
  /// report itself.
  pub fn add_view(
    &mut self,
    observer: &str,
    reported: &BTreeSet<NodeId>,
    truth: &BTreeMap<NodeId, bool>,
  ) {
    for id in reported {
      match truth.get(id) {
        Some(false) => self.true_positives += 1,
        _ => self.false_positives += 1,
      }
    }
    self.false_negatives += truth
      .iter()
      .filter(|(id, alive)| {
        !**alive && id.as_str() != observer && !reported.contains(*id)
      })
      .count() as u64;
  }

  pub fn accuracy(&self) -> f64 {
    calculate_accuracy(
      self.true_positives,
      self.false_positives,
      self.false_negatives,
    )
  }
}

/// `tp / (tp + fp + fn)`, or 1 when there was nothing to get right or wrong.
pub fn calculate_accuracy(
  true_positives: u64,
  false_positives: u64,
  false_negatives: u64,
) -> f64 {
  let total = true_positives + false_positives + false_negatives;
  if total == 0 {
    1.0
  } else {
    true_positives as f64 / total as f64
  }
}

#[cfg(test)]
use maplit::{btreemap, btreeset};

#[test]
fn test_score_against_ground_truth() {
  let truth = btreemap! {
    "a".to_string() => true,
    "b".to_string() => true,
    "c".to_string() => false,
    "d".to_string() => false,
  };
  let mut score = Score::default();
  // Right about c, wrong about b, misses d.
  score.add_view("a", &btreeset! {"b".to_string(), "c".to_string()}, &truth);
  assert_eq!(
    score,
    Score {
      true_positives: 1,
      false_positives: 1,
      false_negatives: 1,
    }
  );
  assert!((score.accuracy() - 1.0 / 3.0).abs() < 1e-9);

  // A perfect view adds only true positives.
  score.add_view("b", &btreeset! {"c".to_string(), "d".to_string()}, &truth);
  assert_eq!(score.true_positives, 3);
  assert_eq!(score.false_positives, 1);
  assert_eq!(score.false_negatives, 1);
}

#[test]
fn test_perfect_agreement_is_fully_accurate() {
  let truth = btreemap! {
    "a".to_string() => true,
    "b".to_string() => true,
  };
  let mut score = Score::default();
  score.add_view("a", &BTreeSet::new(), &truth);
  score.add_view("b", &BTreeSet::new(), &truth);
  assert_eq!(score, Score::default());
  assert_eq!(score.accuracy(), 1.0);
  assert_eq!(calculate_accuracy(0, 0, 0), 1.0);
  assert_eq!(calculate_accuracy(3, 1, 0), 0.75);
}
