//! The peer-table wire format exchanged between gossip nodes.
//!
//! A table is a list of records separated by `;`. Each record is
//! `id:alive:last_seen`, where `alive` is `0` or `1` and `last_seen` is whole
//! seconds since the unix epoch:
//!
//! ```text
//! node0:1:1700000000;node1:0:1699999990;node2:1:1700000001
//! ```
//!
//! Decoding is lenient per record: a record that is short of fields, has a
//! bad flag or a non-numeric timestamp is skipped, and the rest of the table
//! is still used.

use crate::core::{NodeId, Timestamp};
use itertools::Itertools;
use tracing::trace;

pub const RECORD_SEP: char = ';';
pub const FIELD_SEP: char = ':';

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
  pub id: NodeId,
  pub alive: bool,
  /// Always a whole number of seconds.
  pub last_seen: Timestamp,
}

pub fn encode<'a, I>(records: I) -> String
where
  I: IntoIterator<Item = (&'a str, bool, Timestamp)>,
{
  records
    .into_iter()
    .map(|(id, alive, last_seen)| {
      format!(
        "{}{}{}{}{}",
        id,
        FIELD_SEP,
        alive as u8,
        FIELD_SEP,
        last_seen.as_secs()
      )
    })
    .join(&RECORD_SEP.to_string())
}

pub fn decode(payload: &str) -> Vec<PeerRecord> {
  payload
    .split(RECORD_SEP)
    .filter(|r| !r.trim().is_empty())
    .filter_map(|r| {
      let rec = decode_record(r);
      if rec.is_none() {
        trace!(record = r, "skipping malformed peer record");
      }
      rec
    })
    .collect()
}

fn decode_record(record: &str) -> Option<PeerRecord> {
  // Fields past the third are ignored.
  let mut fields = record.split(FIELD_SEP);
  let id = fields.next()?.trim();
  let alive = match fields.next()?.trim() {
    "1" => true,
    "0" => false,
    _ => return None,
  };
  let secs = fields.next()?.trim().parse::<u64>().ok()?;
  if id.is_empty() {
    return None;
  }
  Some(PeerRecord {
    id: id.to_string(),
    alive: alive,
    last_seen: Timestamp::from_secs(secs),
  })
}

#[test]
fn test_encode_table() {
  let table = vec![
    ("node0", true, Timestamp::from_millis(1_700_000_000_999)),
    ("node1", false, Timestamp::from_secs(1_699_999_990)),
  ];
  assert_eq!(encode(table), "node0:1:1700000000;node1:0:1699999990");
  assert_eq!(encode(Vec::new()), "");
}

#[test]
fn test_decode_skips_bad_records() {
  let payload = "node0:1:100;garbage;node1:x:5;node2:0:abc;:1:7;\
                 node3:0:42:extra;;node4:1:9;";
  let recs = decode(payload);
  assert_eq!(
    recs,
    vec![
      PeerRecord {
        id: "node0".to_string(),
        alive: true,
        last_seen: Timestamp::from_secs(100),
      },
      PeerRecord {
        id: "node3".to_string(),
        alive: false,
        last_seen: Timestamp::from_secs(42),
      },
      PeerRecord {
        id: "node4".to_string(),
        alive: true,
        last_seen: Timestamp::from_secs(9),
      },
    ]
  );
  assert!(decode("test_message").is_empty());
  assert!(decode("").is_empty());
}
