//! Reshuffle: deterministic merge of a foreign batch into a local stream.
//!
//! Existing rows are never rewritten. Foreign operations that overlap the
//! local head are re-sequenced after it, in (timestamp, op id) order, with
//! the first one carrying a `skip` over the local rows it supersedes.

use std::collections::HashSet;

use reactor_store::Operation;

use crate::error::{ReactorError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ReshufflePlan {
    /// Local revision the plan appends after.
    pub head: u64,
    /// Rows to append, indices `head..head + len`.
    pub operations: Vec<Operation>,
    /// Incoming operations dropped because their op id is already present.
    pub duplicates: usize,
    /// True when the batch overlapped local history.
    pub reshuffled: bool,
}

/// Plan how `incoming` lands on top of `local` (index ordered).
pub fn plan_load(
    local: &[Operation],
    incoming: Vec<Operation>,
    max_skip_threshold: u64,
) -> Result<ReshufflePlan> {
    let head = local.last().map(|op| op.index + 1).unwrap_or(0);
    let mut seen: HashSet<String> = local.iter().map(|op| op.op_id.clone()).collect();

    let total = incoming.len();
    let mut fresh: Vec<Operation> = incoming
        .into_iter()
        .filter(|op| seen.insert(op.op_id.clone()))
        .collect();
    let duplicates = total - fresh.len();

    if fresh.is_empty() {
        return Ok(ReshufflePlan {
            head,
            operations: Vec::new(),
            duplicates,
            reshuffled: false,
        });
    }

    let lowest_conflict = fresh.iter().map(|op| op.index).filter(|i| *i < head).min();

    let Some(lowest_conflict) = lowest_conflict else {
        fresh.sort_by_key(|op| op.index);
        for (i, op) in fresh.iter().enumerate() {
            let expected = head + i as u64;
            if op.index != expected {
                return Err(ReactorError::IndexGap {
                    expected,
                    found: op.index,
                });
            }
        }
        return Ok(ReshufflePlan {
            head,
            operations: fresh,
            duplicates,
            reshuffled: false,
        });
    };

    let skip = head - lowest_conflict;
    if skip > max_skip_threshold {
        return Err(ReactorError::ExcessiveReshuffle {
            skip,
            threshold: max_skip_threshold,
        });
    }

    fresh.sort_by(|a, b| {
        a.timestamp_utc
            .cmp(&b.timestamp_utc)
            .then_with(|| a.op_id.cmp(&b.op_id))
    });
    for (i, op) in fresh.iter_mut().enumerate() {
        op.index = head + i as u64;
        op.skip = if i == 0 { skip } else { 0 };
        op.prev_op_id = None;
    }

    Ok(ReshufflePlan {
        head,
        operations: fresh,
        duplicates,
        reshuffled: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use reactor_store::{visible_operations, Action};
    use serde_json::json;

    fn op(id: &str, index: u64, secs: i64) -> Operation {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs);
        Operation {
            op_id: id.to_string(),
            prev_op_id: None,
            index,
            skip: 0,
            hash: format!("h-{id}"),
            timestamp_utc: ts,
            action: Action::new(id, "SET_NAME", "global", json!({"name": id})).with_timestamp(ts),
            resulting_state: None,
            error: None,
        }
    }

    fn shape(plan: &ReshufflePlan) -> Vec<(String, u64, u64)> {
        plan.operations
            .iter()
            .map(|o| (o.op_id.clone(), o.index, o.skip))
            .collect()
    }

    #[test]
    fn beyond_head_is_a_pure_append() {
        let local = vec![op("a", 0, 0), op("b", 1, 1)];
        let plan = plan_load(&local, vec![op("d", 3, 3), op("c", 2, 2)], 1000).unwrap();
        assert!(!plan.reshuffled);
        assert_eq!(
            shape(&plan),
            vec![("c".into(), 2, 0), ("d".into(), 3, 0)]
        );
    }

    #[test]
    fn gap_beyond_head_is_rejected() {
        let local = vec![op("a", 0, 0)];
        let err = plan_load(&local, vec![op("c", 2, 2)], 1000).unwrap_err();
        assert!(matches!(err, ReactorError::IndexGap { expected: 1, found: 2 }));
    }

    #[test]
    fn overlap_appends_after_head_with_skip() {
        // Local B@0, foreign A@0 written earlier.
        let local = vec![op("b", 0, 10)];
        let plan = plan_load(&local, vec![op("a", 0, 5)], 1000).unwrap();
        assert!(plan.reshuffled);
        assert_eq!(shape(&plan), vec![("a".into(), 1, 1)]);

        let mut merged = local.clone();
        merged.extend(plan.operations);
        let visible = visible_operations(&merged);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].op_id, "a");
    }

    #[test]
    fn skip_counts_rows_back_to_the_lowest_conflict() {
        let local = vec![op("l0", 0, 0), op("l1", 1, 1), op("l2", 2, 2)];
        let plan = plan_load(&local, vec![op("r2", 2, 9), op("r1", 1, 8)], 1000).unwrap();
        assert_eq!(
            shape(&plan),
            vec![("r1".into(), 3, 2), ("r2".into(), 4, 0)]
        );
    }

    #[test]
    fn known_op_ids_are_dropped() {
        let local = vec![op("a", 0, 0)];
        let plan = plan_load(&local, vec![op("a", 0, 0), op("b", 1, 1), op("b", 1, 1)], 1000).unwrap();
        assert_eq!(plan.duplicates, 2);
        assert_eq!(shape(&plan), vec![("b".into(), 1, 0)]);

        let again = plan_load(&local, vec![op("a", 0, 0)], 1000).unwrap();
        assert!(again.operations.is_empty());
    }

    #[test]
    fn plan_is_independent_of_arrival_order() {
        let local = vec![op("l0", 0, 0), op("l1", 1, 1)];
        let batch = vec![op("x", 0, 5), op("y", 1, 5), op("z", 2, 3)];

        let forward = plan_load(&local, batch.clone(), 1000).unwrap();
        let mut reversed = batch.clone();
        reversed.reverse();
        let backward = plan_load(&local, reversed, 1000).unwrap();
        let rotated = vec![batch[1].clone(), batch[2].clone(), batch[0].clone()];
        let rotated = plan_load(&local, rotated, 1000).unwrap();

        assert_eq!(forward, backward);
        assert_eq!(forward, rotated);
        // Equal timestamps fall back to op id.
        assert_eq!(
            shape(&forward),
            vec![("z".into(), 2, 2), ("x".into(), 3, 0), ("y".into(), 4, 0)]
        );
    }

    #[test]
    fn excessive_skip_is_refused() {
        let local: Vec<Operation> = (0..5).map(|i| op(&format!("l{i}"), i, i as i64)).collect();
        let err = plan_load(&local, vec![op("r", 0, 99)], 3).unwrap_err();
        assert!(matches!(
            err,
            ReactorError::ExcessiveReshuffle { skip: 5, threshold: 3 }
        ));
    }
}
