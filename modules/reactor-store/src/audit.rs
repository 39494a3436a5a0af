//! Visible-log computation and integrity checks over one stream.

use serde::Serialize;

use crate::types::Operation;

/// The operations that remain after superseded rows are dropped.
///
/// `ops` must be ordered by index. Walking backwards, an operation at index
/// `i` with skip `s` hides every earlier row whose index is in `[i - s, i - 1]`.
pub fn visible_operations(ops: &[Operation]) -> Vec<Operation> {
    let mut kept = Vec::with_capacity(ops.len());
    let mut i = ops.len();
    while i > 0 {
        let op = &ops[i - 1];
        kept.push(op.clone());
        let skip_until = op.index as i64 - op.skip as i64 - 1;
        let mut j = i - 1;
        while j > 0 && ops[j - 1].index as i64 > skip_until {
            j -= 1;
        }
        i = j;
    }
    kept.reverse();
    kept
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityIssue {
    /// Two rows share an index.
    DuplicateIndex { index: u64 },
    /// A row is missing from the physical log.
    MissingIndex { expected: u64, found: u64 },
    /// `prev_op_id` does not name the row before it.
    BrokenChain {
        index: u64,
        expected: Option<String>,
        found: Option<String>,
    },
    /// A visible row does not continue from the visible row before it.
    InvalidSkip { index: u64, skip: u64 },
}

/// Report every integrity violation in an index-ordered stream.
pub fn audit_operations(ops: &[Operation]) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();

    let mut expected_index = 0u64;
    let mut prev: Option<&Operation> = None;
    for op in ops {
        if let Some(p) = prev {
            if p.index == op.index {
                issues.push(IntegrityIssue::DuplicateIndex { index: op.index });
                continue;
            }
        }
        if op.index != expected_index {
            issues.push(IntegrityIssue::MissingIndex {
                expected: expected_index,
                found: op.index,
            });
        }
        let expected_prev = prev.map(|p| p.op_id.clone());
        if op.prev_op_id != expected_prev {
            issues.push(IntegrityIssue::BrokenChain {
                index: op.index,
                expected: expected_prev,
                found: op.prev_op_id.clone(),
            });
        }
        expected_index = op.index + 1;
        prev = Some(op);
    }

    let mut last_visible: i64 = -1;
    for op in visible_operations(ops) {
        if op.index as i64 - op.skip as i64 != last_visible + 1 {
            issues.push(IntegrityIssue::InvalidSkip {
                index: op.index,
                skip: op.skip,
            });
        }
        last_visible = op.index as i64;
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Action;
    use chrono::Utc;
    use serde_json::json;

    fn op(index: u64, skip: u64) -> Operation {
        Operation {
            op_id: format!("op-{index}"),
            prev_op_id: index.checked_sub(1).map(|p| format!("op-{p}")),
            index,
            skip,
            hash: String::new(),
            timestamp_utc: Utc::now(),
            action: Action::new(format!("a-{index}"), "SET", "global", json!({})),
            resulting_state: None,
            error: None,
        }
    }

    fn indices(ops: &[Operation]) -> Vec<u64> {
        ops.iter().map(|o| o.index).collect()
    }

    #[test]
    fn no_skips_keeps_everything() {
        let ops = vec![op(0, 0), op(1, 0), op(2, 0)];
        assert_eq!(indices(&visible_operations(&ops)), vec![0, 1, 2]);
    }

    #[test]
    fn skip_hides_superseded_rows() {
        let ops = vec![op(0, 0), op(1, 0), op(2, 0), op(3, 2), op(4, 0)];
        assert_eq!(indices(&visible_operations(&ops)), vec![0, 3, 4]);
    }

    #[test]
    fn skip_can_hide_the_first_row() {
        let ops = vec![op(0, 0), op(1, 1)];
        assert_eq!(indices(&visible_operations(&ops)), vec![1]);
    }

    #[test]
    fn clean_log_has_no_issues() {
        let ops = vec![op(0, 0), op(1, 0), op(2, 2), op(3, 0)];
        assert!(audit_operations(&ops).is_empty());
    }

    #[test]
    fn audit_reports_duplicate_and_missing() {
        let ops = vec![op(0, 0), op(0, 0), op(2, 0)];
        let issues = audit_operations(&ops);
        assert!(issues.contains(&IntegrityIssue::DuplicateIndex { index: 0 }));
        assert!(issues.contains(&IntegrityIssue::MissingIndex {
            expected: 1,
            found: 2
        }));
    }

    #[test]
    fn audit_reports_broken_chain() {
        let mut second = op(1, 0);
        second.prev_op_id = Some("elsewhere".into());
        let issues = audit_operations(&[op(0, 0), second]);
        assert_eq!(
            issues,
            vec![IntegrityIssue::BrokenChain {
                index: 1,
                expected: Some("op-0".into()),
                found: Some("elsewhere".into()),
            }]
        );
    }

    #[test]
    fn audit_reports_skip_reaching_before_start() {
        let issues = audit_operations(&[op(0, 0), op(1, 3)]);
        assert_eq!(issues, vec![IntegrityIssue::InvalidSkip { index: 1, skip: 3 }]);
    }
}
