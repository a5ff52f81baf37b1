//! The four-case sequence-reconciliation algorithm (§4.E.2), factored out as
//! a pure function so it can be exercised without touching the filesystem.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub new_sequence: i64,
    pub new_pending_offset: i64,
    pub delete_old_messages: bool,
    pub resync: bool,
}

/// Computes the next `(sequence, pending_offset)` pair given the server's
/// reported `next_expected_sequence`, the client's current `sequence`,
/// `pending_offset`, and `count_pending` (the number of unflagged pending
/// messages at or beyond `pending_offset`).
pub fn reconcile(
    next_expected_sequence: i64,
    sequence: i64,
    pending_offset: i64,
    count_pending: i64,
) -> Outcome {
    let delta = next_expected_sequence - sequence;

    if next_expected_sequence < sequence - pending_offset {
        // Ancient: server wants messages we've already discarded.
        return Outcome {
            new_sequence: next_expected_sequence,
            new_pending_offset: 0,
            delete_old_messages: false,
            resync: true,
        };
    }

    if delta > count_pending {
        // Future: server acknowledged messages we never sent.
        return Outcome {
            new_sequence: next_expected_sequence,
            new_pending_offset: count_pending,
            delete_old_messages: true,
            resync: true,
        };
    }

    if delta >= 0 {
        // Regular progress.
        return Outcome {
            new_sequence: next_expected_sequence,
            new_pending_offset: delta,
            delete_old_messages: true,
            resync: false,
        };
    }

    // Old: sequence - pending_offset <= next_expected_sequence < sequence.
    Outcome {
        new_sequence: next_expected_sequence,
        new_pending_offset: pending_offset + delta,
        delete_old_messages: false,
        resync: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_progress_acknowledges_a_prefix() {
        let outcome = reconcile(4, 0, 0, 10);
        assert_eq!(
            outcome,
            Outcome {
                new_sequence: 4,
                new_pending_offset: 4,
                delete_old_messages: true,
                resync: false,
            }
        );
    }

    #[test]
    fn second_batch_triggers_delete_of_first() {
        // sequence=4, pending_offset=4 (from the previous batch), ten
        // messages total, five more sent and acked up to 9.
        let outcome = reconcile(9, 4, 4, 6);
        assert_eq!(outcome.new_sequence, 9);
        assert_eq!(outcome.new_pending_offset, 5);
        assert!(outcome.delete_old_messages);
        assert!(!outcome.resync);
    }

    #[test]
    fn old_case_rewinds_pending_offset_without_deleting() {
        // sequence=9, pending_offset=5, server only saw up to 6.
        let outcome = reconcile(6, 9, 5, 2);
        assert_eq!(outcome.new_sequence, 6);
        assert_eq!(outcome.new_pending_offset, 2);
        assert!(!outcome.delete_old_messages);
        assert!(!outcome.resync);
    }

    #[test]
    fn ancient_case_resyncs_from_scratch() {
        let outcome = reconcile(1, 9, 5, 2);
        assert_eq!(outcome.new_sequence, 1);
        assert_eq!(outcome.new_pending_offset, 0);
        assert!(outcome.resync);
    }

    #[test]
    fn future_case_clamps_and_resyncs() {
        let outcome = reconcile(100, 0, 0, 3);
        assert_eq!(outcome.new_sequence, 100);
        assert_eq!(outcome.new_pending_offset, 3);
        assert!(outcome.delete_old_messages);
        assert!(outcome.resync);
    }
}
