//! The ledger range a replay task covers.

use crate::ledger::{Hash, Reason};

/// The range of a replay task.
///
/// A new parameter only knows its last ledger and length. Once the skip list
/// arrives, [`TaskParameter::update`] fills in the rest of the range.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskParameter {
    reason: Reason,
    finish_hash: Hash,
    finish_seq: u32,
    total_ledgers: u32,
    start_hash: Hash,
    start_seq: u32,
    skip_list: Vec<Hash>,
    full: bool,
}

impl TaskParameter {
    /// Creates a parameter for `total_ledgers` ledgers ending at `finish_hash`.
    pub fn new(reason: Reason, finish_hash: Hash, total_ledgers: u32) -> Self {
        debug_assert!(total_ledgers > 0, "replay tasks contain at least one ledger");

        Self {
            reason,
            finish_hash,
            finish_seq: 0,
            total_ledgers,
            start_hash: Hash::ZERO,
            start_seq: 0,
            skip_list: Vec::new(),
            full: false,
        }
    }

    /// Completes the range using the skip list of the last ledger.
    ///
    /// `skip_list` holds the ledgers before `hash`, oldest first.
    ///
    /// Returns `false` if the parameter is already full, if `hash` isn't the
    /// last ledger of the range, or if the skip list is too short to cover it.
    pub fn update(&mut self, hash: Hash, seq: u32, skip_list: &[Hash]) -> bool {
        if self.full || hash != self.finish_hash {
            return false;
        }

        let total = self.total_ledgers as usize;
        if skip_list.len() + 1 < total || (seq as usize) + 1 < total {
            return false;
        }

        self.finish_seq = seq;
        self.skip_list = skip_list.to_vec();
        self.skip_list.push(hash);
        self.start_hash = self.skip_list[self.skip_list.len() - total];
        self.start_seq = seq - (self.total_ledgers - 1);
        self.full = true;

        true
    }

    /// Returns `true` if a task for `existing` would also replay every ledger
    /// this parameter asks for, for the same reason.
    pub fn can_merge_into(&self, existing: &TaskParameter) -> bool {
        // An existing range isn't known until its skip list arrives, and might never be.
        if self.reason != existing.reason || !existing.full {
            return false;
        }

        // The distance from our last ledger to the end of the existing range.
        let Some(distance) = existing
            .skip_list
            .iter()
            .rev()
            .position(|hash| *hash == self.finish_hash)
        else {
            return false;
        };

        existing.total_ledgers as usize >= self.total_ledgers as usize + distance
    }

    /// Why the ledgers are being replayed.
    pub fn reason(&self) -> Reason {
        self.reason
    }

    /// The hash of the last ledger in the range.
    pub fn finish_hash(&self) -> Hash {
        self.finish_hash
    }

    /// The sequence number of the last ledger, once full.
    pub fn finish_seq(&self) -> u32 {
        self.finish_seq
    }

    /// The number of ledgers in the range, including both ends.
    pub fn total_ledgers(&self) -> u32 {
        self.total_ledgers
    }

    /// The hash of the first ledger, once full.
    pub fn start_hash(&self) -> Hash {
        self.start_hash
    }

    /// The sequence number of the first ledger, once full.
    pub fn start_seq(&self) -> u32 {
        self.start_seq
    }

    /// The ancestors of the last ledger, oldest first, ending with the last ledger.
    pub fn skip_list(&self) -> &[Hash] {
        &self.skip_list
    }

    /// Returns `true` once the whole range is known.
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// The hashes and sequence numbers of the ledgers after the first one.
    ///
    /// Empty until the parameter is full.
    pub fn delta_ledgers(&self) -> impl Iterator<Item = (Hash, u32)> + '_ {
        let first = if self.full {
            self.skip_list.len() + 1 - self.total_ledgers as usize
        } else {
            self.skip_list.len()
        };

        self.skip_list[first..]
            .iter()
            .copied()
            .zip((self.start_seq..=self.finish_seq).skip(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(n: u8) -> Vec<Hash> {
        (1..=n).map(|i| Hash([i; 32])).collect()
    }

    #[test]
    fn update_fills_in_the_range() {
        ledger_replay_test::init();

        let list = hashes(9);
        let finish = Hash([10; 32]);

        let mut parameter = TaskParameter::new(Reason::Generic, finish, 4);
        assert!(!parameter.update(Hash([11; 32]), 110, &list));
        assert!(parameter.update(finish, 110, &list));

        assert!(parameter.is_full());
        assert_eq!(parameter.finish_seq(), 110);
        assert_eq!(parameter.start_seq(), 107);
        assert_eq!(parameter.start_hash(), Hash([7; 32]));
        assert_eq!(parameter.skip_list().last(), Some(&finish));

        let deltas: Vec<_> = parameter.delta_ledgers().collect();
        assert_eq!(
            deltas,
            vec![
                (Hash([8; 32]), 108),
                (Hash([9; 32]), 109),
                (finish, 110),
            ]
        );

        // A second update is rejected.
        assert!(!parameter.update(finish, 110, &list));
    }

    #[test]
    fn update_rejects_short_skip_lists() {
        ledger_replay_test::init();

        let finish = Hash([10; 32]);
        let mut parameter = TaskParameter::new(Reason::Generic, finish, 5);
        assert!(!parameter.update(finish, 110, &hashes(3)));
        assert!(!parameter.is_full());

        // Exactly long enough.
        assert!(parameter.update(finish, 110, &hashes(4)));
        assert_eq!(parameter.start_hash(), Hash([1; 32]));
    }

    #[test]
    fn single_ledger_range_has_no_deltas() {
        ledger_replay_test::init();

        let finish = Hash([10; 32]);
        let mut parameter = TaskParameter::new(Reason::History, finish, 1);
        assert!(parameter.update(finish, 50, &hashes(1)));

        assert_eq!(parameter.start_hash(), finish);
        assert_eq!(parameter.start_seq(), 50);
        assert_eq!(parameter.delta_ledgers().count(), 0);
    }

    #[test]
    fn ranges_ending_at_the_last_sequence_number() {
        ledger_replay_test::init();

        let finish = Hash([10; 32]);
        let mut parameter = TaskParameter::new(Reason::Generic, finish, 1);
        assert!(parameter.update(finish, u32::MAX, &hashes(1)));
        assert_eq!(parameter.start_seq(), u32::MAX);
        assert_eq!(parameter.delta_ledgers().count(), 0);

        let mut parameter = TaskParameter::new(Reason::Generic, finish, 3);
        assert!(parameter.update(finish, u32::MAX, &hashes(2)));
        assert_eq!(parameter.start_seq(), u32::MAX - 2);
        assert_eq!(
            parameter.delta_ledgers().collect::<Vec<_>>(),
            vec![(Hash([2; 32]), u32::MAX - 1), (finish, u32::MAX)]
        );
    }

    #[test]
    fn merge_rules() {
        ledger_replay_test::init();

        let list = hashes(9);
        let finish = Hash([10; 32]);

        let mut existing = TaskParameter::new(Reason::Generic, finish, 5);

        // Nothing merges until the existing range is known, even the same request.
        let inner = TaskParameter::new(Reason::Generic, Hash([8; 32]), 3);
        assert!(!inner.can_merge_into(&existing));
        assert!(!TaskParameter::new(Reason::Generic, finish, 5).can_merge_into(&existing));
        assert!(!TaskParameter::new(Reason::Generic, finish, 3).can_merge_into(&existing));

        assert!(existing.update(finish, 110, &list));

        // Same target, shorter or equal range.
        assert!(TaskParameter::new(Reason::Generic, finish, 5).can_merge_into(&existing));
        assert!(TaskParameter::new(Reason::Generic, finish, 3).can_merge_into(&existing));
        assert!(!TaskParameter::new(Reason::Generic, finish, 6).can_merge_into(&existing));
        assert!(!TaskParameter::new(Reason::History, finish, 3).can_merge_into(&existing));

        // Ledgers 106..=108, inside 106..=110.
        assert!(inner.can_merge_into(&existing));
        // Ledgers 105..=108 start before the existing range.
        assert!(!TaskParameter::new(Reason::Generic, Hash([8; 32]), 4).can_merge_into(&existing));
        // Ledger 105 is in the skip list, but not in the range.
        assert!(!TaskParameter::new(Reason::Generic, Hash([5; 32]), 1).can_merge_into(&existing));
        // Unknown ledger.
        assert!(!TaskParameter::new(Reason::Generic, Hash([42; 32]), 1).can_merge_into(&existing));
    }
}
