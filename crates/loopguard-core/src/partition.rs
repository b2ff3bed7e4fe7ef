//! Partition management: which signal indices belong to the closed core `C`
//! versus the exchange boundary `Ex`, and the streak-hysteresis governing how
//! `C` is allowed to regrow.
//!
//! Grounded on `lmeas/partition.py`. Channels are plain indices into
//! `0..n_signals`, not names — the mapping from index to a human-readable
//! channel name lives one layer up, in the telemetry window.

use serde::{Deserialize, Serialize};

/// A channel partition over `0..n_signals`: core (`c`) vs exchange (`ex`),
/// plus bookkeeping for how many times it has flipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub c: Vec<usize>,
    pub ex: Vec<usize>,
    pub frozen: bool,
    pub flips: u64,
}

/// Detail recorded about the most recent committed regrowth, for audit
/// logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlipInfo {
    pub streak: u32,
    pub delta_m_db: f64,
    pub new_c: Vec<usize>,
}

/// Tracks a partition across windows and applies the regrowth hysteresis: a
/// suggested core set must repeat (modulo the committed one) for
/// `consecutive_required` calls in a row, each clearing `delta_m_min_db`,
/// before it is actually adopted.
#[derive(Debug, Clone)]
pub struct PartitionManager {
    n_signals: usize,
    partition: Partition,
    pending: Option<Vec<usize>>,
    streak: u32,
    last_flip_info: Option<FlipInfo>,
    last_m_db: Option<f64>,
}

impl PartitionManager {
    pub fn new(n_signals: usize, seed_c: impl IntoIterator<Item = usize>) -> Self {
        let mut c: Vec<usize> = seed_c.into_iter().filter(|&i| i < n_signals).collect();
        c.sort_unstable();
        c.dedup();
        let ex = complement(n_signals, &c);
        Self {
            n_signals,
            partition: Partition { c, ex, frozen: false, flips: 0 },
            pending: None,
            streak: 0,
            last_flip_info: None,
            last_m_db: None,
        }
    }

    pub fn get(&self) -> &Partition {
        &self.partition
    }

    pub fn freeze(&mut self, on: bool) {
        self.partition.frozen = on;
    }

    pub fn last_flip_info(&self) -> Option<&FlipInfo> {
        self.last_flip_info.as_ref()
    }

    /// Record the most recent margin for diagnostic purposes — a pure
    /// bookkeeping operation, never consulted by [`Self::maybe_regrow`]'s own
    /// hysteresis (the caller passes `delta_m_db` explicitly for that).
    pub fn update_current_m(&mut self, m_db: f64) {
        self.last_m_db = Some(m_db);
    }

    /// The most recent margin recorded via [`Self::update_current_m`], if any.
    pub fn current_m_db(&self) -> Option<f64> {
        self.last_m_db
    }

    /// Consider regrowing `C` to `suggested_c`. `delta_m_db` is the change in
    /// margin the candidate would have produced over the committed `C` at the
    /// time it was scored.
    ///
    /// No-op while frozen. The suggestion is sorted and deduped first; if it
    /// equals the already-committed `C`, the pending streak resets (nothing
    /// to converge toward). Otherwise: if it matches what's already pending
    /// (or nothing is pending yet) and clears `delta_m_min_db`, the streak
    /// increments; any other suggestion restarts the streak at 0 or 1
    /// depending on whether it itself clears the threshold. Once the streak
    /// reaches `consecutive_required`, the suggestion commits and `Ex` is
    /// recomputed as the complement.
    pub fn maybe_regrow(
        &mut self,
        suggested_c: &[usize],
        delta_m_db: f64,
        delta_m_min_db: f64,
        consecutive_required: u32,
    ) -> bool {
        if self.partition.frozen {
            return false;
        }

        let mut new_c: Vec<usize> = suggested_c.to_vec();
        new_c.sort_unstable();
        new_c.dedup();

        if new_c == self.partition.c {
            self.pending = None;
            self.streak = 0;
            return false;
        }

        let clears = delta_m_db >= delta_m_min_db;
        if clears && self.pending.as_ref().is_none_or(|p| *p == new_c) {
            self.pending = Some(new_c.clone());
            self.streak += 1;
        } else {
            self.pending = Some(new_c.clone());
            self.streak = u32::from(clears);
        }

        if self.streak >= consecutive_required {
            self.last_flip_info = Some(FlipInfo {
                streak: self.streak,
                delta_m_db,
                new_c: new_c.clone(),
            });
            self.partition.ex = complement(self.n_signals, &new_c);
            self.partition.c = new_c;
            self.partition.flips += 1;
            self.pending = None;
            self.streak = 0;
            return true;
        }

        false
    }
}

fn complement(n_signals: usize, c: &[usize]) -> Vec<usize> {
    (0..n_signals).filter(|i| !c.contains(i)).collect()
}

/// Greedily suggest a core set `C` from per-channel incremental contribution
/// scores: repeatedly admit the index whose marginal score is highest,
/// stopping once the best remaining marginal score drops below `theta` or
/// `kappa` channels have been admitted. Ties are broken by the smaller index.
pub fn greedy_suggest_c(scores: &[(usize, f64)], theta: f64, kappa: usize) -> Vec<usize> {
    let mut sorted: Vec<(usize, f64)> = scores.to_vec();
    sorted.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });

    let mut chosen = Vec::new();
    for (idx, score) in sorted {
        if chosen.len() >= kappa {
            break;
        }
        if score < theta {
            break;
        }
        chosen.push(idx);
    }
    chosen.sort_unstable();
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_partition_splits_complement() {
        let pm = PartitionManager::new(5, [0, 2]);
        assert_eq!(pm.get().c, vec![0, 2]);
        assert_eq!(pm.get().ex, vec![1, 3, 4]);
    }

    #[test]
    fn update_current_m_is_diagnostic_only() {
        let mut pm = PartitionManager::new(4, [0]);
        assert_eq!(pm.current_m_db(), None);
        pm.update_current_m(6.5);
        assert_eq!(pm.current_m_db(), Some(6.5));
        // Does not itself influence regrowth hysteresis.
        assert!(!pm.maybe_regrow(&[0, 1], 0.0, 0.5, 1));
    }

    #[test]
    fn frozen_partition_never_regrows() {
        let mut pm = PartitionManager::new(4, [0]);
        pm.freeze(true);
        for _ in 0..10 {
            assert!(!pm.maybe_regrow(&[0, 1], 10.0, 0.5, 1));
        }
        assert_eq!(pm.get().c, vec![0]);
    }

    #[test]
    fn suggestion_matching_current_c_resets_streak() {
        let mut pm = PartitionManager::new(4, [0, 1]);
        assert!(!pm.maybe_regrow(&[1, 0], 10.0, 0.5, 3));
    }

    #[test]
    fn streak_must_repeat_consecutively_before_commit() {
        let mut pm = PartitionManager::new(4, [0]);
        assert!(!pm.maybe_regrow(&[0, 2], 1.0, 0.5, 3));
        assert!(!pm.maybe_regrow(&[0, 2], 1.0, 0.5, 3));
        assert!(pm.maybe_regrow(&[0, 2], 1.0, 0.5, 3));
        assert_eq!(pm.get().c, vec![0, 2]);
        assert_eq!(pm.get().ex, vec![1, 3]);
        assert_eq!(pm.get().flips, 1);
    }

    #[test]
    fn streak_resets_when_suggestion_changes_mid_run() {
        let mut pm = PartitionManager::new(5, [0]);
        assert!(!pm.maybe_regrow(&[0, 1], 1.0, 0.5, 3));
        assert!(!pm.maybe_regrow(&[0, 2], 1.0, 0.5, 3));
        assert!(!pm.maybe_regrow(&[0, 2], 1.0, 0.5, 3));
        assert!(pm.maybe_regrow(&[0, 2], 1.0, 0.5, 3));
    }

    #[test]
    fn sub_threshold_delta_never_accumulates_streak() {
        let mut pm = PartitionManager::new(4, [0]);
        for _ in 0..5 {
            assert!(!pm.maybe_regrow(&[0, 1], 0.1, 0.5, 3));
        }
        assert_eq!(pm.get().c, vec![0]);
    }

    #[test]
    fn greedy_suggest_respects_theta_and_kappa() {
        let scores = vec![(0, 10.0), (1, 5.0), (2, 0.1), (3, 8.0)];
        let chosen = greedy_suggest_c(&scores, 1.0, 2);
        assert_eq!(chosen, vec![0, 3]);
    }

    #[test]
    fn greedy_suggest_breaks_ties_by_smaller_index() {
        let scores = vec![(3, 5.0), (1, 5.0), (2, 5.0)];
        let chosen = greedy_suggest_c(&scores, 0.0, 2);
        assert_eq!(chosen, vec![1, 2]);
    }
}
