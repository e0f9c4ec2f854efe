//! Recovering the unseen tail of a growing stdout buffer.
//!
//! The sandbox only exposes its whole stdout, sampled whenever it changes.
//! A sample normally extends the previous one, but the interpreter may also
//! have been cleared and rerun in between, in which case the sample starts
//! from scratch.

/// Outcome of merging a sample into the known transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Merge {
    /// The full transcript after the merge.
    pub merged: String,

    /// What the sample added to the transcript.
    pub fresh: String,
}

/// Merge `sample` into `prev`.
///
/// The longest suffix of `prev` that is also a prefix of the (trimmed)
/// sample is the point where the sample resumes from known history; only
/// what follows it is new. Without any overlap the whole sample is new and
/// is appended on its own line.
pub fn merge(prev: &str, sample: &str) -> Merge {
    let sample = sample.trim();

    // Longest suffix first; the empty suffix never counts as an overlap.
    let overlap = prev
        .char_indices()
        .map(|(i, _)| &prev[i..])
        .find(|suffix| sample.starts_with(suffix))
        .map_or(0, str::len);

    if overlap > 0 {
        let fresh = &sample[overlap..];
        Merge {
            merged: format!("{prev}{fresh}").trim().to_string(),
            fresh: fresh.trim().to_string(),
        }
    } else {
        let separator = if prev.is_empty() { "" } else { "\n" };
        Merge {
            merged: format!("{prev}{separator}{sample}").trim().to_string(),
            fresh: sample.to_string(),
        }
    }
}

/// The reconciled view of a job run's stdout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StdoutHistory {
    /// Everything reconciled so far. Only grows until [`StdoutHistory::reset`].
    pub stdout: String,

    /// The latest increment.
    pub new_stdout: String,

    /// The last increment that was handled.
    pub prev_new_stdout: String,
}

impl StdoutHistory {
    /// Fold a stdout sample into the history.
    ///
    /// Returns `true` if the sample produced a new increment. Empty
    /// samples, samples with nothing new and samples that repeat the latest
    /// increment leave the history untouched.
    pub fn observe(&mut self, sample: &str) -> bool {
        if sample.is_empty() {
            return false;
        }

        let Merge { merged, fresh } = merge(&self.stdout, sample);
        if fresh.is_empty() || fresh == self.new_stdout {
            return false;
        }

        self.stdout = merged;
        self.new_stdout = fresh;
        true
    }

    /// The latest increment, unless it has already been handled.
    pub fn pending(&self) -> Option<&str> {
        let pending = !self.new_stdout.is_empty() && self.new_stdout != self.prev_new_stdout;
        pending.then_some(self.new_stdout.as_str())
    }

    pub fn mark_processed(&mut self) {
        self.prev_new_stdout = self.new_stdout.clone();
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merged(prev: &str, sample: &str) -> (String, String) {
        let Merge { merged, fresh } = merge(prev, sample);
        (merged, fresh)
    }

    #[test]
    fn same_sample_twice_adds_nothing() {
        for s in ["a", "line one\nline two", "MAP EJECUTADO SATISFACTORIAMENTE"] {
            assert_eq!(merged(s, s), (s.to_string(), String::new()));
        }
    }

    #[test]
    fn extension_yields_the_tail() {
        assert_eq!(
            merged("a\nb", "a\nb\nc\n"),
            ("a\nb\nc".to_string(), "c".to_string())
        );
        assert_eq!(
            merged("abc", "abc  def "),
            ("abc  def".to_string(), "def".to_string())
        );
    }

    #[test]
    fn empty_history_takes_whole_sample() {
        assert_eq!(
            merged("", "  first\nsecond \n"),
            ("first\nsecond".to_string(), "first\nsecond".to_string())
        );
    }

    #[test]
    fn unrelated_sample_is_appended() {
        assert_eq!(
            merged("abc", "xyz"),
            ("abc\nxyz".to_string(), "xyz".to_string())
        );
    }

    #[test]
    fn restarted_run_overlapping_the_tail() {
        // The new run's output starts with what the old one ended with.
        assert_eq!(
            merged("x\ndone", "done\ny"),
            ("x\ndone\ny".to_string(), "y".to_string())
        );
    }

    #[test]
    fn multibyte_text() {
        assert_eq!(
            merged("año\nmañana", "mañana\nsí"),
            ("año\nmañana\nsí".to_string(), "sí".to_string())
        );
    }

    #[test]
    fn growing_samples_contribute_each_line_once() {
        let samples = ["a", "a\nb", "a\nb", "a\nb\nc", "a\nb\nc\nd"];
        let mut history = StdoutHistory::default();
        let mut increments = Vec::new();

        for sample in samples {
            if history.observe(sample) {
                increments.push(history.new_stdout.clone());
                history.mark_processed();
            }
        }

        assert_eq!(increments, vec!["a", "b", "c", "d"]);
        assert_eq!(history.stdout, "a\nb\nc\nd");
    }

    #[test]
    fn pending_until_processed() {
        let mut history = StdoutHistory::default();
        assert_eq!(history.pending(), None);

        assert!(history.observe("x"));
        assert_eq!(history.pending(), Some("x"));

        history.mark_processed();
        assert_eq!(history.pending(), None);

        assert!(!history.observe(""));
        history.reset();
        assert_eq!(history, StdoutHistory::default());
    }

    #[test]
    fn repeated_increment_is_ignored() {
        let mut history = StdoutHistory::default();
        assert!(history.observe("x"));
        // A restarted run printing the same thing again.
        assert!(!history.observe("x"));
        assert_eq!(history.stdout, "x");
    }
}
