//! Merging of ascending sample streams
//!
//! Every source yields samples in strictly ascending timestamp order. The
//! merge emits one ascending, de-duplicated stream; when several sources
//! hold the same timestamp, the source listed first wins.

use crate::{Result, Sample};

/// A boxed, fallible, ascending sample stream
pub type SampleStream<'a> = Box<dyn Iterator<Item = Result<Sample>> + 'a>;

/// Priority merge of sample streams, newest source first
pub struct MergeIter<'a> {
    sources: Vec<SampleStream<'a>>,
    pending: Vec<Option<Sample>>,
    exhausted: Vec<bool>,
    duplicates: u64,
    failed: bool,
}

impl<'a> MergeIter<'a> {
    /// Create a merge; `sources[0]` has the highest priority
    pub fn new(sources: Vec<SampleStream<'a>>) -> Self {
        let count = sources.len();
        Self {
            sources,
            pending: vec![None; count],
            exhausted: vec![false; count],
            duplicates: 0,
            failed: false,
        }
    }

    /// Number of shadowed samples dropped so far
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    fn fill(&mut self) -> Result<()> {
        for (index, source) in self.sources.iter_mut().enumerate() {
            if self.pending[index].is_some() || self.exhausted[index] {
                continue;
            }
            match source.next() {
                Some(Ok(sample)) => self.pending[index] = Some(sample),
                Some(Err(e)) => return Err(e),
                None => self.exhausted[index] = true,
            }
        }
        Ok(())
    }
}

impl Iterator for MergeIter<'_> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Err(e) = self.fill() {
            self.failed = true;
            return Some(Err(e));
        }

        let mut best: Option<(usize, u64)> = None;
        for (index, pending) in self.pending.iter().enumerate() {
            let Some(sample) = pending else {
                continue;
            };
            match best {
                // Strict comparison keeps the earliest (highest priority) source on ties
                Some((_, best_ts)) if sample.timestamp >= best_ts => {}
                _ => best = Some((index, sample.timestamp)),
            }
        }

        let (winner, timestamp) = best?;
        let sample = self.pending[winner].take()?;

        for index in 0..self.pending.len() {
            if matches!(self.pending[index], Some(s) if s.timestamp == timestamp) {
                self.pending[index] = None;
                self.duplicates += 1;
            }
        }

        Some(Ok(sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MetricError;

    fn stream(samples: Vec<(u64, f64)>) -> SampleStream<'static> {
        Box::new(samples.into_iter().map(|s| Ok(Sample::from(s))))
    }

    #[test]
    fn test_merge_interleaved() {
        let merged: Vec<_> = MergeIter::new(vec![
            stream(vec![(1, 1.0), (4, 4.0)]),
            stream(vec![(2, 2.0), (3, 3.0), (5, 5.0)]),
        ])
        .collect::<Result<_>>()
        .unwrap();

        let ts: Vec<_> = merged.iter().map(|s: &Sample| s.timestamp).collect();
        assert_eq!(ts, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_first_source_wins_ties() {
        let mut merge = MergeIter::new(vec![
            stream(vec![(5, 2.0)]),
            stream(vec![(5, 1.0), (6, 6.0)]),
            stream(vec![(5, 0.5)]),
        ]);

        assert_eq!(merge.next().unwrap().unwrap(), Sample::new(5, 2.0));
        assert_eq!(merge.next().unwrap().unwrap(), Sample::new(6, 6.0));
        assert!(merge.next().is_none());
        assert_eq!(merge.duplicates(), 2);
    }

    #[test]
    fn test_error_stops_merge() {
        let failing: SampleStream<'static> = Box::new(
            vec![Ok(Sample::new(1, 1.0)), Err(MetricError::NotFound("t".into()))].into_iter(),
        );
        let mut merge = MergeIter::new(vec![failing, stream(vec![(2, 2.0)])]);

        assert!(merge.next().unwrap().is_ok());
        assert!(merge.next().unwrap().is_err());
        assert!(merge.next().is_none());
    }

    #[test]
    fn test_empty_sources() {
        let mut merge = MergeIter::new(vec![stream(vec![]), stream(vec![])]);
        assert!(merge.next().is_none());
        assert!(MergeIter::new(Vec::new()).next().is_none());
    }
}
