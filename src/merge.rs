//! K-way merging of individually sorted sequences.
//!
//! Two strategies produce identical output from the consumer's point of view:
//!
//! - [`MergePair`] combines two sorted iterators; [`merge_pairwise`] folds a list
//!   of inputs right-to-left into a cascade of pairs. Cheap for a small, fixed
//!   fan-in.
//! - [`KMerge`] keeps one peeked head per input in a binary heap ordered by a
//!   caller-supplied comparator. Depth is logarithmic in the fan-in, so it is the
//!   choice for merging many bucket files.
//!
//! Both consume their inputs exactly once, forward only, and never hold more than
//! one element per input. Elements comparing equal are emitted contiguously; the
//! relative order of equal elements from different inputs is unspecified.
//!
//! ```
//! use osmjoin::merge::{merge, MergeStrategy};
//!
//! let inputs = vec![vec![1, 4, 7].into_iter(), vec![2, 5].into_iter(), vec![3, 6].into_iter()];
//! let merged: Vec<i32> = merge(inputs, |a: &i32, b: &i32| a.cmp(b), MergeStrategy::Heap).collect();
//! assert_eq!(merged, vec![1, 2, 3, 4, 5, 6, 7]);
//! ```

use crate::record::Record;
use anyhow::Result;
use std::cmp::Ordering;
use std::iter::{self, Peekable};

/// How a list of sorted inputs is combined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Right-to-left cascade of two-way merges.
    Pairwise,
    /// Binary heap holding one head element per input.
    Heap,
}

impl MergeStrategy {
    /// Pairwise for two inputs or fewer, heap otherwise.
    #[must_use]
    pub fn for_fan_in(inputs: usize) -> Self {
        if inputs <= 2 {
            Self::Pairwise
        } else {
            Self::Heap
        }
    }
}

/// Two-way merge of sorted iterators.
///
/// When the heads compare equal the left element is emitted first.
pub struct MergePair<L, R, F>
where
    L: Iterator,
    R: Iterator<Item = L::Item>,
{
    left: Peekable<L>,
    right: Peekable<R>,
    cmp: F,
}

impl<L, R, F> MergePair<L, R, F>
where
    L: Iterator,
    R: Iterator<Item = L::Item>,
    F: FnMut(&L::Item, &L::Item) -> Ordering,
{
    pub fn new(left: L, right: R, cmp: F) -> Self {
        Self {
            left: left.peekable(),
            right: right.peekable(),
            cmp,
        }
    }
}

impl<L, R, F> Iterator for MergePair<L, R, F>
where
    L: Iterator,
    R: Iterator<Item = L::Item>,
    F: FnMut(&L::Item, &L::Item) -> Ordering,
{
    type Item = L::Item;

    fn next(&mut self) -> Option<Self::Item> {
        match (self.left.peek(), self.right.peek()) {
            (Some(l), Some(r)) => {
                if (self.cmp)(l, r) == Ordering::Greater {
                    self.right.next()
                } else {
                    self.left.next()
                }
            }
            (Some(_), None) => self.left.next(),
            (None, _) => self.right.next(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (ll, lh) = self.left.size_hint();
        let (rl, rh) = self.right.size_hint();
        let high = match (lh, rh) {
            (Some(a), Some(b)) => a.checked_add(b),
            _ => None,
        };
        (ll.saturating_add(rl), high)
    }
}

/// Fold `inputs` right-to-left into a cascade of [`MergePair`]s.
///
/// Zero inputs yield an empty iterator and a single input is passed through.
pub fn merge_pairwise<'a, T, I, F>(mut inputs: Vec<I>, cmp: F) -> Box<dyn Iterator<Item = T> + 'a>
where
    T: 'a,
    I: Iterator<Item = T> + 'a,
    F: Fn(&T, &T) -> Ordering + Clone + 'a,
{
    let mut merged: Box<dyn Iterator<Item = T> + 'a> = match inputs.pop() {
        Some(last) => Box::new(last),
        None => return Box::new(iter::empty()),
    };
    while let Some(prev) = inputs.pop() {
        merged = Box::new(MergePair::new(prev, merged, cmp.clone()));
    }
    merged
}

/// Heap-based k-way merge.
///
/// Ties between inputs are broken by input position, lower first.
pub struct KMerge<I: Iterator, F> {
    sources: Vec<I>,
    heap: Vec<(I::Item, usize)>,
    cmp: F,
}

impl<I, F> KMerge<I, F>
where
    I: Iterator,
    F: FnMut(&I::Item, &I::Item) -> Ordering,
{
    pub fn new(inputs: impl IntoIterator<Item = I>, cmp: F) -> Self {
        let mut sources: Vec<I> = inputs.into_iter().collect();
        let mut heap = Vec::with_capacity(sources.len());
        for (idx, source) in sources.iter_mut().enumerate() {
            if let Some(head) = source.next() {
                heap.push((head, idx));
            }
        }
        let mut merge = Self { sources, heap, cmp };
        for pos in (0..merge.heap.len() / 2).rev() {
            merge.sift_down(pos);
        }
        merge
    }

    /// Number of inputs that still have elements.
    pub fn live_inputs(&self) -> usize {
        self.heap.len()
    }

    fn less(&mut self, a: usize, b: usize) -> bool {
        let (ia, sa) = &self.heap[a];
        let (ib, sb) = &self.heap[b];
        (self.cmp)(ia, ib).then(sa.cmp(sb)) == Ordering::Less
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                return;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if self.less(child, pos) {
                self.heap.swap(child, pos);
                pos = child;
            } else {
                return;
            }
        }
    }
}

impl<I, F> Iterator for KMerge<I, F>
where
    I: Iterator,
    F: FnMut(&I::Item, &I::Item) -> Ordering,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if self.heap.is_empty() {
            return None;
        }
        let source = self.heap[0].1;
        let out = match self.sources[source].next() {
            Some(refill) => std::mem::replace(&mut self.heap[0], (refill, source)).0,
            None => self.heap.swap_remove(0).0,
        };
        self.sift_down(0);
        Some(out)
    }
}

/// Merge `inputs` with the given strategy.
pub fn merge<'a, T, I, F>(
    inputs: Vec<I>,
    cmp: F,
    strategy: MergeStrategy,
) -> Box<dyn Iterator<Item = T> + 'a>
where
    T: 'a,
    I: Iterator<Item = T> + 'a,
    F: Fn(&T, &T) -> Ordering + Clone + 'a,
{
    match (inputs.len(), strategy) {
        (0 | 1, _) | (_, MergeStrategy::Pairwise) => merge_pairwise(inputs, cmp),
        (_, MergeStrategy::Heap) => Box::new(KMerge::new(inputs, cmp)),
    }
}

/// Order record results by key, with errors first so they surface immediately.
pub fn compare_record_results(a: &Result<Record>, b: &Result<Record>) -> Ordering {
    match (a, b) {
        (Ok(a), Ok(b)) => a.key.cmp(&b.key),
        (Err(_), Err(_)) => Ordering::Equal,
        (Err(_), Ok(_)) => Ordering::Less,
        (Ok(_), Err(_)) => Ordering::Greater,
    }
}

/// Merge sorted record streams by key, choosing the strategy from the fan-in.
pub fn merge_records<'a, I>(inputs: Vec<I>) -> Box<dyn Iterator<Item = Result<Record>> + 'a>
where
    I: Iterator<Item = Result<Record>> + 'a,
{
    let strategy = MergeStrategy::for_fan_in(inputs.len());
    merge(inputs, compare_record_results, strategy)
}
