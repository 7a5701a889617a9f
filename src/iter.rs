//! A provenance-tagged cursor over decoded samples.

use std::fmt;

use crate::{gorilla::SeriesIter, Sample};

/// A lazy, forward-only, single-pass sequence of samples.
///
/// Carries a human-readable tag naming where the samples came from
/// (`"ring t0=..."`, `"memory month=... t0=..."`), which is invaluable when
/// debugging a query that fused several storage tiers.
pub struct Iter {
    tag: String,
    inner: SeriesIter,
}

impl Iter {
    pub fn new(inner: SeriesIter, tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            inner,
        }
    }

    /// Where these samples came from.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// T0 of the chunk the samples were decoded from.
    pub fn t0(&self) -> u32 {
        self.inner.t0()
    }
}

impl Iterator for Iter {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        self.inner.next()
    }
}

impl fmt::Debug for Iter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").field("tag", &self.tag).finish()
    }
}
