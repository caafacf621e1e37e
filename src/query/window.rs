//! Sliding window over a paged result
//!
//! A [`Window`] caches a contiguous run of rows fetched from a
//! [`PageSource`]. Reads inside the run are served from memory; a read
//! outside it moves the window, keeping the rows the old and new windows
//! share and fetching only the missing span.

use crate::record::Record;
use crate::Result;

/// Backing pages for a window.
pub trait PageSource {
    /// Rows `first .. first + count`, fewer at the end of the result.
    fn fetch_page(&self, first: usize, count: usize) -> Result<Vec<Record>>;

    /// Total number of rows.
    fn count(&self) -> Result<usize>;
}

/// Rows retained on the far side of the requested index when the window
/// moves.
pub fn border(scale: usize) -> usize {
    if scale >= 16 {
        scale / 4
    } else if scale >= 4 {
        2
    } else {
        0
    }
}

#[derive(Debug)]
pub struct Window {
    scale: usize,
    first: usize,
    rows: Vec<Record>,
    size: Option<usize>,
    upper_bound: Option<usize>,
    fetches: u64,
}

impl Window {
    pub fn new(scale: usize) -> Self {
        Self {
            scale: scale.max(1),
            first: 0,
            rows: Vec::new(),
            size: None,
            upper_bound: None,
            fetches: 0,
        }
    }

    pub fn scale(&self) -> usize {
        self.scale
    }

    /// Number of backing page fetches so far
    pub fn fetch_count(&self) -> u64 {
        self.fetches
    }

    /// Exact result size, once observed
    pub fn known_size(&self) -> Option<usize> {
        self.size
    }

    /// Index range currently cached
    pub fn cached_range(&self) -> std::ops::Range<usize> {
        self.first..self.first + self.rows.len()
    }

    /// Drop cached rows and everything learned about the size.
    pub fn invalidate(&mut self) {
        self.first = 0;
        self.rows.clear();
        self.size = None;
        self.upper_bound = None;
    }

    pub fn len(&mut self, source: &dyn PageSource) -> Result<usize> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        let size = source.count()?;
        self.size = Some(size);
        Ok(size)
    }

    /// Row at `index`, fetching a new window on a miss.
    pub fn get(&mut self, source: &dyn PageSource, index: usize) -> Result<Option<Record>> {
        if self.size.is_some_and(|size| index >= size)
            || self.upper_bound.is_some_and(|bound| index >= bound)
        {
            return Ok(None);
        }
        if self.cached_range().contains(&index) {
            return Ok(Some(self.rows[index - self.first].clone()));
        }

        let border = border(self.scale);
        let forward = index >= self.first + self.rows.len();
        let mut start = if forward {
            index.saturating_sub(border)
        } else {
            index.saturating_add(border + 1).saturating_sub(self.scale)
        };
        if let Some(size) = self.size {
            start = start.min(size.saturating_sub(self.scale));
        }
        let end = start.saturating_add(self.scale);

        let old = self.cached_range();
        let keep_from = old.start.max(start);
        let keep_to = old.end.min(end);

        if keep_from < keep_to && keep_from == start {
            // New window starts inside the old one: fetch the tail only.
            let fetched = self.fetch(source, keep_to, end - keep_to)?;
            let mut rows: Vec<Record> = self.rows.drain(keep_from - old.start..keep_to - old.start).collect();
            rows.extend(fetched);
            self.rows = rows;
        } else if keep_from < keep_to && keep_to == end {
            // New window ends inside the old one: fetch the head only.
            let mut rows = self.fetch(source, start, keep_from - start)?;
            rows.extend(self.rows.drain(keep_from - old.start..keep_to - old.start));
            self.rows = rows;
        } else {
            self.rows = self.fetch(source, start, self.scale)?;
        }
        self.first = start;

        Ok(self
            .rows
            .get(index.wrapping_sub(self.first))
            .filter(|_| index >= self.first)
            .cloned())
    }

    fn fetch(&mut self, source: &dyn PageSource, first: usize, count: usize) -> Result<Vec<Record>> {
        let rows = source.fetch_page(first, count)?;
        self.fetches += 1;
        if rows.len() < count {
            if !rows.is_empty() || first == 0 {
                self.size = Some(first + rows.len());
            } else {
                self.upper_bound = Some(self.upper_bound.map_or(first, |b| b.min(first)));
            }
        }
        Ok(rows)
    }
}
