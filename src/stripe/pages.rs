//! Page descriptors and ordered page lists.

use std::collections::VecDeque;

use bytes::Bytes;

use super::PAGE_SIZE;

/// A cached page of a logical object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Logical page index.
    pub index: u64,
    pub data: Bytes,
}

impl Page {
    pub fn new(index: u64, data: Bytes) -> Self {
        Self { index, data }
    }

    /// Logical byte offset of the page.
    pub fn offset(&self) -> u64 {
        self.index * PAGE_SIZE
    }
}

/// Ordered list of pages; moves keep relative order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PageList {
    pages: VecDeque<Page>,
}

impl PageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn push(&mut self, page: Page) {
        self.pages.push_back(page);
    }

    pub fn pop_front(&mut self) -> Option<Page> {
        self.pages.pop_front()
    }

    /// Move every page of `other` to the tail of this list.
    pub fn splice(&mut self, other: &mut PageList) {
        self.pages.append(&mut other.pages);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Page> {
        self.pages.iter()
    }

    pub fn indices(&self) -> Vec<u64> {
        self.pages.iter().map(|p| p.index).collect()
    }
}

impl FromIterator<Page> for PageList {
    fn from_iter<I: IntoIterator<Item = Page>>(iter: I) -> Self {
        Self {
            pages: iter.into_iter().collect(),
        }
    }
}

/// Input/output queue pair handed to a submit.
///
/// Pages the submitter accepts move from `qin` to `qout`; pages it leaves
/// behind stay in `qin`.
#[derive(Debug, Default)]
pub struct TwoQueue {
    pub qin: PageList,
    pub qout: PageList,
}

impl TwoQueue {
    pub fn new(pages: PageList) -> Self {
        Self {
            qin: pages,
            qout: PageList::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.qin.len() + self.qout.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(indices: &[u64]) -> PageList {
        indices
            .iter()
            .map(|i| Page::new(*i, Bytes::new()))
            .collect()
    }

    #[test]
    fn test_splice_preserves_order() {
        let mut a = pages(&[1, 2]);
        let mut b = pages(&[7, 3]);
        a.splice(&mut b);
        assert!(b.is_empty());
        assert_eq!(a.indices(), vec![1, 2, 7, 3]);
    }

    #[test]
    fn test_page_offset() {
        assert_eq!(Page::new(3, Bytes::new()).offset(), 3 * PAGE_SIZE);
    }
}
