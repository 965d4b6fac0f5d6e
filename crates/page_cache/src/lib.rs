//! Offset-paginated collections and the reflow that folds live items into them.
//!
//! A [`PagedCollection`] mirrors what an infinite-query cache holds after
//! loading `n` pages from the server: page `i` starts at offset
//! `i * page_size`, and every page but the last is full. [`reflow_insert`]
//! inserts a batch at the head, drops stale copies of the same items and
//! pushes overflow down the page chain so those invariants hold again.

use std::{collections::HashSet, hash::Hash};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReflowError {
    #[error("page size must be greater than zero")]
    ZeroPageSize,
    #[error("page {index} holds {actual} items, expected {expected}")]
    PageSizeMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("page param {index} is {actual}, expected {expected}")]
    PageParamMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
}

/// Positional metadata carried by every page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    #[serde(rename = "number")]
    pub index: usize,
    #[serde(rename = "first")]
    pub is_first: bool,
    #[serde(rename = "last")]
    pub is_last: bool,
    pub size: usize,
    #[serde(rename = "numberOfElements")]
    pub item_count: usize,
    #[serde(rename = "totalPages")]
    pub total_pages: usize,
    #[serde(rename = "totalElements")]
    pub total_items: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(rename = "content")]
    pub items: Vec<T>,
    #[serde(flatten)]
    pub meta: PageMeta,
}

/// Accessor/setter pair over a caller's page representation.
///
/// Reflow only rewrites the item list and the positional metadata; any other
/// state a page type carries is preserved on pages that already existed.
pub trait PageItems: Clone {
    type Item: Clone;

    fn items(&self) -> &[Self::Item];
    fn set_items(&mut self, items: Vec<Self::Item>);
    fn set_meta(&mut self, meta: PageMeta);
    /// Builds a fresh trailing page when overflow runs past the last one.
    fn with_items(items: Vec<Self::Item>) -> Self;
}

impl<T: Clone> PageItems for Page<T> {
    type Item = T;

    fn items(&self) -> &[T] {
        &self.items
    }

    fn set_items(&mut self, items: Vec<T>) {
        self.items = items;
    }

    fn set_meta(&mut self, meta: PageMeta) {
        self.meta = meta;
    }

    fn with_items(items: Vec<T>) -> Self {
        Self {
            items,
            meta: PageMeta::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedCollection<P> {
    pub pages: Vec<P>,
    pub page_params: Vec<usize>,
}

impl<P> Default for PagedCollection<P> {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            page_params: Vec::new(),
        }
    }
}

impl<P: PageItems> PagedCollection<P> {
    /// Wraps pages loaded from the server, recomputing metadata and offsets.
    pub fn from_pages(pages: Vec<P>, page_size: usize) -> Result<Self, ReflowError> {
        if page_size == 0 {
            return Err(ReflowError::ZeroPageSize);
        }
        let mut collection = Self {
            pages,
            page_params: Vec::new(),
        };
        collection.recompute(page_size);
        Ok(collection)
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn total_items(&self) -> usize {
        self.pages.iter().map(|page| page.items().len()).sum()
    }

    pub fn iter_items(&self) -> impl Iterator<Item = &P::Item> {
        self.pages.iter().flat_map(|page| page.items().iter())
    }

    /// Checks that every page but the last is full and offsets line up.
    pub fn validate(&self, page_size: usize) -> Result<(), ReflowError> {
        if page_size == 0 {
            return Err(ReflowError::ZeroPageSize);
        }
        let last = self.pages.len().saturating_sub(1);
        for (index, page) in self.pages.iter().enumerate() {
            let actual = page.items().len();
            let overfull = actual > page_size;
            let short = index < last && actual != page_size;
            if overfull || short {
                return Err(ReflowError::PageSizeMismatch {
                    index,
                    expected: page_size,
                    actual,
                });
            }
        }
        for (index, &actual) in self.page_params.iter().enumerate() {
            let expected = index * page_size;
            if actual != expected {
                return Err(ReflowError::PageParamMismatch {
                    index,
                    expected,
                    actual,
                });
            }
        }
        if self.page_params.len() != self.pages.len() {
            return Err(ReflowError::PageParamMismatch {
                index: self.page_params.len().min(self.pages.len()),
                expected: self.pages.len(),
                actual: self.page_params.len(),
            });
        }
        Ok(())
    }

    fn recompute(&mut self, page_size: usize) {
        let total_pages = self.pages.len();
        let total_items = self.total_items();
        for (index, page) in self.pages.iter_mut().enumerate() {
            let item_count = page.items().len();
            page.set_meta(PageMeta {
                index,
                is_first: index == 0,
                is_last: index + 1 == total_pages,
                size: page_size,
                item_count,
                total_pages,
                total_items,
            });
        }
        self.page_params = (0..total_pages).map(|index| index * page_size).collect();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflowOptions {
    pub page_size: usize,
    pub dedupe_across_pages: bool,
    pub create_if_empty: bool,
}

impl ReflowOptions {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            dedupe_across_pages: true,
            create_if_empty: true,
        }
    }

    pub fn dedupe_across_pages(mut self, enabled: bool) -> Self {
        self.dedupe_across_pages = enabled;
        self
    }

    pub fn create_if_empty(mut self, enabled: bool) -> Self {
        self.create_if_empty = enabled;
        self
    }
}

/// Inserts `incoming` (newest first) at the head of `existing` and returns
/// the reflowed collection. `existing` is left untouched.
///
/// With dedupe enabled, repeats inside the batch keep their first occurrence
/// and any existing item sharing an identity with the batch is removed from
/// whichever page holds it, so re-delivered items move to the front instead
/// of appearing twice. Each page that grows past `page_size`
/// hands its tail to the front of the next page, appending new pages as
/// needed. All page metadata and `page_params` are then recomputed.
pub fn reflow_insert<P, K, F>(
    existing: &PagedCollection<P>,
    incoming: &[P::Item],
    options: &ReflowOptions,
    identity: F,
) -> Result<PagedCollection<P>, ReflowError>
where
    P: PageItems,
    K: Eq + Hash,
    F: Fn(&P::Item) -> K,
{
    let page_size = options.page_size;
    if page_size == 0 {
        return Err(ReflowError::ZeroPageSize);
    }
    if incoming.is_empty() {
        return Ok(existing.clone());
    }

    // Repeats inside the batch collapse to their first occurrence.
    let mut incoming_ids: HashSet<K> = HashSet::new();
    let batch: Vec<P::Item> = if options.dedupe_across_pages {
        incoming
            .iter()
            .filter(|item| incoming_ids.insert(identity(*item)))
            .cloned()
            .collect()
    } else {
        incoming.to_vec()
    };

    if existing.pages.is_empty() {
        if !options.create_if_empty {
            return Ok(existing.clone());
        }
        let pages = batch
            .chunks(page_size)
            .map(|chunk| P::with_items(chunk.to_vec()))
            .collect();
        return PagedCollection::from_pages(pages, page_size);
    }

    let mut buckets: Vec<Vec<P::Item>> = existing
        .pages
        .iter()
        .map(|page| {
            page.items()
                .iter()
                .filter(|item| {
                    incoming_ids.is_empty() || !incoming_ids.contains(&identity(*item))
                })
                .cloned()
                .collect()
        })
        .collect();

    let mut head = batch;
    head.append(&mut buckets[0]);
    buckets[0] = head;

    cascade_overflow(&mut buckets, page_size);

    let mut pages = Vec::with_capacity(buckets.len());
    for (index, items) in buckets.into_iter().enumerate() {
        match existing.pages.get(index) {
            Some(page) => {
                let mut page = page.clone();
                page.set_items(items);
                pages.push(page);
            }
            None => pages.push(P::with_items(items)),
        }
    }

    PagedCollection::from_pages(pages, page_size)
}

fn cascade_overflow<T>(buckets: &mut Vec<Vec<T>>, page_size: usize) {
    let mut index = 0;
    while index < buckets.len() {
        if buckets[index].len() > page_size {
            let mut carry = buckets[index].split_off(page_size);
            match buckets.get_mut(index + 1) {
                Some(next) => {
                    carry.append(next);
                    *next = carry;
                }
                None => buckets.push(carry),
            }
        }
        index += 1;
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
