use super::rowset::RowIterator;
use crate::error::{Error, Result};
use crate::schema::Row;

use std::{cmp::Ordering, collections::BinaryHeap};

pub struct HeapEntry {
    pub key: Vec<u8>,
    pub row: Row,
    pub source: usize,
    pub iterator: RowIterator,
}

impl std::fmt::Debug for HeapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapEntry")
            .field("key", &self.key)
            .field("row", &self.row)
            .field("source", &self.source)
            .finish()
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Equal => self.source.cmp(&other.source).reverse(),
            other => other.reverse(),
        }
    }
}

/// Merges key-ordered row streams from several row sets into one.
///
/// A key is live in at most one row set at a time; if two sources do
/// yield the same key, the lowest source index wins.
#[derive(Debug)]
pub struct MergeIterator {
    heap: BinaryHeap<HeapEntry>,
    latest_key: Option<Vec<u8>>,
    error: Option<Error>,
}

impl MergeIterator {
    pub fn new(iterators: Vec<RowIterator>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::new(),
            latest_key: None,
            error: None,
        };
        for (source, iterator) in iterators.into_iter().enumerate() {
            merge.advance(source, iterator);
        }
        merge
    }

    fn advance(&mut self, source: usize, mut iterator: RowIterator) {
        match iterator.next() {
            Some(Ok((key, row))) => self.heap.push(HeapEntry {
                key,
                row,
                source,
                iterator,
            }),
            Some(Err(e)) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
            }
            None => {}
        }
    }
}

impl Iterator for MergeIterator {
    type Item = Result<(Vec<u8>, Row)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.error.take() {
                self.heap.clear();
                return Some(Err(e));
            }

            let entry = self.heap.pop()?;
            let HeapEntry {
                key,
                row,
                source,
                iterator,
            } = entry;
            self.advance(source, iterator);

            if self.latest_key.as_ref() == Some(&key) {
                continue;
            }
            self.latest_key = Some(key.clone());
            return Some(Ok((key, row)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Value;

    fn rows(keys: &[u8], tag: u32) -> RowIterator {
        let items = keys
            .iter()
            .map(|k| {
                let row: Row = [(0, Value::UInt32(tag))].into_iter().collect();
                Ok((vec![*k], row))
            })
            .collect::<Vec<_>>();
        Box::new(items.into_iter())
    }

    #[test]
    fn test_merge_orders_keys() {
        let merged: Vec<_> = MergeIterator::new(vec![rows(&[1, 4, 7], 0), rows(&[2, 3, 9], 1)])
            .collect::<Result<_>>()
            .unwrap();
        let keys: Vec<u8> = merged.iter().map(|(k, _)| k[0]).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 7, 9]);
    }

    #[test]
    fn test_merge_duplicate_key_prefers_first_source() {
        let merged: Vec<_> = MergeIterator::new(vec![rows(&[5], 0), rows(&[5, 6], 1)])
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].1.get(0), Some(&Value::UInt32(0)));
    }

    #[test]
    fn test_merge_surfaces_errors() {
        let failing: RowIterator = Box::new(
            vec![Err(Error::Corruption("bad block".to_string()))].into_iter(),
        );
        let mut merge = MergeIterator::new(vec![rows(&[1], 0), failing]);
        assert!(matches!(merge.next(), Some(Err(Error::Corruption(_)))));
        assert!(merge.next().is_none());
    }
}
