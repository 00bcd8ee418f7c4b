//! Results of partition-family operators, in memory or read back lazily
//! from spilled runs.

use std::sync::Arc;

use flowcomm_shuffle::{RunValues, SortedGroups};

use crate::error::Result;
use crate::protocol::codec::Codec;

/// Values one destination received from a partition.
///
/// Spilled values are decoded as they are read; their part files are
/// deleted when the iterator is dropped.
pub struct PartitionValues<T> {
    inner: ValuesInner<T>,
}

enum ValuesInner<T> {
    Memory(std::vec::IntoIter<T>),
    Disk {
        values: RunValues,
        codec: Arc<dyn Codec<T>>,
    },
}

impl<T> PartitionValues<T> {
    pub(crate) fn memory(values: Vec<T>) -> Self {
        Self {
            inner: ValuesInner::Memory(values.into_iter()),
        }
    }

    pub(crate) fn disk(values: RunValues, codec: Arc<dyn Codec<T>>) -> Self {
        Self {
            inner: ValuesInner::Disk { values, codec },
        }
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.inner, ValuesInner::Disk { .. })
    }

    pub fn into_vec(self) -> Result<Vec<T>> {
        self.collect()
    }
}

impl<T> Iterator for PartitionValues<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            ValuesInner::Memory(values) => values.next().map(Ok),
            ValuesInner::Disk { values, codec } => Some(
                values
                    .next()?
                    .map_err(Into::into)
                    .and_then(|bytes| codec.decode(&bytes)),
            ),
        }
    }
}

impl<T> std::fmt::Debug for PartitionValues<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionValues")
            .field("spilled", &self.is_spilled())
            .finish()
    }
}

/// Key groups one destination received from a keyed gather.
///
/// With a comparator the groups come in key order; spilled groups are
/// merged from disk one key at a time.
pub struct KeyedGroups<K, V> {
    inner: GroupsInner<K, V>,
}

enum GroupsInner<K, V> {
    Memory(std::vec::IntoIter<(K, Vec<V>)>),
    Disk {
        groups: SortedGroups<K>,
        codec: Arc<dyn Codec<V>>,
    },
}

impl<K: Clone, V> KeyedGroups<K, V> {
    pub(crate) fn memory(groups: Vec<(K, Vec<V>)>) -> Self {
        Self {
            inner: GroupsInner::Memory(groups.into_iter()),
        }
    }

    pub(crate) fn disk(groups: SortedGroups<K>, codec: Arc<dyn Codec<V>>) -> Self {
        Self {
            inner: GroupsInner::Disk { groups, codec },
        }
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.inner, GroupsInner::Disk { .. })
    }

    pub fn into_vec(self) -> Result<Vec<(K, Vec<V>)>> {
        self.collect()
    }
}

impl<K: Clone, V> Iterator for KeyedGroups<K, V> {
    type Item = Result<(K, Vec<V>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            GroupsInner::Memory(groups) => groups.next().map(Ok),
            GroupsInner::Disk { groups, codec } => {
                let (key, values) = match groups.next_group() {
                    Ok(Some(group)) => group,
                    Ok(None) => return None,
                    Err(e) => return Some(Err(e.into())),
                };
                let values = values
                    .map(|bytes| bytes.map_err(Into::into).and_then(|b| codec.decode(&b)))
                    .collect::<Result<Vec<V>>>();
                Some(values.map(|values| (key, values)))
            }
        }
    }
}

impl<K, V> std::fmt::Debug for KeyedGroups<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedGroups")
            .field("spilled", &matches!(self.inner, GroupsInner::Disk { .. }))
            .finish()
    }
}
