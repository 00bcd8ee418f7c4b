//! Keyed external sort-merge.
//!
//! Records are sorted with the run's comparator before every spill, so each
//! part file is a sorted run. Reading k-way merges the parts with the sorted
//! in-memory remainder through a min-heap holding one record per cursor, and
//! exposes equal keys as one group.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::codec::KeyCodec;
use crate::config::ShuffleConfig;
use crate::error::{Result, ShuffleError};
use crate::merger::RunState;
use crate::part::{PartFile, PartReader, PartWriter, part_path, remove_parts};

/// Total order over keys used for sorting and grouping.
pub type KeyComparator<K> = Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

/// Comparator from the key's natural `Ord`.
pub fn natural_order<K: Ord>() -> KeyComparator<K> {
    Arc::new(|a: &K, b: &K| a.cmp(b))
}

pub struct KeyedSortedRunMerger<K> {
    name: String,
    dir: PathBuf,
    config: ShuffleConfig,
    state: RunState,
    records: Vec<(K, Vec<u8>)>,
    bytes_in_memory: usize,
    parts: Vec<PartFile>,
    comparator: KeyComparator<K>,
    codec: Arc<dyn KeyCodec<K>>,
    key_buf: Vec<u8>,
    consumed: bool,
}

impl<K: Clone + Send + 'static> KeyedSortedRunMerger<K> {
    pub fn new(
        dir: impl Into<PathBuf>,
        name: impl Into<String>,
        config: ShuffleConfig,
        comparator: KeyComparator<K>,
        codec: Arc<dyn KeyCodec<K>>,
    ) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            config,
            state: RunState::Writing,
            records: Vec::new(),
            bytes_in_memory: 0,
            parts: Vec::new(),
            comparator,
            codec,
            key_buf: Vec::new(),
            consumed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn parts(&self) -> &[PartFile] {
        &self.parts
    }

    pub fn add(&mut self, key: K, value: Vec<u8>) -> Result<()> {
        if self.state != RunState::Writing {
            return Err(ShuffleError::AddAfterReading {
                name: self.name.clone(),
            });
        }
        self.bytes_in_memory += value.len() + std::mem::size_of::<K>();
        self.records.push((key, value));
        Ok(())
    }

    fn sort_memory(&mut self) {
        let cmp = &self.comparator;
        self.records.sort_by(|a, b| cmp(&a.0, &b.0));
    }

    /// Sort and spill the in-memory records when a threshold is exceeded.
    pub fn run(&mut self) -> Result<bool> {
        if self.state != RunState::Writing
            || !self
                .config
                .over_threshold(self.bytes_in_memory, self.records.len())
        {
            return Ok(false);
        }
        self.sort_memory();

        let path = part_path(&self.dir, &self.name, self.parts.len());
        let mut writer = PartWriter::create(path)?;
        for (key, value) in self.records.drain(..) {
            self.key_buf.clear();
            self.codec.encode_key(&key, &mut self.key_buf)?;
            writer.write_keyed(&self.key_buf, &value)?;
        }
        let part = writer.finish()?;
        debug!(
            run = %self.name,
            part = self.parts.len(),
            records = part.records,
            bytes = part.bytes,
            "spilled sorted run"
        );
        self.parts.push(part);
        self.bytes_in_memory = 0;
        Ok(true)
    }

    /// Sort whatever is still buffered and freeze the run.
    pub fn switch_to_reading(&mut self) -> Result<()> {
        match self.state {
            RunState::Writing => {
                self.sort_memory();
                self.state = RunState::Reading;
                Ok(())
            }
            RunState::Reading => Ok(()),
            RunState::Done => Err(ShuffleError::Cleaned {
                name: self.name.clone(),
            }),
        }
    }

    /// Start the single-pass grouped merge. The returned reader owns the
    /// part files and removes them when dropped.
    pub fn read_iterator(&mut self) -> Result<SortedGroups<K>> {
        match self.state {
            RunState::Writing => {
                return Err(ShuffleError::NotReading {
                    name: self.name.clone(),
                });
            }
            RunState::Done => {
                return Err(ShuffleError::Cleaned {
                    name: self.name.clone(),
                });
            }
            RunState::Reading => {}
        }
        if self.consumed {
            return Err(ShuffleError::AlreadyConsumed {
                name: self.name.clone(),
            });
        }
        self.consumed = true;
        self.bytes_in_memory = 0;

        let mut cursors: Vec<Cursor<K>> = self
            .parts
            .iter()
            .map(|p| Cursor {
                reader: Some(PartReader::new(p)),
                window: VecDeque::new(),
            })
            .collect();
        cursors.push(Cursor {
            reader: None,
            window: std::mem::take(&mut self.records).into(),
        });

        let mut groups = SortedGroups {
            cursors,
            heap: BinaryHeap::new(),
            comparator: self.comparator.clone(),
            codec: self.codec.clone(),
            window_records: self.config.read_window_records.max(1),
            parts: self.parts.clone(),
            current: None,
            pending: None,
        };
        for i in 0..groups.cursors.len() {
            groups.refill(i)?;
        }
        Ok(groups)
    }

    /// Delete every part file and mark the run done. Safe to repeat.
    pub fn clean(&mut self) -> Result<()> {
        remove_parts(&self.parts)?;
        self.records.clear();
        self.bytes_in_memory = 0;
        self.state = RunState::Done;
        Ok(())
    }
}

impl<K> Drop for KeyedSortedRunMerger<K> {
    fn drop(&mut self) {
        if !self.consumed && !self.parts.is_empty() {
            let _ = remove_parts(&self.parts);
        }
    }
}

struct Cursor<K> {
    reader: Option<PartReader>,
    window: VecDeque<(K, Vec<u8>)>,
}

struct HeapEntry<K> {
    key: K,
    value: Vec<u8>,
    cursor: usize,
    comparator: KeyComparator<K>,
}

impl<K> PartialEq for HeapEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K> Eq for HeapEntry<K> {}

impl<K> PartialOrd for HeapEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for HeapEntry<K> {
    // Reversed: BinaryHeap is a max-heap. Equal keys pop by cursor index so
    // earlier parts (earlier inserts) come first.
    fn cmp(&self, other: &Self) -> Ordering {
        (self.comparator)(&other.key, &self.key).then_with(|| other.cursor.cmp(&self.cursor))
    }
}

/// Grouped, key-ordered reader produced by [`KeyedSortedRunMerger::read_iterator`].
///
/// Resident memory is bounded by one read window per part.
pub struct SortedGroups<K> {
    cursors: Vec<Cursor<K>>,
    heap: BinaryHeap<HeapEntry<K>>,
    comparator: KeyComparator<K>,
    codec: Arc<dyn KeyCodec<K>>,
    window_records: usize,
    parts: Vec<PartFile>,
    current: Option<K>,
    pending: Option<Vec<u8>>,
}

impl<K: Clone> SortedGroups<K> {
    /// Push the next record of cursor `i` onto the heap, loading its next
    /// window from disk if needed. Exhausted readers are closed.
    fn refill(&mut self, i: usize) -> Result<()> {
        let codec = self.codec.clone();
        let window_records = self.window_records;
        let cursor = &mut self.cursors[i];
        if cursor.window.is_empty()
            && let Some(reader) = cursor.reader.as_mut()
        {
            let window = &mut cursor.window;
            reader.read_keyed(window_records, |k, v| {
                window.push_back((codec.decode_key(&k)?, v));
                Ok(())
            })?;
            if reader.is_exhausted() {
                cursor.reader = None;
            }
        }
        if let Some((key, value)) = cursor.window.pop_front() {
            self.heap.push(HeapEntry {
                key,
                value,
                cursor: i,
                comparator: self.comparator.clone(),
            });
        }
        Ok(())
    }

    fn pop_if_current(&mut self) -> Result<Option<Vec<u8>>> {
        let same = match (self.heap.peek(), self.current.as_ref()) {
            (Some(top), Some(current)) => (self.comparator)(&top.key, current) == Ordering::Equal,
            _ => false,
        };
        if !same {
            return Ok(None);
        }
        match self.heap.pop() {
            Some(entry) => {
                self.refill(entry.cursor)?;
                Ok(Some(entry.value))
            }
            None => Ok(None),
        }
    }

    /// Advance to the next key. Values of the previous group that were not
    /// consumed are drained first; a key is never revisited.
    pub fn next_group(&mut self) -> Result<Option<(K, GroupValues<'_, K>)>> {
        self.pending = None;
        while self.pop_if_current()?.is_some() {}

        let Some(entry) = self.heap.pop() else {
            self.current = None;
            return Ok(None);
        };
        self.refill(entry.cursor)?;
        self.current = Some(entry.key.clone());
        self.pending = Some(entry.value);
        Ok(Some((entry.key, GroupValues { groups: self })))
    }

    /// Number of cursors that still hold records.
    pub fn open_cursors(&self) -> usize {
        self.heap.len()
    }
}

impl<K> Drop for SortedGroups<K> {
    fn drop(&mut self) {
        self.cursors.clear();
        let _ = remove_parts(&self.parts);
    }
}

/// Values sharing one key, borrowed from [`SortedGroups`].
pub struct GroupValues<'a, K: Clone> {
    groups: &'a mut SortedGroups<K>,
}

impl<K: Clone> Iterator for GroupValues<'_, K> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(first) = self.groups.pending.take() {
            return Some(Ok(first));
        }
        self.groups.pop_if_current().transpose()
    }
}
