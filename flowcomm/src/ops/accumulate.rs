//! What stages do with the values they receive.
//!
//! A [`Combiner`] buffers a partial stage's values per destination until
//! they are flushed. An [`Accumulator`] gathers what one target received
//! into the output its receiver sees, and for tree operators also into
//! the payload forwarded to the parent.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::path::Path;
use std::sync::Arc;

use flowcomm_shuffle::{
    KeyCodec, KeyComparator, KeyedSortedRunMerger, RunMerger, ShuffleConfig, ShuffleError,
};

use super::values::{KeyedGroups, PartitionValues};
use crate::dataflow::Payload;
use crate::error::Result;
use crate::protocol::codec::Codec;
use crate::reduce::ReduceFunction;
use crate::types::TaskId;

pub trait Accumulator<M>: Send {
    type Output;

    /// Streaming stages consume one value per upstream per round.
    const ROUNDS: bool = false;

    fn add(&mut self, item: M) -> Result<()>;

    /// Values added since the last take.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Streaming stages flush early once this holds.
    fn is_full(&self) -> bool {
        false
    }

    /// Payload an intermediate tree node sends to its parent.
    fn take_forward(&mut self) -> Option<Payload<M>> {
        None
    }

    fn take_output(&mut self) -> Result<Option<Self::Output>>;
}

/// Folds values with a reduction function in arrival order.
pub struct ReduceAccumulator<T> {
    function: Arc<dyn ReduceFunction<T>>,
    value: Option<T>,
    count: usize,
}

impl<T> ReduceAccumulator<T> {
    pub fn new(function: Arc<dyn ReduceFunction<T>>) -> Self {
        Self {
            function,
            value: None,
            count: 0,
        }
    }
}

impl<T: Send> Accumulator<T> for ReduceAccumulator<T> {
    type Output = T;
    const ROUNDS: bool = true;

    fn add(&mut self, item: T) -> Result<()> {
        self.value = Some(match self.value.take() {
            Some(acc) => self.function.reduce(acc, item),
            None => item,
        });
        self.count += 1;
        Ok(())
    }

    fn len(&self) -> usize {
        self.count
    }

    fn take_forward(&mut self) -> Option<Payload<T>> {
        self.count = 0;
        self.value.take().map(Payload::Single)
    }

    fn take_output(&mut self) -> Result<Option<T>> {
        self.count = 0;
        Ok(self.value.take())
    }
}

/// Collects `(source, value)` pairs; output is ordered by source.
pub struct GatherAccumulator<T> {
    items: Vec<(TaskId, T)>,
}

impl<T> Default for GatherAccumulator<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Send> Accumulator<(TaskId, T)> for GatherAccumulator<T> {
    type Output = Vec<(TaskId, T)>;

    fn add(&mut self, item: (TaskId, T)) -> Result<()> {
        self.items.push(item);
        Ok(())
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn take_forward(&mut self) -> Option<Payload<(TaskId, T)>> {
        (!self.items.is_empty()).then(|| Payload::Batch(std::mem::take(&mut self.items)))
    }

    fn take_output(&mut self) -> Result<Option<Self::Output>> {
        if self.items.is_empty() {
            return Ok(None);
        }
        let mut items = std::mem::take(&mut self.items);
        items.sort_by_key(|(source, _)| *source);
        Ok(Some(items))
    }
}

/// Plain list of values, one per received item.
pub struct ListAccumulator<T> {
    items: Vec<T>,
}

impl<T> Default for ListAccumulator<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Send> Accumulator<T> for ListAccumulator<T> {
    type Output = Vec<T>;

    fn add(&mut self, item: T) -> Result<()> {
        self.items.push(item);
        Ok(())
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn take_output(&mut self) -> Result<Option<Vec<T>>> {
        Ok((!self.items.is_empty()).then(|| std::mem::take(&mut self.items)))
    }
}

/// Partition output, held in memory or spilled through a [`RunMerger`].
pub struct ValuesAccumulator<T> {
    store: ValueStore<T>,
    count: usize,
}

enum ValueStore<T> {
    Memory(Vec<T>),
    Disk {
        run: RunMerger,
        codec: Arc<dyn Codec<T>>,
    },
}

impl<T> ValuesAccumulator<T> {
    pub fn memory() -> Self {
        Self {
            store: ValueStore::Memory(Vec::new()),
            count: 0,
        }
    }

    pub fn disk(
        dir: &Path,
        name: String,
        config: ShuffleConfig,
        codec: Arc<dyn Codec<T>>,
    ) -> Self {
        Self {
            store: ValueStore::Disk {
                run: RunMerger::new(dir, name, config),
                codec,
            },
            count: 0,
        }
    }
}

impl<T: Send> Accumulator<T> for ValuesAccumulator<T> {
    type Output = PartitionValues<T>;

    fn add(&mut self, item: T) -> Result<()> {
        match &mut self.store {
            ValueStore::Memory(values) => values.push(item),
            ValueStore::Disk { run, codec } => {
                let mut bytes = Vec::new();
                codec.encode(&item, &mut bytes)?;
                run.add(bytes)?;
                run.run()?;
            }
        }
        self.count += 1;
        Ok(())
    }

    fn len(&self) -> usize {
        self.count
    }

    fn take_output(&mut self) -> Result<Option<PartitionValues<T>>> {
        if self.count == 0 {
            return Ok(None);
        }
        self.count = 0;
        match &mut self.store {
            ValueStore::Memory(values) => Ok(Some(PartitionValues::memory(std::mem::take(values)))),
            ValueStore::Disk { run, codec } => {
                run.switch_to_reading()?;
                Ok(Some(PartitionValues::disk(run.read_iterator()?, codec.clone())))
            }
        }
    }
}

/// Adapts a wire codec for spilling keys.
pub(crate) struct CodecKeys<K>(pub Arc<dyn Codec<K>>);

impl<K> KeyCodec<K> for CodecKeys<K> {
    fn encode_key(&self, key: &K, out: &mut Vec<u8>) -> flowcomm_shuffle::Result<()> {
        self.0
            .encode(key, out)
            .map_err(|e| ShuffleError::Codec(e.to_string()))
    }

    fn decode_key(&self, bytes: &[u8]) -> flowcomm_shuffle::Result<K> {
        self.0
            .decode(bytes)
            .map_err(|e| ShuffleError::Codec(e.to_string()))
    }
}

/// Keyed gather output: values grouped per key.
pub struct GroupsAccumulator<K, V> {
    store: GroupStore<K, V>,
    count: usize,
}

enum GroupStore<K, V> {
    Memory {
        index: HashMap<K, usize>,
        groups: Vec<(K, Vec<V>)>,
        order: Option<KeyComparator<K>>,
    },
    Disk {
        run: KeyedSortedRunMerger<K>,
        codec: Arc<dyn Codec<V>>,
    },
}

impl<K: Clone + Send + 'static, V> GroupsAccumulator<K, V> {
    /// Groups in first-seen order, or sorted by `order`.
    pub fn memory(order: Option<KeyComparator<K>>) -> Self {
        Self {
            store: GroupStore::Memory {
                index: HashMap::new(),
                groups: Vec::new(),
                order,
            },
            count: 0,
        }
    }

    pub fn disk(
        dir: &Path,
        name: String,
        config: ShuffleConfig,
        order: KeyComparator<K>,
        key_codec: Arc<dyn Codec<K>>,
        codec: Arc<dyn Codec<V>>,
    ) -> Self {
        let keys: Arc<dyn KeyCodec<K>> = Arc::new(CodecKeys(key_codec));
        Self {
            store: GroupStore::Disk {
                run: KeyedSortedRunMerger::new(dir, name, config, order, keys),
                codec,
            },
            count: 0,
        }
    }
}

impl<K, V> Accumulator<(K, V)> for GroupsAccumulator<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send,
{
    type Output = KeyedGroups<K, V>;

    fn add(&mut self, (key, value): (K, V)) -> Result<()> {
        match &mut self.store {
            GroupStore::Memory { index, groups, .. } => match index.get(&key) {
                Some(&i) => groups[i].1.push(value),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, vec![value]));
                }
            },
            GroupStore::Disk { run, codec } => {
                let mut bytes = Vec::new();
                codec.encode(&value, &mut bytes)?;
                run.add(key, bytes)?;
                run.run()?;
            }
        }
        self.count += 1;
        Ok(())
    }

    fn len(&self) -> usize {
        self.count
    }

    fn take_output(&mut self) -> Result<Option<KeyedGroups<K, V>>> {
        if self.count == 0 {
            return Ok(None);
        }
        self.count = 0;
        match &mut self.store {
            GroupStore::Memory {
                index,
                groups,
                order,
            } => {
                index.clear();
                let mut groups = std::mem::take(groups);
                if let Some(order) = order {
                    groups.sort_by(|a, b| order(&a.0, &b.0));
                }
                Ok(Some(KeyedGroups::memory(groups)))
            }
            GroupStore::Disk { run, codec } => {
                run.switch_to_reading()?;
                Ok(Some(KeyedGroups::disk(run.read_iterator()?, codec.clone())))
            }
        }
    }
}

/// Per-key reduction keeping first-seen key order.
pub struct KeyedReduceAccumulator<K, V> {
    function: Arc<dyn ReduceFunction<V>>,
    values: HashMap<K, V>,
    order: Vec<K>,
    max_keys: usize,
    count: usize,
}

impl<K, V> KeyedReduceAccumulator<K, V> {
    pub fn new(function: Arc<dyn ReduceFunction<V>>, max_keys: usize) -> Self {
        Self {
            function,
            values: HashMap::new(),
            order: Vec::new(),
            max_keys,
            count: 0,
        }
    }
}

impl<K, V> Accumulator<(K, V)> for KeyedReduceAccumulator<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Send,
{
    type Output = Vec<(K, V)>;

    fn add(&mut self, (key, value): (K, V)) -> Result<()> {
        let combined = match self.values.remove(&key) {
            Some(acc) => self.function.reduce(acc, value),
            None => {
                self.order.push(key.clone());
                value
            }
        };
        self.values.insert(key, combined);
        self.count += 1;
        Ok(())
    }

    fn len(&self) -> usize {
        self.count
    }

    fn is_full(&self) -> bool {
        self.order.len() >= self.max_keys
    }

    fn take_output(&mut self) -> Result<Option<Vec<(K, V)>>> {
        if self.order.is_empty() {
            return Ok(None);
        }
        self.count = 0;
        let out = std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|k| self.values.remove(&k).map(|v| (k, v)))
            .collect();
        Ok(Some(out))
    }
}

/// Buffers a partial stage's values per destination.
pub trait Combiner<M>: Send {
    /// Buffer `item` for `destination`, or hand it back when full.
    fn offer(&mut self, destination: TaskId, item: M) -> std::result::Result<(), M>;

    /// Destinations whose buffer should be sent now.
    fn ready(&self) -> Vec<TaskId>;

    fn take(&mut self, destination: TaskId) -> Vec<M>;

    /// Destinations holding buffered values, ascending.
    fn destinations(&self) -> Vec<TaskId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixed-size batches per destination.
pub struct BatchCombiner<M> {
    batch_size: usize,
    buffers: BTreeMap<TaskId, Vec<M>>,
    len: usize,
}

impl<M> BatchCombiner<M> {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            buffers: BTreeMap::new(),
            len: 0,
        }
    }
}

impl<M: Send> Combiner<M> for BatchCombiner<M> {
    fn offer(&mut self, destination: TaskId, item: M) -> std::result::Result<(), M> {
        self.buffers.entry(destination).or_default().push(item);
        self.len += 1;
        Ok(())
    }

    fn ready(&self) -> Vec<TaskId> {
        self.buffers
            .iter()
            .filter(|(_, b)| b.len() >= self.batch_size)
            .map(|(d, _)| *d)
            .collect()
    }

    fn take(&mut self, destination: TaskId) -> Vec<M> {
        let items = self.buffers.remove(&destination).unwrap_or_default();
        self.len -= items.len();
        items
    }

    fn destinations(&self) -> Vec<TaskId> {
        self.buffers
            .iter()
            .filter(|(_, b)| !b.is_empty())
            .map(|(d, _)| *d)
            .collect()
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Combines values of equal keys before they leave the worker. Holds at
/// most `max_keys` distinct keys across all destinations.
pub struct KeyedCombiner<K, V> {
    function: Arc<dyn ReduceFunction<V>>,
    max_keys: usize,
    buffers: BTreeMap<TaskId, KeyedReduceAccumulator<K, V>>,
    keys: usize,
}

impl<K, V> KeyedCombiner<K, V> {
    pub fn new(function: Arc<dyn ReduceFunction<V>>, max_keys: usize) -> Self {
        Self {
            function,
            max_keys: max_keys.max(1),
            buffers: BTreeMap::new(),
            keys: 0,
        }
    }
}

impl<K, V> Combiner<(K, V)> for KeyedCombiner<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Send,
{
    fn offer(&mut self, destination: TaskId, (key, value): (K, V)) -> std::result::Result<(), (K, V)> {
        let known = self
            .buffers
            .get(&destination)
            .is_some_and(|b| b.values.contains_key(&key));
        if !known && self.keys >= self.max_keys {
            return Err((key, value));
        }
        let function = &self.function;
        let buffer = self
            .buffers
            .entry(destination)
            .or_insert_with(|| KeyedReduceAccumulator::new(function.clone(), usize::MAX));
        if !known {
            self.keys += 1;
        }
        // never fails
        let _ = buffer.add((key, value));
        Ok(())
    }

    fn ready(&self) -> Vec<TaskId> {
        Vec::new()
    }

    fn take(&mut self, destination: TaskId) -> Vec<(K, V)> {
        let Some(mut buffer) = self.buffers.remove(&destination) else {
            return Vec::new();
        };
        self.keys -= buffer.order.len();
        buffer.take_output().ok().flatten().unwrap_or_default()
    }

    fn destinations(&self) -> Vec<TaskId> {
        self.buffers
            .iter()
            .filter(|(_, b)| !b.order.is_empty())
            .map(|(d, _)| *d)
            .collect()
    }

    fn len(&self) -> usize {
        self.keys
    }
}
