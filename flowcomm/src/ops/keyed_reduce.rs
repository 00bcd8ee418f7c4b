use std::hash::Hash;
use std::sync::Arc;

use super::accumulate::{KeyedCombiner, KeyedReduceAccumulator};
use super::partition_stage::PartitionCore;
use super::{EdgePlan, Operation};
use crate::context::CommContext;
use crate::error::Result;
use crate::protocol::codec::{Codec, PairCodec};
use crate::receiver::Receiver;
use crate::reduce::ReduceFunction;
use crate::selector::{DestinationSelector, HashSelector};
use crate::types::{Mode, OperationKind, TaskId};

/// Reduce values per key at the destination the key hashes to.
///
/// Each worker combines equal keys before sending, holding at most
/// `keyed_max_keys` distinct keys; a new key beyond that flushes what it
/// holds. Streaming destinations deliver their reduced pairs per window,
/// or earlier once they hold `keyed_max_keys` keys.
pub struct KeyedReduce<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    core: PartitionCore<(K, V), KeyedCombiner<K, V>, KeyedReduceAccumulator<K, V>>,
    selector: Box<dyn DestinationSelector<K>>,
}

impl<K, V> KeyedReduce<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(
        ctx: &CommContext,
        plan: EdgePlan,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
        function: Arc<dyn ReduceFunction<V>>,
        receiver: impl Receiver<Vec<(K, V)>> + 'static,
    ) -> Result<Self> {
        let codec: Arc<dyn Codec<(K, V)>> = Arc::new(PairCodec::new(key_codec, value_codec));
        let max_keys = ctx.config.keyed_max_keys;
        let final_keys = match plan.mode {
            Mode::Streaming => max_keys,
            Mode::Batch => usize::MAX,
        };
        let combiner = KeyedCombiner::new(Arc::clone(&function), max_keys);
        let core = PartitionCore::new(
            ctx,
            OperationKind::KeyedReduce,
            plan,
            codec,
            combiner,
            Box::new(move |_: TaskId| KeyedReduceAccumulator::new(Arc::clone(&function), final_keys)),
            Box::new(receiver),
        )?;
        let mut selector = HashSelector::new();
        DestinationSelector::<K>::prepare(
            &mut selector,
            core.router().sources(),
            core.router().destinations(),
        );
        Ok(Self {
            core,
            selector: Box::new(selector),
        })
    }

    pub fn with_selector(mut self, mut selector: impl DestinationSelector<K> + 'static) -> Self {
        selector.prepare(self.core.router().sources(), self.core.router().destinations());
        self.selector = Box::new(selector);
        self
    }

    pub fn reduce(&mut self, source: TaskId, key: &K, value: &V) -> Result<bool> {
        let destination = self.selector.next(source, key);
        let sent = self
            .core
            .send(source, destination, || (key.clone(), value.clone()))?;
        if sent {
            self.selector.commit(source, destination);
        }
        Ok(sent)
    }

    pub fn finish(&mut self, source: TaskId) -> Result<bool> {
        self.core.finish(source)
    }

    pub fn barrier(&mut self, source: TaskId, marker: &[u8]) -> Result<bool> {
        self.core.barrier(source, marker)
    }
}

impl<K, V> Operation for KeyedReduce<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn progress(&mut self) -> Result<bool> {
        self.core.progress()
    }

    fn has_pending(&self) -> bool {
        self.core.has_pending()
    }

    fn is_complete(&self) -> bool {
        self.core.is_complete()
    }

    fn close(&mut self) -> Result<()> {
        self.core.close()
    }

    fn reset(&mut self) -> Result<()> {
        self.core.reset()
    }
}
