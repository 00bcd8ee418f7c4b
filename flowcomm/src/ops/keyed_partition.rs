use std::collections::BTreeMap;
use std::hash::Hash;
use std::path::Path;
use std::sync::Arc;

use flowcomm_shuffle::ShuffleConfig;

use super::accumulate::{BatchCombiner, ValuesAccumulator};
use super::partition_stage::PartitionCore;
use super::{EdgePlan, Operation, PartitionValues};
use crate::context::CommContext;
use crate::error::Result;
use crate::protocol::codec::{Codec, PairCodec};
use crate::receiver::Receiver;
use crate::selector::{DestinationSelector, HashSelector};
use crate::types::{Mode, OperationKind, TaskId};

/// Route `(key, value)` pairs to the destination chosen from the key, by
/// default its hash.
pub struct KeyedPartition<K, V>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    core: PartitionCore<(K, V), BatchCombiner<(K, V)>, ValuesAccumulator<(K, V)>>,
    selector: Box<dyn DestinationSelector<K>>,
    codec: Arc<dyn Codec<(K, V)>>,
    shuffle: ShuffleConfig,
}

impl<K, V> KeyedPartition<K, V>
where
    K: Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(
        ctx: &CommContext,
        plan: EdgePlan,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
        receiver: impl Receiver<PartitionValues<(K, V)>> + 'static,
    ) -> Result<Self> {
        let codec: Arc<dyn Codec<(K, V)>> = Arc::new(PairCodec::new(key_codec, value_codec));
        let core = PartitionCore::new(
            ctx,
            OperationKind::KeyedPartition,
            plan,
            Arc::clone(&codec),
            BatchCombiner::new(ctx.config.partition_batch_size),
            Box::new(|_: TaskId| ValuesAccumulator::memory()),
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
            codec,
            shuffle: ctx.config.shuffle.clone(),
        })
    }

    pub fn with_selector(mut self, mut selector: impl DestinationSelector<K> + 'static) -> Self {
        selector.prepare(self.core.router().sources(), self.core.router().destinations());
        self.selector = Box::new(selector);
        self
    }

    /// Spill each destination's pairs under `dir`. Batch mode only.
    pub fn with_disk(mut self, dir: &Path) -> Result<Self> {
        self.core.plan().require(Mode::Batch, "with_disk")?;
        let (dir, edge) = (dir.to_path_buf(), self.core.plan().edge);
        let (codec, shuffle) = (Arc::clone(&self.codec), self.shuffle.clone());
        self.core.set_factory(Box::new(move |target: TaskId| {
            ValuesAccumulator::disk(
                &dir,
                format!("edge-{edge}-target-{target}"),
                shuffle.clone(),
                Arc::clone(&codec),
            )
        }));
        Ok(self)
    }

    pub fn partition(&mut self, source: TaskId, key: &K, value: &V) -> Result<bool> {
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

    pub fn received(&self) -> BTreeMap<TaskId, usize> {
        self.core.received()
    }
}

impl<K, V> Operation for KeyedPartition<K, V>
where
    K: Hash + Clone + Send + 'static,
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
