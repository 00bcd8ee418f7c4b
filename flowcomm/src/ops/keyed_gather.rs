use std::hash::Hash;
use std::path::Path;
use std::sync::Arc;

use flowcomm_shuffle::{KeyComparator, ShuffleConfig};

use super::accumulate::{BatchCombiner, GroupsAccumulator};
use super::partition_stage::PartitionCore;
use super::{EdgePlan, KeyedGroups, Operation};
use crate::context::CommContext;
use crate::error::{CommError, Result};
use crate::protocol::codec::{Codec, PairCodec};
use crate::receiver::Receiver;
use crate::selector::{DestinationSelector, HashSelector};
use crate::types::{Mode, OperationKind, TaskId};

/// Group values by key at the destination the key hashes to.
///
/// Groups come in first-seen key order unless a comparator is set with
/// [`sorted_by`](Self::sorted_by). With [`with_disk`](Self::with_disk) the
/// groups are spilled and merged from disk, sorted by that comparator.
pub struct KeyedGather<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    core: PartitionCore<(K, V), BatchCombiner<(K, V)>, GroupsAccumulator<K, V>>,
    selector: Box<dyn DestinationSelector<K>>,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    order: Option<KeyComparator<K>>,
    shuffle: ShuffleConfig,
}

impl<K, V> KeyedGather<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(
        ctx: &CommContext,
        plan: EdgePlan,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
        receiver: impl Receiver<KeyedGroups<K, V>> + 'static,
    ) -> Result<Self> {
        let codec: Arc<dyn Codec<(K, V)>> = Arc::new(PairCodec::new(
            Arc::clone(&key_codec),
            Arc::clone(&value_codec),
        ));
        let core = PartitionCore::new(
            ctx,
            OperationKind::KeyedGather,
            plan,
            codec,
            BatchCombiner::new(ctx.config.partition_batch_size),
            Box::new(|_: TaskId| GroupsAccumulator::memory(None)),
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
            key_codec,
            value_codec,
            order: None,
            shuffle: ctx.config.shuffle.clone(),
        })
    }

    pub fn with_selector(mut self, mut selector: impl DestinationSelector<K> + 'static) -> Self {
        selector.prepare(self.core.router().sources(), self.core.router().destinations());
        self.selector = Box::new(selector);
        self
    }

    /// Deliver groups ordered by `order`.
    pub fn sorted_by(mut self, order: KeyComparator<K>) -> Self {
        let memory = Arc::clone(&order);
        self.core.set_factory(Box::new(move |_: TaskId| {
            GroupsAccumulator::memory(Some(Arc::clone(&memory)))
        }));
        self.order = Some(order);
        self
    }

    /// Spill groups under `dir` and merge them sorted. Needs
    /// [`sorted_by`](Self::sorted_by) first; batch mode only.
    pub fn with_disk(mut self, dir: &Path) -> Result<Self> {
        self.core.plan().require(Mode::Batch, "with_disk")?;
        let Some(order) = self.order.clone() else {
            return Err(CommError::InvalidConfig(
                "keyed gather needs a key order to spill to disk".into(),
            ));
        };
        let (dir, edge) = (dir.to_path_buf(), self.core.plan().edge);
        let (keys, values) = (Arc::clone(&self.key_codec), Arc::clone(&self.value_codec));
        let shuffle = self.shuffle.clone();
        self.core.set_factory(Box::new(move |target: TaskId| {
            GroupsAccumulator::disk(
                &dir,
                format!("edge-{edge}-target-{target}"),
                shuffle.clone(),
                Arc::clone(&order),
                Arc::clone(&keys),
                Arc::clone(&values),
            )
        }));
        Ok(self)
    }

    pub fn gather(&mut self, source: TaskId, key: &K, value: &V) -> Result<bool> {
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

impl<K, V> Operation for KeyedGather<K, V>
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
