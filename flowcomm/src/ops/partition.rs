use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use flowcomm_shuffle::ShuffleConfig;

use super::accumulate::{BatchCombiner, ValuesAccumulator};
use super::partition_stage::PartitionCore;
use super::{EdgePlan, Operation, PartitionValues};
use crate::context::CommContext;
use crate::error::Result;
use crate::protocol::codec::Codec;
use crate::receiver::Receiver;
use crate::selector::{DestinationSelector, LoadBalanceSelector};
use crate::types::{Mode, OperationKind, TaskId};

/// Spread values from every source over the destinations.
///
/// The destination of each value comes from a [`DestinationSelector`],
/// round robin per source by default, or is named by the caller with
/// [`partition_to`](Self::partition_to).
pub struct Partition<T: Clone + Send + 'static> {
    core: PartitionCore<T, BatchCombiner<T>, ValuesAccumulator<T>>,
    selector: Box<dyn DestinationSelector<T>>,
    codec: Arc<dyn Codec<T>>,
    shuffle: ShuffleConfig,
}

impl<T: Clone + Send + 'static> Partition<T> {
    pub fn new(
        ctx: &CommContext,
        plan: EdgePlan,
        codec: Arc<dyn Codec<T>>,
        receiver: impl Receiver<PartitionValues<T>> + 'static,
    ) -> Result<Self> {
        let core = PartitionCore::new(
            ctx,
            OperationKind::Partition,
            plan,
            Arc::clone(&codec),
            BatchCombiner::new(ctx.config.partition_batch_size),
            Box::new(|_: TaskId| ValuesAccumulator::memory()),
            Box::new(receiver),
        )?;
        let mut selector = LoadBalanceSelector::new();
        DestinationSelector::<T>::prepare(
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

    pub fn with_selector(mut self, mut selector: impl DestinationSelector<T> + 'static) -> Self {
        selector.prepare(self.core.router().sources(), self.core.router().destinations());
        self.selector = Box::new(selector);
        self
    }

    /// Spill each destination's values under `dir` instead of holding them
    /// in memory. Batch mode only.
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

    /// Send `value` to the destination the selector picks.
    pub fn partition(&mut self, source: TaskId, value: &T) -> Result<bool> {
        let destination = self.selector.next(source, value);
        let sent = self.partition_to(source, value, destination)?;
        if sent {
            self.selector.commit(source, destination);
        }
        Ok(sent)
    }

    pub fn partition_to(&mut self, source: TaskId, value: &T, destination: TaskId) -> Result<bool> {
        self.core.send(source, destination, || value.clone())
    }

    pub fn finish(&mut self, source: TaskId) -> Result<bool> {
        self.core.finish(source)
    }

    pub fn barrier(&mut self, source: TaskId, marker: &[u8]) -> Result<bool> {
        self.core.barrier(source, marker)
    }

    /// Values each local destination received since the last reset.
    pub fn received(&self) -> BTreeMap<TaskId, usize> {
        self.core.received()
    }
}

impl<T: Clone + Send + 'static> Operation for Partition<T> {
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
