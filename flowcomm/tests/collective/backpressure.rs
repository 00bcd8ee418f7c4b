use std::collections::HashMap;
use std::sync::Arc;

use flowcomm::protocol::codec::ScalarCodec;
use flowcomm::{
    ChannelOperation, CommConfig, CommContext, Delivery, EdgePlan, EdgeSpec, Flags, LocalNetwork,
    LogicalPlan, Offer, OperationKind, Partition, PartitionValues, Payload, Result,
    RoutingParameters, Sink, WorkerId,
};

use super::helpers::{Cluster, DEADLINE, collector, drive, push, take};

fn tight() -> CommConfig {
    CommConfig {
        buffer_size: 32,
        send_buffer_count: 4,
        receive_buffer_count: 4,
        max_buffers_per_message: 2,
        send_pending_max: 2,
        receive_pending_max: 2,
        receive_queue_max: 4,
        progress_batch: 1,
        partition_batch_size: 4,
        window_count: 4,
        ..CommConfig::default()
    }
}

#[test]
fn test_partition_converges_under_tight_limits() {
    let cluster = Cluster::new(3, 2).with_config(tight()).with_link_capacity(2);
    let plan = EdgePlan::batch(0, cluster.tasks(), cluster.tasks());
    let results = cluster.run(|ctx| {
        let (out, receiver) = collector::<PartitionValues<i64>>();
        let mut op = Partition::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i64>::new()),
            receiver,
        )
        .unwrap();
        for &s in ctx.plan.local_tasks() {
            for i in 0..120 {
                push(&mut op, |op| op.partition(s, &(i64::from(s) * 1000 + i)));
            }
            push(&mut op, |op| op.finish(s));
        }
        drive(&mut op);
        let mut values: Vec<i64> = take(&out)
            .into_iter()
            .flat_map(|(_, v)| v.into_vec().unwrap())
            .collect();
        values.sort_unstable();
        values
    });

    let mut all: Vec<i64> = results.into_iter().flatten().collect();
    all.sort_unstable();
    let expected: Vec<i64> = (0..6)
        .flat_map(|s| (0..120).map(move |i| s * 1000 + i))
        .collect();
    assert_eq!(all, expected);
    assert_eq!(cluster.network.frames_in_flight(), 0);
}

/// Accepts two deliveries out of three.
#[derive(Default)]
struct Flaky {
    got: Vec<i64>,
    tick: usize,
}

impl Sink<i64> for Flaky {
    fn on_message(&mut self, delivery: Delivery<i64>) -> Result<Offer<i64>> {
        self.tick += 1;
        if self.tick % 3 == 0 {
            return Ok(Offer::Refused(delivery));
        }
        self.got.extend(delivery.payload.into_values());
        Ok(Offer::Accepted)
    }
}

fn engine(net: &LocalNetwork, worker: WorkerId) -> ChannelOperation<i64> {
    let plan = LogicalPlan::uniform(2, 1, worker).unwrap();
    let ctx = CommContext::new(tight(), plan, net.channel(worker)).unwrap();
    let spec = EdgeSpec {
        edge: 9,
        kind: OperationKind::Partition,
        local_sources: if worker == 0 { vec![0] } else { Vec::new() },
        receive_workers: if worker == 1 { vec![0] } else { Vec::new() },
        receive_targets: HashMap::from([(1, 1)]),
    };
    ChannelOperation::new(&ctx, spec, Arc::new(ScalarCodec::<i64>::new())).unwrap()
}

#[test]
fn test_engine_returns_every_buffer() {
    let net = LocalNetwork::with_link_capacity(2, 1);
    let mut tx = engine(&net, 0);
    let mut rx = engine(&net, 1);
    let mut tx_sink = Flaky::default();
    let mut sink = Flaky::default();
    let start = std::time::Instant::now();

    let mut step = |tx: &mut ChannelOperation<i64>, rx: &mut ChannelOperation<i64>| {
        tx.progress(&mut tx_sink).unwrap();
        rx.progress(&mut sink).unwrap();
        assert!(start.elapsed() < DEADLINE, "engines stalled");
    };
    for v in 0..200i64 {
        let payload = if v % 10 == 0 {
            Payload::Batch(vec![v; 3])
        } else {
            Payload::Single(v)
        };
        while !tx.can_send(0, Flags::NONE).unwrap() {
            step(&mut tx, &mut rx);
        }
        assert!(
            tx.send(0, payload, Flags::NONE, RoutingParameters::external(1, vec![1]))
                .unwrap()
        );
    }
    while !(tx.is_complete() && rx.is_complete() && net.frames_in_flight() == 0) {
        step(&mut tx, &mut rx);
    }

    let mut expected = Vec::new();
    for v in 0..200i64 {
        let n = if v % 10 == 0 { 3 } else { 1 };
        expected.extend(std::iter::repeat_n(v, n));
    }
    assert_eq!(sink.got, expected);
    assert!(tx_sink.got.is_empty());
    assert_eq!(tx.send_pool().available(), tx.send_pool().count());
    assert_eq!(rx.receive_pool().available(), rx.receive_pool().count());
}
