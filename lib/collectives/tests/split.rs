// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::{DEVICES, WORLD, assert_all, run_ranks, test_config};
use dynamo_collectives::{
    BroadcastOptions, ChannelOrigin, ProcessGroup, ProcessGroupOptions, ReduceOp,
};

#[test]
fn test_split_from_parent() {
    run_ranks(WORLD, DEVICES, test_config(), |ctx| {
        let tensors = ctx.ranked_tensors();
        ctx.pg
            .broadcast(&tensors, BroadcastOptions::default())
            .unwrap()
            .wait(None)
            .unwrap();
        let Some(ChannelOrigin::Fresh { .. }) = ctx.pg.communicator_origin(&[0, 1]) else {
            panic!("parent communicator should be bootstrapped");
        };

        let options = ProcessGroupOptions::builder()
            .config(test_config())
            .split_from(ctx.pg.clone())
            .split_color(2)
            .build()
            .unwrap();
        let child = ProcessGroup::new(ctx.store.clone(), ctx.rank, ctx.world, ctx.backends.clone(), options)
            .unwrap();
        assert_eq!(child.group_name(), "default_pg.0");

        let tensors = ctx.ranked_tensors();
        let options = BroadcastOptions {
            root_rank: 1,
            root_tensor: 1,
        };
        child.broadcast(&tensors, options).unwrap().wait(None).unwrap();
        for tensor in &tensors {
            assert_all(tensor, (ctx.devices + 1) as f64);
        }

        // the parent keeps working alongside the child
        let tensors = ctx.ranked_tensors();
        ctx.pg
            .broadcast(&tensors, BroadcastOptions::default())
            .unwrap()
            .wait(None)
            .unwrap();
        for tensor in &tensors {
            assert_all(tensor, 0.0);
        }

        assert_eq!(child.comm_split_count(), 0);
        assert_eq!(ctx.pg.comm_split_count(), ctx.devices as u64);
        match child.communicator_origin(&[0, 1]) {
            Some(ChannelOrigin::SplitFrom { color, .. }) => assert_eq!(color, 2),
            other => panic!("unexpected origin {other:?}"),
        }
    });
}

#[test]
fn test_split_by_rank_color() {
    run_ranks(WORLD, DEVICES, test_config(), |ctx| {
        let tensors = ctx.ranked_tensors();
        ctx.pg.all_reduce(&tensors, ReduceOp::Sum).unwrap().wait(None).unwrap();

        // each rank ends up alone with its own devices
        let options = ProcessGroupOptions::builder()
            .config(test_config())
            .group_name(format!("solo-{}", ctx.rank))
            .split_from(ctx.pg.clone())
            .split_color(ctx.rank as i32)
            .build()
            .unwrap();
        let child = ProcessGroup::new(ctx.store.clone(), 0, 1, ctx.backends.clone(), options).unwrap();

        let tensors = ctx.ranked_tensors();
        child.all_reduce(&tensors, ReduceOp::Sum).unwrap().wait(None).unwrap();
        let base = ctx.rank * ctx.devices;
        let expected: usize = (base..base + ctx.devices).sum();
        for tensor in &tensors {
            assert_all(tensor, expected as f64);
        }
    });
}

#[test]
fn test_child_without_parent_communicator_bootstraps() {
    run_ranks(WORLD, DEVICES, test_config(), |ctx| {
        let options = ProcessGroupOptions::builder()
            .config(test_config())
            .split_from(ctx.pg.clone())
            .split_color(0)
            .build()
            .unwrap();
        let child = ProcessGroup::new(ctx.store.clone(), ctx.rank, ctx.world, ctx.backends.clone(), options)
            .unwrap();

        let tensors = ctx.ranked_tensors();
        child.all_reduce(&tensors[..1], ReduceOp::Sum).unwrap().wait(None).unwrap();
        assert_all(&tensors[0], (ctx.devices * (ctx.world - 1) * ctx.world / 2) as f64);

        assert!(matches!(
            child.communicator_origin(&[0]),
            Some(ChannelOrigin::Fresh { .. })
        ));
        assert_eq!(ctx.pg.comm_split_count(), 0);
    });
}
