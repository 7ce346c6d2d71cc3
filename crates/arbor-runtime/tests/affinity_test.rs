//! CPU distribution and resource arithmetic against a synthetic topology.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use arbor_common::config::DaemonConfig;
use arbor_common::types::ContainerState;
use arbor_common::ErrorKind;
use arbor_core::cpumask::{CpuMask, Topology};
use arbor_runtime::{affinity, lifecycle, resources};
use arbor_runtime::{ClientContext, Runtime};

/// 2 physical cores with 2 SMT threads each: siblings are {0,2} and {1,3}.
fn smt_runtime() -> (tempfile::TempDir, Arc<Runtime>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = DaemonConfig::default();
    config.kvs_dir = dir.path().join("kvs");
    config.memory_guarantee_reserve = 64 << 20;
    let rt = Runtime::builder(config)
        .host_memory(1 << 30)
        .topology(Topology::synthetic(2, 2))
        .build()
        .expect("runtime");
    (dir, rt)
}

fn mask(list: &str) -> CpuMask {
    list.parse().expect("mask")
}

// ── Core and thread reservation ──────────────────────────────────────

#[test]
fn core_reservation_takes_both_smt_siblings() {
    let (_dir, rt) = smt_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("a");
    let ab = lifecycle::create(&rt, &client, "a/b").expect("a/b");

    lifecycle::set_property(&rt, &client, &ab, "cpu_set", "cores 1").expect("cpu_set");
    a.set_state(&rt, ContainerState::Meta);
    ab.set_state(&rt, ContainerState::Starting);

    affinity::distribute_cpus(&rt, &rt.root()).expect("distribute");

    let b_data = ab.lock_data();
    assert_eq!(b_data.cpu_affinity, mask("0,2"), "whole core with its sibling");
    assert_eq!(b_data.cpu_reserve, mask("0,2"));
    drop(b_data);

    let a_data = a.lock_data();
    assert_eq!(a_data.cpu_affinity, mask("0-3"), "parent keeps its whole mask");
    assert_eq!(a_data.cpu_vacant, mask("1,3"), "reserved cpus leave the vacant set");
}

#[test]
fn thread_reservation_prefers_whole_cores() {
    let (_dir, rt) = smt_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("a");
    lifecycle::set_property(&rt, &client, &a, "cpu_set", "threads 2").expect("cpu_set");
    a.set_state(&rt, ContainerState::Starting);

    affinity::distribute_cpus(&rt, &rt.root()).expect("distribute");

    let data = a.lock_data();
    assert_eq!(data.cpu_affinity.weight(), 2);
    assert_eq!(
        data.cpu_affinity,
        mask("0,2"),
        "both threads come from one core before breaking another"
    );
}

#[test]
fn reserve_keeps_parent_wide_affinity() {
    let (_dir, rt) = smt_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("a");
    lifecycle::set_property(&rt, &client, &a, "cpu_set", "reserve 1").expect("cpu_set");
    a.set_state(&rt, ContainerState::Starting);

    affinity::distribute_cpus(&rt, &rt.root()).expect("distribute");

    let data = a.lock_data();
    assert_eq!(data.cpu_affinity, mask("0-3"), "reservation without masking");
    assert_eq!(data.cpu_reserve.weight(), 1);
}

#[test]
fn oversized_reservation_names_the_container() {
    let (_dir, rt) = smt_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("a");
    lifecycle::set_property(&rt, &client, &a, "cpu_set", "cores 3").expect("cpu_set");
    a.set_state(&rt, ContainerState::Starting);

    let err = affinity::distribute_cpus(&rt, &rt.root()).expect_err("too many cores");
    assert_eq!(err.kind, ErrorKind::ResourceNotAvailable);
    assert!(err.text.contains(&a.id.to_string()) || err.text.contains("a"));
}

#[test]
fn reserve_cpus_rolls_back_on_failure() {
    let topo = Topology::synthetic(2, 2);
    let mut vacant = mask("0-3");
    let err = affinity::reserve_cpus(&topo, &mut vacant, 0, 3, false).expect_err("3 cores of 2");
    assert_eq!(err.kind, ErrorKind::ResourceNotAvailable);
    assert_eq!(vacant, mask("0-3"), "vacant set restored after failure");

    let (threads, cores) = affinity::reserve_cpus(&topo, &mut vacant, 0, 1, false).expect("1 core");
    assert_eq!(threads.weight(), 2);
    assert_eq!(cores.weight(), 1);
    assert_eq!(vacant, mask("1,3"));
}

#[test]
fn node_placement_uses_numa_lists() {
    let (_dir, rt) = smt_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("a");
    lifecycle::set_property(&rt, &client, &a, "cpu_set", "node 0").expect("cpu_set");
    a.set_state(&rt, ContainerState::Starting);

    affinity::distribute_cpus(&rt, &rt.root()).expect("distribute");
    assert_eq!(a.lock_data().cpu_affinity, mask("0-3"));

    lifecycle::set_property(&rt, &client, &a, "cpu_set", "node 7").expect("cpu_set");
    let err = affinity::distribute_cpus(&rt, &rt.root()).expect_err("missing node");
    assert_eq!(err.kind, ErrorKind::ResourceNotAvailable);
}

// ── Memory guarantee roll-up ─────────────────────────────────────────

#[test]
fn memory_guarantee_overcommit_is_detected() {
    let (_dir, rt) = smt_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("a");
    let b = lifecycle::create(&rt, &client, "b").expect("b");

    lifecycle::set_property(&rt, &client, &a, "memory_guarantee", "600M").expect("a guarantee");
    lifecycle::set_property(&rt, &client, &b, "memory_guarantee", "600M").expect("b guarantee");

    // Only "a" live: 600M + 64M reserve fits into 1G.
    a.set_state(&rt, ContainerState::Running);
    resources::check_mem_guarantee(&rt).expect("single guarantee fits");

    // Second one starting pushes the roll-up over the edge.
    b.set_state(&rt, ContainerState::Starting);
    let err = resources::check_mem_guarantee(&rt).expect_err("overcommit");
    assert_eq!(err.kind, ErrorKind::ResourceNotAvailable);
    assert!(err.text.contains("overcommit"), "text names the overcommit: {}", err.text);
}

#[test]
fn guarantee_rollup_takes_max_of_node_and_children() {
    let (_dir, rt) = smt_runtime();
    let client = ClientContext::system();
    let a = lifecycle::create(&rt, &client, "a").expect("a");
    let ab = lifecycle::create(&rt, &client, "a/b").expect("a/b");

    lifecycle::set_property(&rt, &client, &a, "memory_guarantee", "100M").expect("a");
    lifecycle::set_property(&rt, &client, &ab, "memory_guarantee", "300M").expect("a/b");

    a.set_state(&rt, ContainerState::Meta);
    ab.set_state(&rt, ContainerState::Running);

    assert_eq!(resources::total_mem_guarantee(&a), 300 << 20, "children dominate");

    lifecycle::set_property(&rt, &client, &a, "memory_guarantee", "500M").expect("a wider");
    assert_eq!(resources::total_mem_guarantee(&a), 500 << 20, "own guarantee dominates");
}
