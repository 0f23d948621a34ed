//! Integration tests for replicated storage convergence.
//!
//! These tests simulate multiple replicas exchanging operation streams
//! and assert that every replica ends at the same serialized tree: under
//! interleaved delivery, under register conflicts, and across
//! snapshot-then-replay recovery.

use proptest::prelude::*;
use room_storage::{Op, Position, SerializedCrdt, StorageDoc};
use serde_json::json;

/// Drains one replica's outbound ops and applies them to the others.
fn broadcast(from: &mut StorageDoc, to: &mut [&mut StorageDoc]) -> Vec<Op> {
    let ops = from.take_outbound();
    for replica in to {
        replica.apply_remote_ops(&ops);
    }
    ops
}

/// A fresh replica hydrated from another replica's current state.
fn fork(source: &StorageDoc, actor: u8) -> StorageDoc {
    StorageDoc::from_snapshot(&source.serialize(), source.clock())
        .expect("snapshot of a live doc is valid")
        .with_actor(actor)
}

#[test]
fn test_replicas_converge_under_interleaved_delivery() {
    // Two actors generate independent op streams against the same seed.
    let mut seed = StorageDoc::new();
    let root = seed.root();
    seed.set(root, "items", SerializedCrdt::list()).unwrap();
    seed.take_outbound();

    let mut a = fork(&seed, 1);
    let mut b = fork(&seed, 2);

    let a_list = a.child(a.root(), "items").unwrap();
    a.set(a.root(), "from_a", json!("alpha")).unwrap();
    a.list_push(a_list, json!("a1")).unwrap();
    a.list_push(a_list, json!("a2")).unwrap();
    let a_ops = a.take_outbound();

    let b_list = b.child(b.root(), "items").unwrap();
    b.set(b.root(), "from_b", json!("beta")).unwrap();
    b.list_push(b_list, json!("b1")).unwrap();
    b.delete(b.root(), "from_b").unwrap();
    b.set(b.root(), "from_b2", json!(7)).unwrap();
    let b_ops = b.take_outbound();

    // Each stream is FIFO per sender, but the two streams interleave
    // differently on every replica.
    a.apply_remote_ops(&b_ops);
    b.apply_remote_ops(&a_ops);

    let mut c = fork(&seed, 3);
    for op in a_ops.iter().chain(b_ops.iter()) {
        c.apply_remote_ops(std::slice::from_ref(op));
    }

    let mut d = fork(&seed, 4);
    let (mut i, mut j) = (0, 0);
    while i < a_ops.len() || j < b_ops.len() {
        if j < b_ops.len() {
            d.apply_remote_ops(std::slice::from_ref(&b_ops[j]));
            j += 1;
        }
        if i < a_ops.len() {
            d.apply_remote_ops(std::slice::from_ref(&a_ops[i]));
            i += 1;
        }
    }

    let expected = a.serialize();
    assert_eq!(b.serialize(), expected);
    assert_eq!(c.serialize(), expected);
    assert_eq!(d.serialize(), expected);
}

#[test]
fn test_lww_higher_clock_wins_in_any_order() {
    let low = Op::Set {
        path: vec![],
        key: "v".into(),
        value: json!("low").into(),
        clock: 3,
    };
    let high = Op::Set {
        path: vec![],
        key: "v".into(),
        value: json!("high").into(),
        clock: 8,
    };

    let mut forward = StorageDoc::new();
    forward.apply_remote_ops(&[low.clone(), high.clone()]);

    let mut backward = StorageDoc::new();
    backward.apply_remote_ops(&[high, low]);

    assert_eq!(forward.serialize(), backward.serialize());
    assert_eq!(forward.get_json(forward.root(), "v"), Some(json!("high")));
}

#[test]
fn test_lww_equal_clocks_first_delivery_wins_identically() {
    let first = Op::Set {
        path: vec![],
        key: "v".into(),
        value: json!("first").into(),
        clock: 5,
    };
    let second = Op::Set {
        path: vec![],
        key: "v".into(),
        value: json!("second").into(),
        clock: 5,
    };

    // All replicas receive the relay in the same order, so all keep the
    // first write and discard the tie.
    let mut replicas: Vec<StorageDoc> = (0..4).map(|_| StorageDoc::new()).collect();
    for doc in &mut replicas {
        let applied = doc.apply_remote_ops(&[first.clone(), second.clone()]);
        assert_eq!(applied, vec![true, false]);
    }
    let expected = replicas[0].serialize();
    for doc in &replicas[1..] {
        assert_eq!(doc.serialize(), expected);
        assert_eq!(doc.get_json(doc.root(), "v"), Some(json!("first")));
    }
}

#[test]
fn test_concurrent_inserts_at_same_index_interleave() {
    let mut seed = StorageDoc::new();
    let root = seed.root();
    seed.set(root, "list", SerializedCrdt::list()).unwrap();
    let list = seed.child(root, "list").unwrap();
    seed.list_push(list, json!("a")).unwrap();
    seed.list_push(list, json!("c")).unwrap();
    seed.take_outbound();

    let mut a = fork(&seed, 1);
    let mut b = fork(&seed, 2);

    let a_list = a.child(a.root(), "list").unwrap();
    let b_list = b.child(b.root(), "list").unwrap();
    a.list_insert(a_list, 1, json!("b1")).unwrap();
    b.list_insert(b_list, 1, json!("b2")).unwrap();

    let a_ops = a.take_outbound();
    b.apply_remote_ops(&a_ops);
    let b_ops = b.take_outbound();
    a.apply_remote_ops(&b_ops);

    // Both items survive; their relative order follows their generated
    // positions and is identical on both replicas.
    assert_eq!(a.serialize(), b.serialize());
    let items = a.list_json(a_list);
    assert_eq!(items.len(), 4);
    assert_eq!(items[0], json!("a"));
    assert_eq!(items[3], json!("c"));
    assert!(items[1..3].contains(&json!("b1")));
    assert!(items[1..3].contains(&json!("b2")));

    let positions = a.list_positions(a_list);
    let mut sorted = positions.clone();
    sorted.sort();
    assert_eq!(positions, sorted);
}

#[test]
fn test_out_of_order_child_op_drops_then_parent_insert_rematerializes() {
    let mut doc = StorageDoc::new();

    // A write into a nested object whose parent insert has not arrived
    // yet is dropped silently.
    let early = Op::Set {
        path: vec!["list".into(), "V1".into()],
        key: "w".into(),
        value: json!(9).into(),
        clock: 4,
    };
    assert_eq!(doc.apply_remote_ops(&[early]), vec![false]);

    // The parent's later insert carries the full nested envelope, so the
    // subtree appears with its final state.
    let mut nested = std::collections::BTreeMap::new();
    nested.insert("w".to_string(), SerializedCrdt::Scalar(json!(9)));
    let ops = vec![
        Op::Set {
            path: vec![],
            key: "list".into(),
            value: SerializedCrdt::list(),
            clock: 5,
        },
        Op::ListInsert {
            path: vec!["list".into()],
            position: Position::new("V1"),
            value: SerializedCrdt::Node(room_storage::SerializedNode::LiveObject { data: nested }),
            clock: 6,
        },
    ];
    assert_eq!(doc.apply_remote_ops(&ops), vec![true, true]);

    let list = doc.child(doc.root(), "list").unwrap();
    let item = doc.list_get(list, 0).unwrap().as_node().unwrap();
    assert_eq!(doc.get_json(item, "w"), Some(json!(9)));
}

#[test]
fn test_fractional_denseness_over_random_pairs() {
    // 10,000 pseudo-random neighbor pairs drawn from an evolving pool.
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut rng = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    let mut pool = vec![
        Position::between(None, None).unwrap(),
        Position::between(Some(&Position::between(None, None).unwrap()), None).unwrap(),
    ];
    pool.sort();

    for _ in 0..10_000 {
        let i = (rng() as usize) % (pool.len() - 1);
        let (lo, hi) = (pool[i].clone(), pool[i + 1].clone());
        let mid = Position::between(Some(&lo), Some(&hi)).unwrap();
        assert!(lo < mid && mid < hi, "{lo} !< {mid} !< {hi}");
        pool.insert(i + 1, mid);
        // Keep the pool bounded so keys deepen rather than widen.
        if pool.len() > 64 {
            let drop = (rng() as usize) % pool.len();
            pool.remove(drop);
        }
    }
}

#[test]
fn test_undo_after_remote_interleaving_is_deterministic() {
    let run = || {
        let mut a = StorageDoc::new().with_actor(1);
        let mut b = StorageDoc::new().with_actor(2);

        a.set(a.root(), "v", json!("a1")).unwrap();
        broadcast(&mut a, &mut [&mut b]);

        b.set(b.root(), "v", json!("b1")).unwrap();
        broadcast(&mut b, &mut [&mut a]);
        assert_eq!(a.get_json(a.root(), "v"), Some(json!("b1")));

        // A's undo restores A's pre-set state at a fresh clock and
        // replicates like any local edit.
        assert!(a.undo());
        broadcast(&mut a, &mut [&mut b]);

        assert_eq!(a.serialize(), b.serialize());
        a.get_json(a.root(), "v")
    };

    let first = run();
    let second = run();
    assert_eq!(first, second);
}

#[test]
fn test_snapshot_then_replay_recovers_offline_edits() {
    let mut server = StorageDoc::new();
    server.set(server.root(), "x", json!(100)).unwrap();
    server.take_outbound();

    let mut client = fork(&server, 1);

    // Offline edit: buffered, not delivered.
    client.set(client.root(), "x", json!(200)).unwrap();
    let buffered = client.take_outbound();

    // Meanwhile another participant updates the server.
    server.set(server.root(), "y", json!(50)).unwrap();
    server.take_outbound();

    // Reconnect: fresh snapshot in place, then re-clocked replay.
    client
        .apply_snapshot(&server.serialize(), server.clock())
        .unwrap();
    client.replay_local(&buffered);
    let replayed = client.take_outbound();
    server.apply_remote_ops(&replayed);

    assert_eq!(client.get_json(client.root(), "x"), Some(json!(200)));
    assert_eq!(client.get_json(client.root(), "y"), Some(json!(50)));
    assert_eq!(client.serialize(), server.serialize());
}

#[test]
fn test_remote_batch_notifies_once_with_all_fields_applied() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let mut a = StorageDoc::new();
    let mut b = StorageDoc::new();

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = Arc::clone(&fired);
        b.subscribe(b.root(), move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }

    a.batch(|doc| {
        let root = doc.root();
        doc.set(root, "a", json!(10)).unwrap();
        doc.set(root, "b", json!(20)).unwrap();
    });

    // The relay delivers the batch as one `op` frame.
    let ops = a.take_outbound();
    assert_eq!(ops.len(), 2);
    b.apply_remote_ops(&ops);

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(b.get_json(b.root(), "a"), Some(json!(10)));
    assert_eq!(b.get_json(b.root(), "b"), Some(json!(20)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Random op streams from three clients, routed through a relay
    /// replica exactly like the room server: the relay applies in
    /// arrival order and forwards accepted ops to everyone else, each
    /// client drains its inbox at arbitrary points. After quiescence all
    /// four trees are equal.
    ///
    /// Clients write registers in per-client namespaces (matching how
    /// applications partition by object id) and insert freely into one
    /// shared list, where the actor digit keeps concurrent positions
    /// distinct.
    #[test]
    fn prop_random_streams_converge_through_relay(
        script in proptest::collection::vec(
            (0usize..3, 0u8..5, 0u8..4, 0u8..8),
            1..80,
        )
    ) {
        let mut seed = StorageDoc::new();
        let root = seed.root();
        seed.set(root, "list", SerializedCrdt::list()).unwrap();
        seed.take_outbound();

        let mut relay = fork(&seed, 0);
        let mut clients: Vec<StorageDoc> =
            (1..=3u8).map(|actor| fork(&seed, actor)).collect();
        let mut inboxes: Vec<Vec<Op>> = vec![Vec::new(); 3];

        for (ci, action, key, arg) in script {
            match action {
                0 => {
                    let root = clients[ci].root();
                    clients[ci]
                        .set(root, &format!("k{ci}_{key}"), json!(arg))
                        .unwrap();
                }
                1 => {
                    let root = clients[ci].root();
                    clients[ci].delete(root, &format!("k{ci}_{key}")).unwrap();
                }
                2 => {
                    let list = clients[ci].child(clients[ci].root(), "list").unwrap();
                    clients[ci]
                        .list_push(list, json!(format!("v{ci}-{key}")))
                        .unwrap();
                }
                3 => {
                    let list = clients[ci].child(clients[ci].root(), "list").unwrap();
                    let len = clients[ci].list_len(list);
                    clients[ci]
                        .list_insert(list, arg as usize % (len + 1), json!(arg))
                        .unwrap();
                }
                _ => {
                    let ops = std::mem::take(&mut inboxes[ci]);
                    clients[ci].apply_remote_ops(&ops);
                    continue;
                }
            }

            // Route the fresh ops through the relay, in arrival order.
            let ops = clients[ci].take_outbound();
            let applied = relay.apply_remote_ops(&ops);
            let accepted: Vec<Op> = ops
                .into_iter()
                .zip(applied)
                .filter_map(|(op, ok)| ok.then_some(op))
                .collect();
            for (other, inbox) in inboxes.iter_mut().enumerate() {
                if other != ci {
                    inbox.extend(accepted.iter().cloned());
                }
            }
        }

        // Quiescence: everyone drains everything.
        for (ci, inbox) in inboxes.iter_mut().enumerate() {
            let ops = std::mem::take(inbox);
            clients[ci].apply_remote_ops(&ops);
        }

        let expected = relay.serialize();
        for (ci, client) in clients.iter().enumerate() {
            prop_assert_eq!(client.serialize(), expected.clone(), "client {} diverged", ci);
        }
    }
}

#[test]
fn test_list_move_converges_across_replicas() {
    let mut seed = StorageDoc::new();
    let root = seed.root();
    seed.set(root, "list", SerializedCrdt::list()).unwrap();
    let list = seed.child(root, "list").unwrap();
    for v in ["a", "b", "c", "d"] {
        seed.list_push(list, json!(v)).unwrap();
    }
    seed.take_outbound();

    let mut a = fork(&seed, 1);
    let mut b = fork(&seed, 2);

    let a_list = a.child(a.root(), "list").unwrap();
    a.list_move(a_list, 0, 3).unwrap();
    broadcast(&mut a, &mut [&mut b]);

    let b_list = b.child(b.root(), "list").unwrap();
    b.list_move(b_list, 1, 0).unwrap();
    broadcast(&mut b, &mut [&mut a]);

    assert_eq!(a.serialize(), b.serialize());
    assert_eq!(a.list_json(a_list), b.list_json(b_list));
}
