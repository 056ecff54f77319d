mod util;

use tempfile::tempdir;
use tempoq::{Options, Queue};
use util::{bucket_size_opts, gen_items, keys_of, push_owned};

#[test]
fn fast_path_moves_whole_buckets() {
    let dir = tempdir().unwrap();
    let src = Queue::open(dir.path().join("src"), Options::default()).unwrap();
    let dst = Queue::open(dir.path().join("dst"), Options::default()).unwrap();

    let expected = gen_items(0, 1000, 1);
    push_owned(&src, &expected);
    assert_eq!(src.len(), 1000);
    assert_eq!(dst.len(), 0);

    assert_eq!(src.shovel(&dst).unwrap(), 1000);

    assert_eq!(src.len(), 0);
    assert_eq!(dst.len(), 1000);
    assert_eq!(dst.pop_copy(1000).unwrap(), expected);
}

#[test]
fn slow_path_appends_into_existing_buckets() {
    for reopen in [false, true] {
        let dir = tempdir().unwrap();
        let src = Queue::open(dir.path().join("src"), Options::default()).unwrap();
        let dst = Queue::open(dir.path().join("dst"), Options::default()).unwrap();

        let src_items = gen_items(0, 500, 1);
        let dst_items = gen_items(1000, 2500, 1);
        push_owned(&src, &src_items);
        push_owned(&dst, &dst_items);

        assert_eq!(src.shovel(&dst).unwrap(), 500);
        assert_eq!(src.len(), 0);
        assert_eq!(dst.len(), 2000);

        let (src, dst) = if reopen {
            src.close().unwrap();
            dst.close().unwrap();
            drop(src);
            drop(dst);
            (
                Queue::open(dir.path().join("src"), Options::default()).unwrap(),
                Queue::open(dir.path().join("dst"), Options::default()).unwrap(),
            )
        } else {
            (src, dst)
        };

        assert_eq!(src.len(), 0);
        let mut expected = src_items.clone();
        expected.extend(dst_items.clone());
        assert_eq!(dst.pop_copy(2000).unwrap(), expected);
    }
}

#[test]
fn shovel_mixes_fast_and_slow_buckets() {
    let dir = tempdir().unwrap();
    let opts = bucket_size_opts(10);
    let src = Queue::open(dir.path().join("src"), opts.clone()).unwrap();
    let dst = Queue::open(dir.path().join("dst"), opts).unwrap();

    // src covers buckets 0..100; dst already has buckets 0..50, so half
    // the buckets rename over and half go through read-and-push.
    push_owned(&src, &gen_items(0, 100, 1));
    push_owned(&dst, &gen_items(0, 50, 1));

    assert_eq!(src.shovel(&dst).unwrap(), 100);
    assert_eq!(src.len(), 0);
    assert_eq!(dst.len(), 150);

    let got = keys_of(&dst.pop_copy(-1).unwrap());
    let mut expected: Vec<i64> = (0..50).flat_map(|k| [k, k]).collect();
    expected.extend(50..100);
    assert_eq!(got, expected);
}

#[test]
fn shovelling_an_empty_queue_is_a_noop() {
    let dir = tempdir().unwrap();
    let src = Queue::open(dir.path().join("src"), Options::default()).unwrap();
    let dst = Queue::open(dir.path().join("dst"), Options::default()).unwrap();

    assert_eq!(src.shovel(&dst).unwrap(), 0);
    assert_eq!(dst.len(), 0);
}

#[test]
fn shovelling_into_itself_is_rejected() {
    let dir = tempdir().unwrap();
    let queue = Queue::open(dir.path(), Options::default()).unwrap();
    push_owned(&queue, &gen_items(0, 10, 1));
    assert!(queue.shovel(&queue).is_err());
    assert_eq!(queue.len(), 10);
}

#[test]
fn fork_shovel_moves_the_forks_view() {
    let dir = tempdir().unwrap();
    let src = Queue::open(dir.path().join("src"), Options::default()).unwrap();
    let dst = Queue::open(dir.path().join("dst"), Options::default()).unwrap();

    push_owned(&src, &gen_items(0, 100, 1));
    let fork = src.fork("mover").unwrap();

    // drain the default cursor; the fork still sees all hundred.
    src.pop_copy(-1).unwrap();
    assert_eq!(src.len(), 0);
    assert_eq!(fork.len(), 100);

    assert_eq!(fork.shovel(&dst).unwrap(), 100);
    assert_eq!(fork.len(), 0);
    assert_eq!(dst.len(), 100);
    assert_eq!(keys_of(&dst.pop_copy(-1).unwrap()), (0..100).collect::<Vec<_>>());
}

#[test]
fn shovel_keeps_working_under_a_tight_bucket_cap() {
    let dir = tempdir().unwrap();
    let opts = Options {
        max_parallel_open_buckets: 1,
        ..bucket_size_opts(10)
    };
    let src = Queue::open(dir.path().join("src"), opts.clone()).unwrap();
    let dst = Queue::open(dir.path().join("dst"), opts).unwrap();

    for idx in 0..10i64 {
        push_owned(&src, &gen_items(idx * 10, idx * 10 + 10, 1));
        // seed every dst bucket so the slow path is taken throughout.
        push_owned(&dst, &gen_items(idx * 10, idx * 10 + 1, 1));
    }

    assert_eq!(src.shovel(&dst).unwrap(), 100);
    assert_eq!(src.len(), 0);
    assert_eq!(dst.len(), 110);

    // pushing afterwards must still work on both sides.
    push_owned(&src, &gen_items(0, 10, 1));
    push_owned(&dst, &gen_items(200, 210, 1));
    assert_eq!(src.len(), 10);
    assert_eq!(dst.len(), 120);
}
