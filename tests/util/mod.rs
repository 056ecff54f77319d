#![allow(dead_code)]

use tempoq::{Item, Key, Options, OwnedItem, Queue, SplitConf};

/// Items with ascending keys and the decimal key as blob, `lo` inclusive,
/// `hi` exclusive.
pub fn gen_items(lo: i64, hi: i64, step: i64) -> Vec<OwnedItem> {
    let mut items = Vec::new();
    let mut key = lo;
    while (step > 0 && key < hi) || (step < 0 && key > hi) {
        items.push(OwnedItem::new(Key(key), key.to_string().into_bytes()));
        key += step;
    }
    items
}

pub fn push_owned(queue: &Queue, items: &[OwnedItem]) {
    let borrowed: Vec<Item> = items.iter().map(|item| item.as_item()).collect();
    queue.push(&borrowed).unwrap();
}

/// Options with `n`-sized buckets, handy for forcing multi-bucket layouts.
pub fn bucket_size_opts(n: u64) -> Options {
    Options {
        split: SplitConf::fixed_size(n),
        ..Options::default()
    }
}

pub fn keys_of(items: &[OwnedItem]) -> Vec<i64> {
    items.iter().map(|item| item.key.0).collect()
}
