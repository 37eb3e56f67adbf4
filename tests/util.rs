// tests/util.rs

use portico::util::{escape, split, unescape, Buffer, LruCache, SpinLock};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;

// ------------------------------- spin lock -----------------------------------

#[test]
fn spin_lock_counts_across_threads() {
    let counter = Arc::new(SpinLock::new(0u64));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let counter = Arc::clone(&counter);
        handles.push(thread::spawn(move || {
            for _ in 0..10_000 {
                *counter.lock() += 1;
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*counter.lock(), 80_000);
}

#[test]
fn spin_lock_try_lock() {
    let lock = SpinLock::new(1);
    let guard = lock.lock();
    assert!(lock.try_lock().is_none());
    drop(guard);
    assert!(lock.try_lock().is_some());
}

// ------------------------------- buffer --------------------------------------

#[test]
fn buffer_fill_and_consume() {
    let mut buf = Buffer::with_size(16);
    buf.reset();
    buf.current_mut()[..10].copy_from_slice(b"0123456789");
    buf.set_current_size(10);

    buf.advance(4);
    assert_eq!(buf.current(), b"456789");
    buf.commit();
    assert_eq!(buf.current(), b"456789");
    buf.advance(6);
    assert!(buf.is_empty());
}

#[test]
fn buffer_append_grows() {
    let mut buf = Buffer::new();
    buf.append(b"hello ");
    buf.append(b"world");
    assert_eq!(buf.current(), b"hello world");
    buf.advance(6);
    buf.append(b"!");
    assert_eq!(buf.current(), b"world!");
}

proptest! {
    /// The logical suffix `current..end` survives any advance/commit mix.
    #[test]
    fn buffer_compaction_preserves_suffix(
        data in proptest::collection::vec(any::<u8>(), 1..512),
        ops in proptest::collection::vec((0usize..64, any::<bool>()), 0..32),
    ) {
        let mut buf = Buffer::new();
        buf.assign(&data);
        let mut expected: &[u8] = &data;
        for (step, commit) in ops {
            let step = step.min(expected.len());
            buf.advance(step);
            expected = &expected[step..];
            if commit {
                buf.commit();
            }
            prop_assert_eq!(buf.current(), expected);
        }
    }
}

// ------------------------------- lru cache -----------------------------------

#[test]
fn lru_evicts_least_recently_used() {
    let mut cache = LruCache::new(3);
    cache.put("a", 1);
    cache.put("b", 2);
    cache.put("c", 3);
    // touch "a" so "b" is now the oldest
    assert_eq!(cache.value(&"a"), Some(1));
    cache.put("d", 4);

    assert_eq!(cache.len(), 3);
    assert!(!cache.exists(&"b"));
    assert!(cache.exists(&"a"));
    assert!(cache.exists(&"c"));
    assert!(cache.exists(&"d"));
}

#[test]
fn lru_reference_mutates_and_touches() {
    let mut cache = LruCache::new(2);
    cache.put("x", 10);
    cache.put("y", 20);
    *cache.reference(&"x").unwrap() += 1;
    cache.put("z", 30);

    assert_eq!(cache.value(&"x"), Some(11));
    assert!(!cache.exists(&"y"));
}

#[test]
fn lru_shrinking_drops_oldest() {
    let mut cache = LruCache::new(4);
    for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
        cache.put(*key, i);
    }
    cache.set_cache_size(2);
    assert_eq!(cache.len(), 2);
    assert!(cache.exists(&"d"));
    assert!(cache.exists(&"c"));
}

proptest! {
    /// The cache behaves exactly like a recency-ordered list capped at
    /// its capacity.
    #[test]
    fn lru_order_property(ops in proptest::collection::vec((0u8..16, any::<bool>()), 1..64)) {
        let capacity = 4;
        let mut cache = LruCache::new(capacity);
        let mut model: Vec<u8> = Vec::new();
        for (key, put) in ops {
            if put {
                cache.put(key, ());
                model.retain(|k| *k != key);
                model.insert(0, key);
                model.truncate(capacity);
            } else {
                let hit = cache.value(&key).is_some();
                prop_assert_eq!(hit, model.contains(&key));
                if hit {
                    model.retain(|k| *k != key);
                    model.insert(0, key);
                }
            }
            prop_assert_eq!(cache.len(), model.len());
            for key in &model {
                prop_assert!(cache.exists(key), "expected key {} to survive", key);
            }
        }
    }
}

// ------------------------------- url escaping --------------------------------

#[test]
fn unescape_basics() {
    assert_eq!(unescape("a%20b").unwrap(), "a b");
    assert_eq!(unescape("a+b").unwrap(), "a b");
    assert_eq!(unescape("%2Fpath%2F").unwrap(), "/path/");
    assert_eq!(unescape("plain").unwrap(), "plain");
}

#[test]
fn unescape_rejects_malformed_escapes() {
    assert!(unescape("%").is_err());
    assert!(unescape("%2").is_err());
    assert!(unescape("%zz").is_err());
    assert!(unescape("ok%2").is_err());
}

#[test]
fn escape_round_trip_examples() {
    for s in ["hello world", "a+b=c&d", "100%", "ünïcode", ""] {
        assert_eq!(unescape(&escape(s)).unwrap(), s, "{s:?}");
    }
}

proptest! {
    #[test]
    fn escape_round_trip(s in "[ -~]{0,64}") {
        prop_assert_eq!(unescape(&escape(&s)).unwrap(), s);
    }
}

// ------------------------------- split ---------------------------------------

#[test]
fn split_drops_empty_components() {
    assert_eq!(split("/a//b/", '/'), vec!["a", "b"]);
    assert_eq!(split("a=b", '='), vec!["a", "b"]);
    assert_eq!(split("a==b", '='), vec!["a", "b"]);
    assert!(split("", '/').is_empty());
}
