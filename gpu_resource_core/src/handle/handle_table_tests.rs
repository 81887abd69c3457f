use super::*;
use crate::log::null_logger;
use std::collections::HashSet;
use std::thread;

/// Table whose destructor records every destroyed value
fn recording_table() -> (HandleTable<u32>, Arc<Mutex<Vec<u32>>>) {
    let destroyed = Arc::new(Mutex::new(Vec::new()));
    let sink = destroyed.clone();
    let table = HandleTable::with_destructor(null_logger(), move |value: u32| {
        sink.lock().push(value);
    });
    (table, destroyed)
}

// ============================================================================
// Lifecycle tests
// ============================================================================

#[test]
fn test_create_then_get() {
    let table = HandleTable::new(null_logger());
    let handle = table.create(String::from("vertex buffer"));
    assert!(table.is_valid(handle));
    assert_eq!(table.get(handle).as_deref(), Some("vertex buffer"));
    assert_eq!(table.ref_count(handle), Some(1));
}

#[test]
fn test_single_release_destroys() {
    let (table, destroyed) = recording_table();
    let handle = table.create(7);

    assert!(table.release(handle));
    assert!(!table.is_valid(handle));
    assert_eq!(table.get(handle), None);
    assert_eq!(*destroyed.lock(), vec![7]);
}

#[test]
fn test_add_ref_requires_matching_releases() {
    let (table, destroyed) = recording_table();
    let handle = table.create(1);

    assert!(table.add_ref(handle));
    assert_eq!(table.ref_count(handle), Some(2));

    assert!(table.release(handle));
    assert!(table.is_valid(handle));
    assert!(destroyed.lock().is_empty());

    assert!(table.release(handle));
    assert!(!table.is_valid(handle));
    assert_eq!(*destroyed.lock(), vec![1]);
}

#[test]
fn test_invalidate_hides_resource_until_last_release() {
    let (table, destroyed) = recording_table();
    let handle = table.create(3);
    table.add_ref(handle);

    assert!(table.invalidate(handle));
    assert!(!table.is_valid(handle));
    assert_eq!(table.get(handle), None);
    assert_eq!(table.pending_destroy_count(), 1);
    assert!(destroyed.lock().is_empty());

    // Invalidated entries refuse new references
    assert!(!table.add_ref(handle));

    table.release(handle);
    assert!(destroyed.lock().is_empty());
    table.release(handle);
    assert_eq!(*destroyed.lock(), vec![3]);
    assert_eq!(table.pending_destroy_count(), 0);
}

#[test]
fn test_invalidate_twice_fails() {
    let table = HandleTable::new(null_logger());
    let handle = table.create(0u8);
    table.add_ref(handle);
    assert!(table.invalidate(handle));
    assert!(!table.invalidate(handle));
}

#[test]
fn test_release_on_stale_handle_is_rejected() {
    let (table, destroyed) = recording_table();
    let handle = table.create(5);
    table.release(handle);

    assert!(!table.release(handle));
    assert!(!table.add_ref(handle));
    assert!(!table.invalidate(handle));
    assert_eq!(table.ref_count(handle), None);
    assert_eq!(destroyed.lock().len(), 1);
}

#[test]
fn test_with_borrows_resource() {
    let table = HandleTable::new(null_logger());
    let handle = table.create(vec![1u32, 2, 3]);
    assert_eq!(table.with(handle, |v| v.iter().sum::<u32>()), Some(6));
    table.invalidate(handle);
    assert_eq!(table.with(handle, |v| v.len()), None);
}

// ============================================================================
// Id recycling tests
// ============================================================================

#[test]
fn test_freed_ids_are_reused_in_fifo_order() {
    let table = HandleTable::new(null_logger());
    let a = table.create(0);
    let b = table.create(1);
    let c = table.create(2);

    table.release(b);
    table.release(a);

    let d = table.create(3);
    let e = table.create(4);
    assert_eq!(d.index(), b.index());
    assert_eq!(e.index(), a.index());

    let f = table.create(5);
    assert_eq!(f.index(), 3);
    assert!(table.is_valid(c));
}

#[test]
fn test_recycled_id_gets_new_generation() {
    let table = HandleTable::new(null_logger());
    let old = table.create(10);
    table.release(old);

    let new = table.create(20);
    assert_eq!(new.index(), old.index());
    assert_ne!(new.generation(), old.generation());
    assert_ne!(new, old);

    assert_eq!(table.get(old), None);
    assert_eq!(table.get(new), Some(20));
    assert!(!table.release(old));
    assert!(table.is_valid(new));
}

#[test]
fn test_high_water_mark_bounds_ids() {
    let table = HandleTable::new(null_logger());
    for round in 0..10 {
        let handles: Vec<_> = (0..4).map(|i| table.create(round * 4 + i)).collect();
        for h in &handles {
            assert!(h.index() < table.high_water_mark());
        }
        for h in handles {
            table.release(h);
        }
    }
    assert_eq!(table.high_water_mark(), 4);
}

// ============================================================================
// Query tests
// ============================================================================

#[test]
fn test_active_handles_and_counts() {
    let table = HandleTable::new(null_logger());
    let a = table.create('a');
    let b = table.create('b');
    let c = table.create('c');
    table.add_ref(b);
    table.invalidate(b);
    table.release(c);

    assert_eq!(table.active_handles(), vec![a]);
    assert_eq!(table.active_count(), 1);
    assert_eq!(table.pending_destroy_count(), 1);
}

#[test]
fn test_handle_debug_format() {
    let table = HandleTable::new(null_logger());
    let first = table.create(());
    assert_eq!(format!("{:?}", first), "Handle(0v0)");
    table.release(first);
    let second = table.create(());
    assert_eq!(format!("{:?}", second), "Handle(0v1)");
}

#[test]
fn test_handles_usable_as_hash_keys() {
    let table = HandleTable::new(null_logger());
    let set: HashSet<Handle<u32>> = (0..5).map(|i| table.create(i)).collect();
    assert_eq!(set.len(), 5);
}

// ============================================================================
// Teardown tests
// ============================================================================

#[test]
fn test_destroy_all_ignores_ref_counts() {
    let (table, destroyed) = recording_table();
    let a = table.create(1);
    let b = table.create(2);
    table.add_ref(a);
    table.add_ref(a);
    table.add_ref(b);
    table.invalidate(b);

    assert_eq!(table.destroy_all(), 2);
    assert!(!table.is_valid(a));
    assert_eq!(table.pending_destroy_count(), 0);

    let mut values = destroyed.lock().clone();
    values.sort_unstable();
    assert_eq!(values, vec![1, 2]);
}

#[test]
fn test_drop_destroys_live_entries() {
    let (table, destroyed) = recording_table();
    table.create(42);
    table.create(43);
    drop(table);
    assert_eq!(destroyed.lock().len(), 2);
}

#[test]
fn test_destructor_may_use_table_owner_state() {
    // The destructor runs without the table lock, so it may touch other locks freely
    let counter = Arc::new(Mutex::new(0usize));
    let inner = counter.clone();
    let table = HandleTable::with_destructor(null_logger(), move |_: u32| {
        *inner.lock() += 1;
    });
    let h = table.create(0);
    table.release(h);
    assert_eq!(*counter.lock(), 1);
}

// ============================================================================
// Concurrency tests
// ============================================================================

#[test]
fn test_concurrent_create_release() {
    let (table, destroyed) = recording_table();
    let table = Arc::new(table);

    let workers: Vec<_> = (0..8)
        .map(|t| {
            let table = table.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    let h = table.create(t * 1000 + i);
                    assert!(table.add_ref(h));
                    assert!(table.release(h));
                    assert!(table.is_valid(h));
                    assert!(table.release(h));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(table.active_count(), 0);
    assert_eq!(destroyed.lock().len(), 8 * 200);
    assert!(table.high_water_mark() <= 8);
}
