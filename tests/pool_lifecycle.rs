//! Pool, registry, and allocator lifecycle scenarios: shutdown wakeups,
//! teardown ordering, and the contract violations the scheduler must reject.

use std::sync::Arc;
use std::time::{Duration, Instant};

use frameline::alloc::{AllocatorKind, BufferAllocator, NormalAllocator, create_allocator};
use frameline::buffer::{BufferState, QueueKind, registry};
use frameline::error::{AcquireError, AllocError, PoolError};
use serial_test::serial;

/// Pool shutdown during a producer wait: the blocked acquire returns within
/// its polling interval instead of hanging.
#[test]
#[serial]
fn shutdown_unblocks_a_starved_producer() {
    let alloc = NormalAllocator::new();
    let pool_id = alloc
        .allocate_pool_with_buffers(2, 4096, "s2-shutdown", "Test")
        .unwrap();
    let pool = registry().get_pool(pool_id).upgrade().unwrap();

    // Drain the free queue so the next producer blocks.
    let a = pool.acquire_free(false, None).unwrap();
    let b = pool.acquire_free(false, None).unwrap();

    let blocked = {
        let pool = Arc::clone(&pool);
        std::thread::spawn(move || {
            let begin = Instant::now();
            let result = pool.acquire_free(true, Some(Duration::from_secs(30)));
            (result, begin.elapsed())
        })
    };
    std::thread::sleep(Duration::from_millis(30));
    pool.shutdown();

    let (result, waited) = blocked.join().unwrap();
    assert!(matches!(result, Err(AcquireError::ShutDown)));
    assert!(waited < Duration::from_millis(100), "waited {waited:?}");

    // Return the checkouts so teardown finds the pool quiescent.
    pool.release_free(&a).unwrap();
    pool.release_free(&b).unwrap();
    drop(pool);
}

/// Allocator drop cleans up its pools: the observer dies and the registry
/// shrinks by exactly the pools the allocator created.
#[test]
#[serial]
fn allocator_drop_unregisters_its_pools() {
    let before = registry().pool_count();
    let alloc = NormalAllocator::new();
    let pool_id = alloc
        .allocate_pool_with_buffers(8, 4096, "s3-cleanup", "Test")
        .unwrap();
    assert_eq!(registry().pool_count(), before + 1);
    let weak = registry().get_pool(pool_id);
    assert!(weak.upgrade().is_some());

    drop(alloc);

    assert!(weak.upgrade().is_none(), "registry strong ref was the last");
    assert_eq!(registry().pool_count(), before);
}

/// Double submit is rejected and leaves exactly one copy in the filled
/// queue.
#[test]
#[serial]
fn double_submit_is_rejected_through_the_public_api() {
    let alloc = NormalAllocator::new();
    let pool_id = alloc
        .allocate_pool_with_buffers(2, 1024, "s4-double", "Test")
        .unwrap();
    let pool = registry().get_pool(pool_id).upgrade().unwrap();

    let buffer = pool.acquire_free(false, None).unwrap();
    pool.submit_filled(&buffer).unwrap();
    assert!(matches!(
        pool.submit_filled(&buffer),
        Err(PoolError::InvalidState { .. })
    ));
    assert_eq!(pool.filled_count(), 1);

    let same = pool.acquire_filled(false, None).unwrap();
    assert!(Arc::ptr_eq(&same, &buffer));
    pool.release_filled(&same).unwrap();
    drop(pool);
}

/// destroy_pool is idempotent, and a pool with a checked-out buffer is
/// reported as not fully drained.
#[test]
#[serial]
fn destroy_pool_idempotence_and_leak_reporting() {
    let alloc = NormalAllocator::new();
    alloc
        .allocate_pool_with_buffers(3, 512, "destroy-clean", "Test")
        .unwrap();
    assert!(alloc.destroy_pool(), "quiescent pool drains fully");
    assert!(alloc.destroy_pool(), "second destroy finds nothing to do");

    let leaky = NormalAllocator::new();
    let pool_id = leaky
        .allocate_pool_with_buffers(2, 512, "destroy-leaky", "Test")
        .unwrap();
    let pool = registry().get_pool(pool_id).upgrade().unwrap();
    let held = pool.acquire_free(false, None).unwrap();
    drop(pool);

    // One buffer is checked out; the quiescence wait expires and the pool is
    // reported as leaked, but the registry entry still goes away.
    assert!(!leaky.destroy_pool());
    assert!(registry().get_pool(pool_id).upgrade().is_none());
    // Our reference keeps the leaked buffer's memory alive until here.
    assert_eq!(held.state(), BufferState::LockedByProducer);
}

/// Dynamic grow and shrink through the allocator, including the idle-only
/// removal rule.
#[test]
#[serial]
fn inject_and_remove_respect_the_state_machine() {
    let alloc = NormalAllocator::new();
    let pool_id = alloc
        .allocate_pool_with_buffers(1, 256, "grow-shrink", "Test")
        .unwrap();
    let pool = registry().get_pool(pool_id).upgrade().unwrap();

    let grown = alloc
        .inject_buffer_to_pool(pool_id, 256, QueueKind::Free)
        .unwrap();
    assert_eq!(pool.total_count(), 2);
    assert_eq!(pool.free_count(), 2);

    // A filled buffer cannot be removed.
    let filled = pool.acquire_free(false, None).unwrap();
    pool.submit_filled(&filled).unwrap();
    let result = alloc.remove_buffer_from_pool(pool_id, &filled);
    assert!(matches!(
        result,
        Err(AllocError::Pool(PoolError::NotIdle { .. }))
    ));

    // An idle one can.
    alloc.remove_buffer_from_pool(pool_id, &grown).unwrap();
    assert_eq!(pool.total_count(), 1);

    let consumed = pool.acquire_filled(false, None).unwrap();
    pool.release_filled(&consumed).unwrap();
    drop(pool);
}

/// Zero-sized external memory is never admitted.
#[test]
#[serial]
fn zero_sized_external_injection_fails() {
    let alloc = NormalAllocator::new();
    let pool_id = alloc
        .allocate_pool_with_buffers(1, 256, "zero-ext", "Test")
        .unwrap();
    let mut backing = [0u8; 16];
    assert!(matches!(
        alloc.inject_external_buffer_to_pool(pool_id, backing.as_mut_ptr(), 0, 0, QueueKind::Free),
        Err(AllocError::ZeroSize)
    ));
}

/// External memory wraps cleanly and reports its physical address.
#[test]
#[serial]
fn external_injection_carries_addresses() {
    let alloc = NormalAllocator::new();
    let pool_id = alloc
        .allocate_pool_with_buffers(1, 256, "ext-addr", "Test")
        .unwrap();
    let mut backing = vec![0u8; 256];
    let buffer = alloc
        .inject_external_buffer_to_pool(
            pool_id,
            backing.as_mut_ptr(),
            0x8800_0000,
            backing.len(),
            QueueKind::Filled,
        )
        .unwrap();
    assert_eq!(buffer.physical_address(), 0x8800_0000);
    assert_eq!(buffer.ownership(), frameline::buffer::Ownership::External);

    let pool = registry().get_pool(pool_id).upgrade().unwrap();
    assert_eq!(pool.filled_count(), 1);
    let consumed = pool.acquire_filled(false, None).unwrap();
    assert!(Arc::ptr_eq(&consumed, &buffer));
    pool.release_filled(&consumed).unwrap();
    drop(pool);
    // `backing` outlives the allocator; external memory is never freed by it.
}

/// Observer discipline under the consumer-facing API of the spec: upgrade,
/// use, release, and a clean failure after teardown.
#[test]
#[serial]
fn consumer_observer_upgrade_fails_cleanly_after_teardown() {
    let alloc = create_allocator(AllocatorKind::Normal);
    let pool_id = alloc
        .allocate_pool_with_buffers(2, 128, "observer", "Test")
        .unwrap();

    let weak = registry().get_pool(pool_id);
    {
        let pool = weak.upgrade().expect("pool alive");
        assert!(matches!(
            pool.acquire_filled(false, None),
            Err(AcquireError::WouldBlock)
        ));
    }

    drop(alloc);
    assert!(weak.upgrade().is_none(), "upgrade fails cleanly, never torn");
}

/// The round-trip law at allocator scope: a full produce/consume cycle puts
/// the pool back exactly where it started.
#[test]
#[serial]
fn full_cycle_restores_pool_state() {
    let alloc = NormalAllocator::new();
    let pool_id = alloc
        .allocate_pool_with_buffers(3, 512, "round-trip", "Test")
        .unwrap();
    let pool = registry().get_pool(pool_id).upgrade().unwrap();

    let snapshot = (pool.free_count(), pool.filled_count(), pool.total_count());
    let buffer = pool.acquire_free(false, None).unwrap();
    buffer.fill_from(&[7u8; 512]).unwrap();
    pool.submit_filled(&buffer).unwrap();
    let consumed = pool.acquire_filled(false, None).unwrap();
    assert!(Arc::ptr_eq(&consumed, &buffer));
    pool.release_filled(&consumed).unwrap();

    assert_eq!(
        snapshot,
        (pool.free_count(), pool.filled_count(), pool.total_count())
    );
    drop(pool);
}
