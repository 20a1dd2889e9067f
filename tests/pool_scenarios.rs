// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// End-to-end walkthrough of the allocator through the public façade only.
// `lifecycle::init` is a process-wide singleton, so every scenario below
// runs against the same pool, in one test function, in the order the
// scenarios build on each other's state.

use dma_pool::{lifecycle, NullDevice, PoolAllocator, SimpleOwner, StandaloneHost};

const SEGMENT_SIZE: u64 = 1 << 28; // 256 MiB, matches MIN_CLASS=8/MAX_CLASS=34 in the header arithmetic

#[test]
fn end_to_end_scenarios() {
    let host = StandaloneHost::new("scenario-pg", 5432)
        .with_config("dma_segment_size", SEGMENT_SIZE as usize)
        .with_config("max_dma_segment_nums", 4)
        .with_config("min_dma_segment_nums", 1);
    let ctx = lifecycle::init(Box::new(host), Box::new(NullDevice)).expect("pool init");
    let pool = PoolAllocator::new(ctx);
    let owner_a = SimpleOwner::new(1);

    // Scenario 1: alloc(A, 100) lands in class 8 (256 B chunk); size/chunk_size
    // report exactly what the spec says; freeing it merges the whole segment
    // back into one maximal-class free chunk (segment 0 is persistent, so it
    // stays mapped rather than being torn down).
    let p1 = pool.alloc(&owner_a, 100).expect("alloc 100 bytes");
    assert_eq!(pool.size(p1).unwrap(), 100);
    assert_eq!(pool.chunk_size(p1).unwrap(), 256);
    assert!(pool.validate(p1));
    pool.free(&owner_a, p1).expect("free p1");
    assert!(!pool.validate(p1), "freed pointer must fail validation");

    // Allocation determinism: the same request, with nothing intervening,
    // lands at the identical payload address.
    let p1_again = pool.alloc(&owner_a, 100).expect("re-alloc 100 bytes");
    assert_eq!(p1, p1_again, "alloc/free/alloc of the same size must be deterministic");

    // Scenario 2: two same-size allocations, freed in order, cascade-merge
    // back through every class until the segment is whole again. We observe
    // this indirectly: a subsequent alloc of the same size reuses exactly
    // the first allocation's address, proving the merge went all the way up
    // (not just to some intermediate class).
    let p2 = pool.alloc(&owner_a, 100).expect("alloc second 100 bytes");
    assert_ne!(p1_again, p2);
    pool.free(&owner_a, p1_again).expect("free first of the pair");
    pool.free(&owner_a, p2).expect("free second of the pair");
    let p3 = pool.alloc(&owner_a, 100).expect("alloc after cascade merge");
    assert_eq!(p3, p1, "cascade merge must restore the pre-allocation free-list state");
    pool.free(&owner_a, p3).expect("free p3");

    // Scenario 3: a 200 MiB allocation takes the entire persistent segment
    // (class 28, since 2^28 == SEGMENT_SIZE). A second allocation of any
    // size can no longer fit in segment 0 and must create a new segment.
    let big = pool.alloc(&owner_a, 200 * 1024 * 1024).expect("200 MiB alloc");
    assert_eq!(pool.chunk_size(big).unwrap(), SEGMENT_SIZE);
    let overflow = pool.alloc(&owner_a, 4096).expect("alloc forcing a second segment");
    assert!(
        (overflow as usize).abs_diff(big as usize) >= SEGMENT_SIZE as usize,
        "the overflow allocation must land in a different segment's reservation slot"
    );
    pool.free(&owner_a, overflow).expect("free overflow alloc");
    pool.free(&owner_a, big).expect("free 200 MiB alloc");

    // Scenario 4: a class-10 chunk (900-byte request, 72-byte header, 4-byte
    // tail magic all fit under 1024 but over 512) reallocated down to a
    // 4-byte requirement drops to class 8, leaving class-9 and class-8 free
    // chunks carved from the tail, and the original pointer is unchanged.
    let shrinkable = pool.alloc(&owner_a, 900).expect("alloc at class 10");
    assert_eq!(pool.chunk_size(shrinkable).unwrap(), 1024);
    let shrunk = pool.realloc(&owner_a, shrinkable, 4).expect("shrink realloc");
    assert_eq!(shrunk, shrinkable, "shrinking realloc must not move the chunk");
    assert_eq!(pool.chunk_size(shrunk).unwrap(), 256);
    assert_eq!(pool.size(shrunk).unwrap(), 4);

    // The tail chunks carved by the shrink are reusable: two fresh
    // allocations that fit in classes 8 and 9 must succeed without growing
    // the segment further (they fall directly into the freed tail).
    let tail_small = pool.alloc(&owner_a, 4).expect("alloc into the class-8 tail chunk");
    let tail_medium = pool.alloc(&owner_a, 400).expect("alloc into the class-9 tail chunk");
    pool.free(&owner_a, tail_small).unwrap();
    pool.free(&owner_a, tail_medium).unwrap();
    pool.free(&owner_a, shrunk).unwrap();

    // Scenario 5: free_all across a mix of sizes leaves nothing allocated
    // for this owner, and every returned pointer fails validation.
    let sizes = [16usize, 48, 130, 600, 5000];
    let mut pointers = Vec::with_capacity(1000);
    for i in 0..1000 {
        let sz = sizes[i % sizes.len()];
        pointers.push(pool.alloc(&owner_a, sz).expect("mixed-size alloc"));
    }
    pool.free_all(&owner_a).expect("free_all");
    for ptr in &pointers {
        assert!(!pool.validate(*ptr), "free_all must invalidate every owned chunk");
    }

    // The pool is still usable afterward: the freed capacity is reclaimed.
    let p_final = pool.alloc(&owner_a, 100).expect("alloc after free_all");
    assert!(pool.validate(p_final));
    pool.free(&owner_a, p_final).unwrap();
}

#[test]
fn too_large_request_is_rejected() {
    let host = StandaloneHost::new("scenario-pg", 5432)
        .with_config("dma_segment_size", SEGMENT_SIZE as usize)
        .with_config("max_dma_segment_nums", 4)
        .with_config("min_dma_segment_nums", 1);
    // Shares the same process-wide pool as `end_to_end_scenarios`; `init` is
    // idempotent, so this just gets a handle to the already-running pool.
    let ctx = lifecycle::init(Box::new(host), Box::new(NullDevice)).expect("pool init");
    let pool = PoolAllocator::new(ctx);
    let owner = SimpleOwner::new(2);

    let result = pool.alloc(&owner, 1 << 40);
    assert!(result.is_err());
}
