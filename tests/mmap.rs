//! Exercises the public API over a memory-mapped region.
#![cfg(unix)]

use segfit::{MmapRegion, SegFit, CHUNK_SIZE, GRANULARITY};

#[test]
fn interleaved_allocations_keep_their_contents() {
    let mut heap = SegFit::new(MmapRegion::new(4 << 20).unwrap()).unwrap();

    let sizes = [1usize, 8, 13, 24, 100, 112, 448, 1000, 4096, 20000];
    let mut live = Vec::new();
    for round in 0..50u8 {
        for (i, &size) in sizes.iter().enumerate() {
            let p = heap.allocate(size).unwrap();
            assert_eq!(p.as_ptr() as usize % GRANULARITY, 0);
            let fill = round ^ i as u8;
            unsafe { std::ptr::write_bytes(p.as_ptr(), fill, size) };
            live.push((p, size, fill));
        }

        // Retire every other allocation to stir the free lists.
        let mut i = 0;
        live.retain(|&(p, size, fill)| {
            i += 1;
            if i % 2 == 0 {
                unsafe {
                    for k in 0..size {
                        assert_eq!(*p.as_ptr().add(k), fill);
                    }
                    heap.deallocate(p);
                }
                false
            } else {
                true
            }
        });
    }

    for &(p, size, fill) in &live {
        unsafe {
            for k in 0..size {
                assert_eq!(*p.as_ptr().add(k), fill);
            }
            heap.deallocate(p);
        }
    }
}

#[test]
fn growth_past_the_initial_chunk() {
    let mut heap = SegFit::new(MmapRegion::new(8 << 20).unwrap()).unwrap();

    // Far more than one chunk's worth; every pointer must be distinct.
    let mut ptrs = Vec::new();
    for _ in 0..2000 {
        ptrs.push(heap.allocate(1024).unwrap());
    }

    let mut distinct: Vec<usize> = ptrs.iter().map(|p| p.as_ptr() as usize).collect();
    distinct.sort_unstable();
    distinct.dedup();
    assert_eq!(distinct.len(), ptrs.len());

    for p in ptrs {
        unsafe { heap.deallocate(p) };
    }
}

#[test]
fn starved_region_reports_out_of_memory() {
    assert!(SegFit::new(MmapRegion::new(CHUNK_SIZE / 2).unwrap()).is_err());

    // A reservation of exactly one chunk boots, then refuses to grow.
    let mut heap = SegFit::new(MmapRegion::new(CHUNK_SIZE).unwrap()).unwrap();
    assert!(heap.allocate(CHUNK_SIZE).is_none());
    assert!(heap.allocate(64).is_some());
}

#[test]
fn realloc_grows_and_preserves() {
    let mut heap = SegFit::new(MmapRegion::new(1 << 20).unwrap()).unwrap();

    let mut p = heap.allocate(10).unwrap();
    unsafe {
        for i in 0..10 {
            *p.as_ptr().add(i) = i as u8 * 3;
        }
        for new_size in [100usize, 1000, 10000] {
            p = heap.reallocate(p, new_size);
            for i in 0..10 {
                assert_eq!(*p.as_ptr().add(i), i as u8 * 3);
            }
        }
        heap.deallocate(p);
    }
}
