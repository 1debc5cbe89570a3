//! Randomized invariant tests for the allocator stack.

use std::io::Read;

use proptest::prelude::*;

use bufarena::{Buddy, Buffers, FreeIndex, ScalableAllocator};

/// One step of an allocator workload.
#[derive(Debug, Clone)]
enum Op {
    Malloc(usize),
    Free(usize),
}

fn ops(max_size: usize, len: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (1..=max_size).prop_map(Op::Malloc),
            (0usize..10_000).prop_map(Op::Free),
        ],
        1..len,
    )
}

proptest! {
    /// Allocated minus freed always equals the bytes held inside regions.
    #[test]
    fn scalable_conserves_bytes(ops in ops(5000, 120)) {
        let alloc = ScalableAllocator::new(1024);
        let mut live = Vec::new();
        for op in ops {
            match op {
                Op::Malloc(n) => live.push(alloc.malloc(n)),
                Op::Free(pick) => {
                    if !live.is_empty() {
                        let buf = live.swap_remove(pick % live.len());
                        prop_assert!(alloc.free(buf));
                    }
                }
            }
            let held: usize = alloc
                .children()
                .iter()
                .map(|c| c.size() - c.free_size())
                .sum();
            prop_assert_eq!(held as u64, alloc.total_malloc() - alloc.total_free());
        }
        for buf in live {
            prop_assert!(alloc.free(buf));
        }
        prop_assert_eq!(alloc.total_malloc(), alloc.total_free());
    }

    /// No two live buffers share a byte: every buffer keeps its own fill
    /// pattern across the whole workload.
    #[test]
    fn scalable_buffers_never_overlap(ops in ops(2000, 80)) {
        let alloc = ScalableAllocator::new(512);
        let mut live: Vec<(u8, bufarena::Buf)> = Vec::new();
        let mut stamp = 0u8;
        for op in ops {
            match op {
                Op::Malloc(n) => {
                    stamp = stamp.wrapping_add(1);
                    let mut buf = alloc.malloc(n);
                    buf.fill(stamp);
                    live.push((stamp, buf));
                }
                Op::Free(pick) => {
                    if !live.is_empty() {
                        let (expected, buf) = live.swap_remove(pick % live.len());
                        prop_assert!(buf.iter().all(|&b| b == expected));
                        prop_assert!(alloc.free(buf));
                    }
                }
            }
        }
        for (expected, buf) in live {
            prop_assert!(buf.iter().all(|&b| b == expected));
            prop_assert!(alloc.free(buf));
        }
    }

    /// Releasing every allocation coalesces each region back into one free
    /// interval spanning the whole slab.
    #[test]
    fn index_coalesces_completely(ops in ops(512, 100)) {
        let mut index = FreeIndex::new(1 << 14);
        let mut live = Vec::new();
        for op in ops {
            match op {
                Op::Malloc(n) => {
                    if let Some(offset) = index.allocate(n) {
                        live.push((offset, n));
                    }
                }
                Op::Free(pick) => {
                    if !live.is_empty() {
                        let (offset, n) = live.swap_remove(pick % live.len());
                        prop_assert!(index.free(offset, n));
                    }
                }
            }
        }
        for (offset, n) in live {
            prop_assert!(index.free(offset, n));
        }
        prop_assert_eq!(index.free_size(), index.size());
        prop_assert_eq!(index.blocks(), vec![(0, 1 << 14)]);
    }

    /// The index always serves the smallest adequate interval, smallest
    /// offset first, matching a brute-force scan of its own block list.
    #[test]
    fn index_allocates_best_fit(ops in ops(600, 60), probe in 1usize..700) {
        let mut index = FreeIndex::new(1 << 13);
        let mut live = Vec::new();
        for op in ops {
            match op {
                Op::Malloc(n) => {
                    if let Some(offset) = index.allocate(n) {
                        live.push((offset, n));
                    }
                }
                Op::Free(pick) => {
                    if !live.is_empty() {
                        let (offset, n) = live.swap_remove(pick % live.len());
                        prop_assert!(index.free(offset, n));
                    }
                }
            }
        }
        let expected = index
            .blocks()
            .into_iter()
            .filter(|(s, e)| e - s >= probe)
            .min_by_key(|(s, e)| (e - s, *s))
            .map(|(s, _)| s);
        prop_assert_eq!(index.find(probe), expected);
        prop_assert_eq!(index.allocate(probe), expected);
    }

    /// Paired alloc/free sequences return a buddy to the fully-free state.
    #[test]
    fn buddy_round_trips(sizes in prop::collection::vec(1usize..=(1 << 14), 1..40)) {
        let buddy = Buddy::with_capacity(1 << 18); // 256 units
        let mut live = Vec::new();
        for size in sizes {
            match buddy.alloc(size) {
                Ok(offset) => live.push(offset),
                Err(_) => {
                    if let Some(offset) = live.pop() {
                        prop_assert!(buddy.free(offset).is_ok());
                    }
                }
            }
        }
        for offset in live {
            prop_assert!(buddy.free(offset).is_ok());
        }
        prop_assert_eq!(buddy.largest_free_units(), buddy.unit_count());
    }

    /// Reading a scatter-gather buffer in arbitrary chunk sizes yields
    /// exactly its contiguous contents.
    #[test]
    fn reader_round_trips(
        segments in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..50), 1..10),
        chunks in prop::collection::vec(1usize..17, 1..60),
    ) {
        let mut buffers = Buffers::new();
        for segment in &segments {
            buffers.push_one(segment.clone());
        }
        let expected = buffers.to_bytes();

        let mut reader = buffers.reader();
        let mut out = Vec::new();
        let mut chunk = chunks.iter().cycle();
        loop {
            let mut buf = vec![0u8; *chunk.next().unwrap()];
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        prop_assert_eq!(out, expected);
    }

    /// LEB128 values below 2^56 survive an encode/decode round trip.
    #[test]
    fn leb128_round_trips(value in 0u64..(1 << 56)) {
        let mut encoded = Vec::new();
        let mut v = value;
        loop {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            encoded.push(byte);
            if v == 0 {
                break;
            }
        }
        let expected_len = encoded.len();

        let mut buffers = Buffers::from(encoded);
        let mut reader = buffers.reader();
        let (decoded, read) = reader.leb128_unmarshal().unwrap();
        prop_assert_eq!(decoded, value);
        prop_assert_eq!(read, expected_len);
    }
}
