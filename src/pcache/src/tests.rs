//! Whole-cache behaviour: fault fills, eviction under pressure, and the
//! cross-cutting invariants of the bit protocol.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};

use crate::{
    AddressSpace, EvictionPolicy, FillCause, FillKind, LineFlags, MapRemote, NullTlbFlush, Pcache,
    PcacheConfig, PcacheError, RemoteMemory, RmapCaller, SetStat, PAGE_SIZE,
};

fn cache_with(
    sets: usize,
    ways: usize,
    policy: EvictionPolicy,
) -> (Pcache, Arc<MapRemote>) {
    let remote = Arc::new(MapRemote::new());
    let cache = Pcache::new(
        PcacheConfig { sets, ways, policy },
        Arc::clone(&remote) as Arc<dyn RemoteMemory>,
        Arc::new(NullTlbFlush),
    );
    (cache, remote)
}

/// Addresses that all hash into `set` for a cache with `sets` sets.
fn addrs_in_set(sets: usize, set: usize) -> impl Iterator<Item = u64> {
    (0..).map(move |i| ((i * sets + set) as u64) << 12)
}

#[test]
fn fill_miss_installs_one_rmap_entry() {
    let (cache, remote) = cache_with(16, 4, EvictionPolicy::Lru);
    let mm = AddressSpace::new(1);

    let vaddr = 0x7000_0000;
    let mut page = [0u8; PAGE_SIZE];
    page[..4].copy_from_slice(b"page");
    remote.seed(mm.id(), vaddr, page);

    let out = cache.fill(&mm, vaddr, FillCause::Miss).unwrap();
    assert_eq!(out.kind, FillKind::FromMemory);
    assert_eq!(cache.set_index(vaddr), out.line / cache.config().ways);

    let line = cache.line(out.line);
    assert_eq!(line.mapcount.load(Ordering::Relaxed), 1);
    assert!(line.bits.test(LineFlags::VALID, Ordering::Acquire));
    {
        let guard = line.lock();
        assert_eq!(guard.rmap().len(), 1);
        let entry = &guard.rmap()[0];
        assert_eq!(entry.mm, mm.id());
        assert_eq!(entry.vaddr, vaddr);
        assert_eq!(entry.caller, RmapCaller::FillRemote);
    }

    // PTE points at the line; content arrived intact.
    assert_eq!(cache.resolve(&mm, vaddr), Some(out.line));
    assert_eq!(&cache.read_page(&mm, vaddr).unwrap()[..4], b"page");

    // Second fault on the same page is a hit, not a second entry.
    let again = cache.fill(&mm, vaddr, FillCause::Miss).unwrap();
    assert_eq!(again.kind, FillKind::Hit);
    assert_eq!(again.line, out.line);
    assert_eq!(line.mapcount.load(Ordering::Relaxed), 1);
}

#[test]
fn zero_fill_produces_zero_page() {
    let (cache, _) = cache_with(16, 4, EvictionPolicy::Lru);
    let mm = AddressSpace::new(2);
    let out = cache.fill(&mm, 0x1234_5678, FillCause::Zero).unwrap();
    assert_eq!(out.kind, FillKind::Zeroed);
    // Address gets page-aligned on the way in.
    let page = cache.read_page(&mm, 0x1234_5000).unwrap();
    assert!(page.iter().all(|&b| b == 0));
}

#[test]
fn lru_eviction_under_pressure() {
    let sets = 4;
    let ways = 2;
    let (cache, _) = cache_with(sets, ways, EvictionPolicy::Lru);
    let mm = AddressSpace::new(3);

    let set = 1;
    let addrs: Vec<u64> = addrs_in_set(sets, set).take(ways + 1).collect();

    for &a in &addrs[..ways] {
        cache.fill(&mm, a, FillCause::Zero).unwrap();
    }
    let before = cache.set_stats(set);
    assert_eq!(before[SetStat::Eviction as usize], 0);

    // Touch addrs[1] so addrs[0] is the LRU tail.
    cache.fill(&mm, addrs[1], FillCause::Miss).unwrap();

    let victim_line = cache.resolve(&mm, addrs[0]).unwrap();
    cache.fill(&mm, addrs[ways], FillCause::Zero).unwrap();

    // Tail was torn down: no mapping, no rmap, bits back to free.
    assert_eq!(cache.resolve(&mm, addrs[0]), None);
    let line = cache.line(victim_line);
    assert_eq!(line.mapcount.load(Ordering::Relaxed), 0);
    let bits = line.bits.load(Ordering::Acquire);
    assert!(!bits.intersects(LineFlags::VALID | LineFlags::RECLAIM | LineFlags::DIRTY));

    // Newcomer is resident and the eviction was counted once.
    assert!(cache.resolve(&mm, addrs[ways]).is_some());
    let after = cache.set_stats(set);
    assert_eq!(after[SetStat::Eviction as usize], 1);
}

#[test]
fn dirty_eviction_writes_back() {
    let sets = 4;
    let ways = 1;
    let (cache, remote) = cache_with(sets, ways, EvictionPolicy::Lru);
    let mm = AddressSpace::new(4);

    let mut addrs = addrs_in_set(sets, 2);
    let a = addrs.next().unwrap();
    let b = addrs.next().unwrap();

    cache.fill(&mm, a, FillCause::Zero).unwrap();
    assert!(cache.write_page(&mm, a, 8, b"dirtydata"));

    // Forces eviction of `a`; its payload must land in remote memory.
    cache.fill(&mm, b, FillCause::Zero).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(page) = remote.page(mm.id(), a) {
            assert_eq!(&page[8..17], b"dirtydata");
            break;
        }
        assert!(Instant::now() < deadline, "writeback never arrived");
        std::thread::sleep(Duration::from_millis(1));
    }

    // Faulting `a` back in observes the written-back contents.
    let out = cache.fill(&mm, a, FillCause::Miss).unwrap();
    assert_eq!(out.kind, FillKind::FromMemory);
    assert_eq!(&cache.read_page(&mm, a).unwrap()[8..17], b"dirtydata");
}

#[test]
fn victim_policy_refill_hits_victim_slot() {
    let sets = 4;
    let (cache, _) = cache_with(sets, 1, EvictionPolicy::Victim { slots_per_set: 2 });
    let mm = AddressSpace::new(5);

    let mut addrs = addrs_in_set(sets, 3);
    let a = addrs.next().unwrap();
    let b = addrs.next().unwrap();

    cache.fill(&mm, a, FillCause::Zero).unwrap();
    assert!(cache.write_page(&mm, a, 0, b"victim"));

    // Evicts `a` into the set's victim slot.
    cache.fill(&mm, b, FillCause::Zero).unwrap();
    let set = cache.set_index(a);
    assert_eq!(cache.nr_victims(set), 1);

    // Refault: content comes from the slot, not remote memory. Allocating
    // for it displaces `b`, which parks in the slot `a` vacated.
    let out = cache.fill(&mm, a, FillCause::Miss).unwrap();
    assert_eq!(out.kind, FillKind::FromVictim);
    assert_eq!(&cache.read_page(&mm, a).unwrap()[..6], b"victim");
    assert_eq!(cache.nr_victims(set), 1);
    assert_eq!(cache.set_stats(set)[SetStat::FillVictim as usize], 1);
}

#[test]
fn victim_slots_overflow_fifo() {
    let sets = 2;
    let (cache, remote) = cache_with(sets, 1, EvictionPolicy::Victim { slots_per_set: 1 });
    let mm = AddressSpace::new(6);

    let addrs: Vec<u64> = addrs_in_set(sets, 0).take(3).collect();
    cache.fill(&mm, addrs[0], FillCause::Zero).unwrap();
    assert!(cache.write_page(&mm, addrs[0], 0, b"first"));
    cache.fill(&mm, addrs[1], FillCause::Zero).unwrap();
    cache.fill(&mm, addrs[2], FillCause::Zero).unwrap();

    // Bound is one slot; the first victim overflowed out. Its dirty data
    // was pushed home before parking, so nothing is lost.
    assert_eq!(cache.nr_victims(0), 1);
    assert_eq!(&remote.page(mm.id(), addrs[0]).unwrap()[..5], b"first");
}

#[test]
fn perset_list_policy_sweeps_and_evicts() {
    let sets = 4;
    let (cache, _) = cache_with(sets, 1, EvictionPolicy::PerSetList);
    let mm = AddressSpace::new(7);

    let mut addrs = addrs_in_set(sets, 1);
    let a = addrs.next().unwrap();
    let b = addrs.next().unwrap();

    cache.fill(&mm, a, FillCause::Zero).unwrap();
    // Allocator finds the set full, sweeps, drains the staged entry.
    cache.fill(&mm, b, FillCause::Zero).unwrap();

    assert_eq!(cache.resolve(&mm, a), None);
    assert!(cache.resolve(&mm, b).is_some());
    assert_eq!(cache.set_stats(1)[SetStat::Eviction as usize], 1);
}

#[test]
fn cow_fill_copies_and_remaps() {
    let (cache, _) = cache_with(16, 4, EvictionPolicy::Lru);
    let mm = AddressSpace::new(8);

    let vaddr = 0xdead_0000;
    cache.fill(&mm, vaddr, FillCause::Zero).unwrap();
    assert!(cache.write_page(&mm, vaddr, 0, b"original"));
    let old_line = cache.resolve(&mm, vaddr).unwrap();

    let out = cache.fill(&mm, vaddr, FillCause::Cow).unwrap();
    assert_eq!(out.kind, FillKind::Copied);
    assert_ne!(out.line, old_line);
    assert_eq!(cache.resolve(&mm, vaddr), Some(out.line));
    assert_eq!(&cache.read_page(&mm, vaddr).unwrap()[..8], b"original");

    // Old line no longer maps the address.
    assert_eq!(cache.line(old_line).mapcount.load(Ordering::Relaxed), 0);
    let guard = cache.line(out.line).lock();
    assert_eq!(guard.rmap()[0].caller, RmapCaller::Cow);
}

#[test]
fn concurrent_fills_collapse_to_one_line() {
    let (cache, _) = cache_with(8, 4, EvictionPolicy::Lru);
    let mm = AddressSpace::new(9);
    let vaddr = 0x4200_0000;

    let lines: Vec<_> = std::thread::scope(|s| {
        (0..8)
            .map(|_| {
                s.spawn(|| loop {
                    // Transient SetBusy under this much contention is fine;
                    // the fault path retries like a real fault would.
                    match cache.fill(&mm, vaddr, FillCause::Zero) {
                        Ok(out) => break out.line,
                        Err(_) => std::thread::yield_now(),
                    }
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect()
    });

    // Every fault resolved to the same single line with a single entry.
    let line = cache.resolve(&mm, vaddr).unwrap();
    assert!(lines.iter().all(|&l| l == line));
    assert_eq!(cache.line(line).mapcount.load(Ordering::Relaxed), 1);

    let mut mapped = 0;
    for id in 0..cache.nr_lines() {
        let guard = cache.line(id).lock();
        mapped += guard
            .rmap()
            .iter()
            .filter(|e| e.mm == mm.id() && e.vaddr == vaddr)
            .count();
    }
    assert_eq!(mapped, 1);
}

#[test]
fn mapcount_matches_rmap_len_after_churn() {
    let (cache, _) = cache_with(4, 2, EvictionPolicy::Lru);
    let mm = Arc::new(AddressSpace::new(10));

    std::thread::scope(|s| {
        for t in 0..4 {
            let cache = &cache;
            let mm = Arc::clone(&mm);
            s.spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(t);
                for _ in 0..200 {
                    let vaddr = (rng.gen_range(0..32u64)) << 12;
                    match cache.fill(&mm, vaddr, FillCause::Zero) {
                        Ok(_) | Err(PcacheError::SetBusy(_)) | Err(PcacheError::NoLine(_)) => {}
                        Err(e) => panic!("unexpected fill error: {e}"),
                    }
                }
            });
        }
    });

    for id in 0..cache.nr_lines() {
        let line = cache.line(id);
        let guard = line.lock();
        assert_eq!(
            line.mapcount.load(Ordering::Relaxed) as usize,
            guard.rmap().len(),
            "line {id}"
        );
        drop(guard);
        // Free lines carry no live state bits.
        let bits = line.bits.load(Ordering::Acquire);
        if !bits.contains(LineFlags::ALLOCATED) {
            assert!(!bits.intersects(LineFlags::CHECK_AT_FREE), "line {id}: {bits:?}");
        }
    }
}

struct FailingRemote;

impl RemoteMemory for FailingRemote {
    fn fetch_page(
        &self,
        _mm: u64,
        _vaddr: u64,
        _dst: &mut [u8; PAGE_SIZE],
    ) -> Result<(), PcacheError> {
        Err(PcacheError::Remote("link down".into()))
    }

    fn writeback_page(
        &self,
        _mm: u64,
        _vaddr: u64,
        _src: &[u8; PAGE_SIZE],
    ) -> Result<(), PcacheError> {
        Err(PcacheError::Remote("link down".into()))
    }
}

#[test]
fn fetch_failure_releases_the_claim() {
    let cache = Pcache::new(
        PcacheConfig {
            sets: 4,
            ways: 2,
            policy: EvictionPolicy::Lru,
        },
        Arc::new(FailingRemote),
        Arc::new(NullTlbFlush),
    );
    let mm = AddressSpace::new(11);

    assert!(matches!(
        cache.fill(&mm, 0x9000, FillCause::Miss),
        Err(PcacheError::Remote(_))
    ));
    assert_eq!(cache.resolve(&mm, 0x9000), None);

    // Every line went back to free; the claim did not leak.
    for id in 0..cache.nr_lines() {
        assert_eq!(
            cache.line(id).bits.load(Ordering::Acquire),
            LineFlags::empty(),
            "line {id}"
        );
    }
}

#[test]
fn fork_shares_lines_until_cow_diverges() {
    let (cache, _) = cache_with(16, 4, EvictionPolicy::Lru);
    let parent = AddressSpace::new(20);
    let child = AddressSpace::new(21);

    let vaddr = 0x5100_0000;
    cache.fill(&parent, vaddr, FillCause::Zero).unwrap();
    assert!(cache.write_page(&parent, vaddr, 0, b"inherit"));

    cache.fork_address_space(&parent, &child);

    // One line, two mappings; the child's entry is tagged as a fork.
    let line = cache.resolve(&parent, vaddr).unwrap();
    assert_eq!(cache.resolve(&child, vaddr), Some(line));
    assert_eq!(cache.line(line).mapcount.load(Ordering::Relaxed), 2);
    {
        let guard = cache.line(line).lock();
        assert!(guard
            .rmap()
            .iter()
            .any(|e| e.mm == child.id() && e.caller == RmapCaller::Fork));
    }
    assert_eq!(&cache.read_page(&child, vaddr).unwrap()[..7], b"inherit");

    // The child's write fault copies; the parent keeps its mapping.
    let out = cache.fill(&child, vaddr, FillCause::Cow).unwrap();
    assert_eq!(out.kind, FillKind::Copied);
    assert_ne!(cache.resolve(&child, vaddr).unwrap(), line);
    assert_eq!(cache.resolve(&parent, vaddr), Some(line));
    assert_eq!(cache.line(line).mapcount.load(Ordering::Relaxed), 1);
    assert_eq!(&cache.read_page(&child, vaddr).unwrap()[..7], b"inherit");
}

#[test]
fn mremap_slowpath_rebinds_within_a_set() {
    let sets = 8;
    let (cache, _) = cache_with(sets, 2, EvictionPolicy::Lru);
    let mm = AddressSpace::new(22);

    let old = 0x3000;
    let moved = old + ((sets as u64) << 12); // hashes to the same set
    cache.fill(&mm, old, FillCause::Zero).unwrap();
    assert!(cache.write_page(&mm, old, 0, b"moved"));
    let line = cache.resolve(&mm, old).unwrap();

    assert!(cache.move_mapping(&mm, old, moved));
    assert_eq!(cache.resolve(&mm, old), None);
    assert_eq!(cache.resolve(&mm, moved), Some(line));
    assert_eq!(&cache.read_page(&mm, moved).unwrap()[..5], b"moved");
    {
        let guard = cache.line(line).lock();
        assert_eq!(guard.rmap().len(), 1);
        assert_eq!(guard.rmap()[0].caller, RmapCaller::MremapSlowpath);
        assert_eq!(guard.rmap()[0].vaddr, moved);
    }

    // A cross-set target drops the binding; the page refaults later.
    let cross = 0x4000;
    assert_ne!(cache.set_index(moved), cache.set_index(cross));
    assert!(!cache.move_mapping(&mm, moved, cross));
    assert_eq!(cache.resolve(&mm, moved), None);
    assert_eq!(cache.resolve(&mm, cross), None);
    assert_eq!(cache.line(line).mapcount.load(Ordering::Relaxed), 0);
}

#[test]
fn zap_address_space_reclaims_lines() {
    let (cache, _) = cache_with(8, 2, EvictionPolicy::Lru);
    let mm = AddressSpace::new(12);

    for i in 0..6u64 {
        cache.fill(&mm, i << 12, FillCause::Zero).unwrap();
    }
    cache.zap_address_space(&mm);

    for i in 0..6u64 {
        assert_eq!(cache.resolve(&mm, i << 12), None);
    }
    for id in 0..cache.nr_lines() {
        let line = cache.line(id);
        assert_eq!(line.mapcount.load(Ordering::Relaxed), 0);
        assert!(!line.bits.test(LineFlags::VALID, Ordering::Acquire));
    }
}
