//! Property 7: functional-mode access is a side channel for inspecting or
//! patching memory state (checkpoint restore, debugger peek) that must never
//! perturb anything a real access depends on: it must not allocate a line
//! for an address that is not already resident, and it must not disturb the
//! recency ordering the replacement policy uses to pick eviction victims.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use cachesim_core::cache::{AccessOutcome, Cache};
use cachesim_core::coherence::NullCoherence;
use cachesim_core::config::{CacheGeometry, CacheMode};
use cachesim_core::packet::{Packet, PacketData};
use cachesim_core::port::{RequestPortOwner, ResponsePort, ResponsePortOwner};
use cachesim_core::prefetch::NullPrefetcher;
use cachesim_core::request::{AccessFlags, Request};
use cachesim_core::scheduler::{DeterministicQueue, EventQueue};
use cachesim_core::{Address, Command, Tick};

fn geometry() -> CacheGeometry {
    CacheGeometry {
        block_size: 64,
        assoc: 2,
        n_sets: 1,
        mshr_capacity: 4,
        writeback_capacity: 4,
        hit_latency: 2,
        response_latency: 3,
    }
}

struct TestMemory {
    response_port: ResponsePort,
    scheduler: Rc<RefCell<dyn EventQueue>>,
    backing: HashMap<Address, Vec<u8>>,
    functional_touches: usize,
}

impl std::fmt::Debug for TestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestMemory")
            .field("response_port", &self.response_port)
            .field("backing", &self.backing)
            .field("functional_touches", &self.functional_touches)
            .finish()
    }
}

impl TestMemory {
    fn new(scheduler: Rc<RefCell<dyn EventQueue>>) -> Self {
        Self {
            response_port: ResponsePort::new("test_memory.response_port"),
            scheduler,
            backing: HashMap::new(),
            functional_touches: 0,
        }
    }

    fn apply(&mut self, pkt: &mut Packet) {
        let block = self.backing.entry(pkt.address).or_insert_with(|| vec![0u8; 64]);
        if pkt.is_write() {
            if let PacketData::Owned(bytes) = &pkt.data {
                let n = bytes.len().min(block.len());
                block[..n].copy_from_slice(&bytes[..n]);
            }
        } else {
            pkt.data = PacketData::Owned(block.clone());
        }
    }
}

impl ResponsePortOwner for TestMemory {
    fn recv_timing_req(&mut self, mut pkt: Packet, now: Tick) -> Result<(), Packet> {
        self.apply(&mut pkt);
        let peer = self.response_port.peer_handle();
        self.scheduler.borrow_mut().schedule(
            now + 5,
            Box::new(move |tick| {
                peer.borrow_mut().recv_timing_resp(pkt, tick);
            }),
        );
        Ok(())
    }

    fn recv_atomic_req(&mut self, pkt: &mut Packet, _now: Tick) -> Tick {
        self.apply(pkt);
        5
    }

    fn recv_functional_req(&mut self, pkt: &mut Packet) {
        self.functional_touches += 1;
        self.apply(pkt);
    }

    fn recv_retry_resp(&mut self, _now: Tick) {}
}

#[derive(Debug, Default)]
struct ResponseCollector {
    responses: Vec<Packet>,
}

impl RequestPortOwner for ResponseCollector {
    fn recv_timing_resp(&mut self, pkt: Packet, _now: Tick) -> bool {
        self.responses.push(pkt);
        true
    }

    fn recv_retry_req(&mut self, _now: Tick) {}
}

fn read(addr: Address, now: Tick) -> Packet {
    let req = Rc::new(Request::new(addr, 8, AccessFlags::default(), 0, 0, 0, now));
    Packet::new(req, Command::ReadReq, addr, 8, now)
}

fn write(addr: Address, now: Tick, byte: u8) -> Packet {
    let req = Rc::new(Request::new(addr, 8, AccessFlags::default(), 0, 0, 0, now));
    Packet::new(req, Command::WriteReq, addr, 8, now).with_data(vec![byte; 8])
}

struct Harness {
    cache: Rc<RefCell<Cache>>,
    memory: Rc<RefCell<TestMemory>>,
    collector: Rc<RefCell<ResponseCollector>>,
    scheduler: Rc<RefCell<dyn EventQueue>>,
}

fn build() -> Harness {
    let scheduler: Rc<RefCell<dyn EventQueue>> = Rc::new(RefCell::new(DeterministicQueue::new()));
    let cache = Rc::new(RefCell::new(Cache::new(
        "l1",
        geometry(),
        CacheMode::Timing,
        0,
        Box::new(NullCoherence),
        Box::new(NullPrefetcher),
        Rc::clone(&scheduler),
    )));
    let memory = Rc::new(RefCell::new(TestMemory::new(Rc::clone(&scheduler))));
    let collector = Rc::new(RefCell::new(ResponseCollector::default()));
    cache.borrow_mut().mem_side.connect(Rc::clone(&memory) as Rc<RefCell<dyn ResponsePortOwner>>);
    memory.borrow_mut().response_port.connect(Rc::clone(&cache) as Rc<RefCell<dyn RequestPortOwner>>);
    cache.borrow_mut().cpu_side.connect(Rc::clone(&collector) as Rc<RefCell<dyn RequestPortOwner>>);
    Harness { cache, memory, collector, scheduler }
}

/// Sends `pkt` through the real timing path and drains the scheduler until
/// its reply lands, so the cache ends up in the same resident state a real
/// CPU access would leave it in.
fn fill_via_timing(h: &Harness, pkt: Packet, mut tick: Tick) -> Tick {
    let before = h.collector.borrow().responses.len();
    h.cache.borrow_mut().recv_timing_req(pkt, tick).expect("the test memory never NACKs");
    while h.collector.borrow().responses.len() == before {
        tick += 1;
        h.scheduler.borrow_mut().service_until(tick);
    }
    tick
}

#[test]
fn functional_access_to_a_cold_address_never_allocates_a_line() {
    let h = build();
    let mut pkt = read(0x000, 0);
    h.cache.borrow_mut().recv_functional_req(&mut pkt);
    assert_eq!(h.memory.borrow().functional_touches, 1, "a cold functional access must fall through to the backing store");

    // If the functional read had allocated a resident line, a real access to
    // the same address would now be a hit instead of a miss.
    let probe = read(0x000, 1);
    match h.cache.borrow_mut().access(probe, 1) {
        AccessOutcome::Miss { .. } => {}
        other => panic!("expected a cold functional touch to leave no resident line, got {other:?}"),
    };
}

#[test]
fn functional_write_to_a_cold_address_updates_the_backing_store_without_allocating() {
    let h = build();
    let mut pkt = write(0x040, 0, 0x7A);
    h.cache.borrow_mut().recv_functional_req(&mut pkt);
    assert_eq!(h.memory.borrow().backing.get(&0x040).map(|b| b[0]), Some(0x7A));

    let probe = read(0x040, 1);
    match h.cache.borrow_mut().access(probe, 1) {
        AccessOutcome::Miss { .. } => {}
        other => panic!("a functional write to a cold line must not allocate it either, got {other:?}"),
    };
}

#[test]
fn functional_access_to_a_resident_line_bypasses_memory_and_never_updates_recency() {
    let h = build();

    // Fill two lines into the two-way set, A before B, so B starts out the
    // more recently touched of the pair.
    let mut tick = fill_via_timing(&h, read(0x000, 0), 0);
    tick = fill_via_timing(&h, read(0x080, tick + 5), tick + 5);

    // A real hit on A makes it the more recently used line again.
    let before = h.collector.borrow().responses.len();
    h.cache.borrow_mut().recv_timing_req(read(0x000, tick + 5), tick + 5).expect("A is resident, this must hit");
    tick += 5;
    while h.collector.borrow().responses.len() == before {
        tick += 1;
        h.scheduler.borrow_mut().service_until(tick);
    }

    // Now hammer B with functional reads and writes. None of this may touch
    // recency or reach the backing store, since B is resident.
    let touches_before = h.memory.borrow().functional_touches;
    for i in 0..50 {
        let mut pkt = if i % 2 == 0 { read(0x080, 0) } else { write(0x080, 0, i as u8) };
        h.cache.borrow_mut().recv_functional_req(&mut pkt);
    }
    assert_eq!(
        h.memory.borrow().functional_touches,
        touches_before,
        "functional access to a resident line must be served locally, not forwarded downstream"
    );

    // A third line mapping to the same set forces an eviction. If functional
    // traffic had bumped B's recency it would survive instead of A; since it
    // must not, A (genuinely touched more recently) should remain resident
    // and B should be the one evicted.
    fill_via_timing(&h, read(0x100, tick + 5), tick + 5);

    match h.cache.borrow_mut().access(read(0x000, tick + 100), tick + 100) {
        AccessOutcome::Hit { .. } => {}
        other => panic!("A was the genuinely more recent line and should have survived eviction, got {other:?}"),
    };
    match h.cache.borrow_mut().access(read(0x080, tick + 100), tick + 100) {
        AccessOutcome::Miss { .. } => {}
        other => panic!("B's recency must not have been bumped by functional traffic, so it should have been evicted, got {other:?}"),
    };
}
