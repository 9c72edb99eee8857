use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use clap::Parser;
use color_eyre::eyre;

use cachesim_core::cache::Cache;
use cachesim_core::coherence::{CoherenceDriver, MsiCoherence, NullCoherence};
use cachesim_core::config::{CacheGeometry, CacheMode, CoherenceKind};
use cachesim_core::cpu::{CpuState, DcacheEndpoint, IcacheEndpoint, TimingCpu};
use cachesim_core::packet::{Packet, PacketData};
use cachesim_core::port::{RequestPortOwner, ResponsePort, ResponsePortOwner};
use cachesim_core::prefetch::NullPrefetcher;
use cachesim_core::scheduler::{DeterministicQueue, EventQueue};
use cachesim_core::translation::IdentityTranslation;
use cachesim_core::{Address, Tick};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Options {
    /// Number of synthetic instructions to fetch and execute
    #[arg(long = "instructions", default_value_t = 256)]
    pub instructions: u64,

    /// Issue one data access every N fetched instructions
    #[arg(long = "data-access-every", default_value_t = 4)]
    pub data_access_every: u64,

    /// Working-set size in bytes the synthetic data stream cycles through
    #[arg(long = "working-set", default_value_t = 4096)]
    pub working_set: u64,

    /// Cache block size in bytes
    #[arg(long = "block-size", default_value_t = 64)]
    pub block_size: u32,

    /// Cache associativity
    #[arg(long = "assoc", default_value_t = 4)]
    pub assoc: usize,

    /// Number of sets
    #[arg(long = "sets", default_value_t = 64)]
    pub n_sets: usize,

    /// Outstanding-miss (MSHR) capacity
    #[arg(long = "mshrs", default_value_t = 8)]
    pub mshr_capacity: usize,

    /// Writeback buffer capacity
    #[arg(long = "writeback-capacity", default_value_t = 8)]
    pub writeback_capacity: usize,

    /// Hit latency in ticks
    #[arg(long = "hit-latency", default_value_t = 2)]
    pub hit_latency: u64,

    /// Fill response latency in ticks
    #[arg(long = "response-latency", default_value_t = 2)]
    pub response_latency: u64,

    /// Latency in ticks of the memory model terminating each cache's mem-side port
    #[arg(long = "memory-latency", default_value_t = 20)]
    pub memory_latency: u64,

    /// Coherence protocol the data cache runs
    #[arg(long = "coherence", value_enum, default_value = "msi")]
    pub coherence: CoherenceArg,

    /// Write stats as JSON to this path in addition to stderr
    #[arg(short = 'o', long = "stats", value_name = "STATS_OUT")]
    pub stats_out_file: Option<PathBuf>,

    /// Turn on debug logging regardless of RUST_LOG
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub debug: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CoherenceArg {
    None,
    Msi,
}

impl From<CoherenceArg> for CoherenceKind {
    fn from(value: CoherenceArg) -> Self {
        match value {
            CoherenceArg::None => CoherenceKind::None,
            CoherenceArg::Msi => CoherenceKind::Msi,
        }
    }
}

fn coherence_driver(kind: CoherenceKind) -> Box<dyn CoherenceDriver> {
    match kind {
        CoherenceKind::None => Box::new(NullCoherence),
        CoherenceKind::Msi => Box::new(MsiCoherence),
    }
}

/// Terminates a cache's mem-side port for the demo binary: a flat,
/// fixed-latency backing store, not a real memory system (out of scope).
/// Good enough to exercise fills, writebacks, and atomic/functional reads
/// against the same address space the cache above it sees.
struct MainMemory {
    name: String,
    latency: Tick,
    scheduler: Rc<RefCell<dyn EventQueue>>,
    response_port: ResponsePort,
    backing: HashMap<Address, Vec<u8>>,
}

impl std::fmt::Debug for MainMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainMemory")
            .field("name", &self.name)
            .field("latency", &self.latency)
            .field("response_port", &self.response_port)
            .field("backing", &self.backing)
            .finish()
    }
}

impl MainMemory {
    fn new(name: impl Into<String>, latency: Tick, scheduler: Rc<RefCell<dyn EventQueue>>) -> Self {
        let name = name.into();
        Self {
            response_port: ResponsePort::new(format!("{name}.response_port")),
            name,
            latency,
            scheduler,
            backing: HashMap::new(),
        }
    }

    fn apply(&mut self, pkt: &mut Packet) {
        let block = self.backing.entry(pkt.address).or_insert_with(|| vec![0u8; pkt.size as usize]);
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

impl ResponsePortOwner for MainMemory {
    fn recv_timing_req(&mut self, mut pkt: Packet, now: Tick) -> Result<(), Packet> {
        self.apply(&mut pkt);
        let reply_tick = now + self.latency;
        let peer = self.response_port.peer_handle();
        let name = self.name.clone();
        self.scheduler.borrow_mut().schedule(
            reply_tick,
            Box::new(move |tick| {
                if !peer.borrow_mut().recv_timing_resp(pkt, tick) {
                    log::warn!("{name}: downstream cache dropped a fill it never asked to be retried for");
                }
            }),
        );
        Ok(())
    }

    fn recv_atomic_req(&mut self, pkt: &mut Packet, _now: Tick) -> Tick {
        self.apply(pkt);
        self.latency
    }

    fn recv_functional_req(&mut self, pkt: &mut Packet) {
        self.apply(pkt);
    }

    fn recv_retry_resp(&mut self, _now: Tick) {}
}

fn advance_until(cpu: &Rc<RefCell<TimingCpu>>, scheduler: &Rc<RefCell<dyn EventQueue>>, mut tick: Tick, done: impl Fn(CpuState) -> bool) -> Tick {
    while !done(cpu.borrow().state()) {
        tick += 1;
        scheduler.borrow_mut().service_until(tick);
    }
    tick
}

/// Drives the CPU through a synthetic fetch/execute stream: one instruction
/// fetch per iteration, with an interleaved load or store every few
/// instructions, waiting out each access's full timing round trip before
/// issuing the next.
fn run_instruction_stream(cpu: &Rc<RefCell<TimingCpu>>, scheduler: &Rc<RefCell<dyn EventQueue>>, options: &Options) {
    let mut tick: Tick = 0;
    let mut data_offset: Address = 0;

    for i in 0..options.instructions {
        tick = advance_until(cpu, scheduler, tick, |s| s == CpuState::Running);
        cpu.borrow_mut().fetch(tick).expect("identity translation never faults");
        tick = advance_until(cpu, scheduler, tick, |s| {
            !matches!(s, CpuState::IcacheWaitResponse | CpuState::IcacheRetry)
        });

        if options.data_access_every > 0 && (i + 1) % options.data_access_every == 0 {
            let is_write = (i / options.data_access_every) % 2 == 1;
            let data = is_write.then(|| vec![(i & 0xFF) as u8; 4]);
            cpu.borrow_mut()
                .issue_data_access(0x8000 + data_offset, 4, is_write, data, false, tick)
                .expect("identity translation never faults");
            tick = advance_until(cpu, scheduler, tick, |s| {
                !matches!(s, CpuState::DcacheWaitResponse | CpuState::DcacheRetry)
            });
            data_offset = (data_offset + 4) % options.working_set.max(4);
        }
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let options = Options::parse();
    if options.debug > 0 && std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "debug");
    }
    cachesim_core::init_logging();

    let start = Instant::now();

    let geometry = CacheGeometry {
        block_size: options.block_size,
        assoc: options.assoc,
        n_sets: options.n_sets,
        mshr_capacity: options.mshr_capacity,
        writeback_capacity: options.writeback_capacity,
        hit_latency: options.hit_latency,
        response_latency: options.response_latency,
    };

    let scheduler: Rc<RefCell<dyn EventQueue>> = Rc::new(RefCell::new(DeterministicQueue::new()));

    let icache = Rc::new(RefCell::new(Cache::new(
        "icache",
        geometry,
        CacheMode::Timing,
        0,
        Box::new(NullCoherence),
        Box::new(NullPrefetcher),
        Rc::clone(&scheduler),
    )));
    let dcache = Rc::new(RefCell::new(Cache::new(
        "dcache",
        geometry,
        CacheMode::Timing,
        1,
        coherence_driver(options.coherence.into()),
        Box::new(NullPrefetcher),
        Rc::clone(&scheduler),
    )));

    let icache_mem = Rc::new(RefCell::new(MainMemory::new("icache.mem", options.memory_latency, Rc::clone(&scheduler))));
    let dcache_mem = Rc::new(RefCell::new(MainMemory::new("dcache.mem", options.memory_latency, Rc::clone(&scheduler))));

    let cpu = Rc::new(RefCell::new(TimingCpu::new(
        "cpu0",
        0,
        2,
        0x1000,
        Box::new(IdentityTranslation),
        Rc::clone(&scheduler),
    )));

    cpu.borrow_mut().icache_port.connect(Rc::clone(&icache) as Rc<RefCell<dyn ResponsePortOwner>>);
    cpu.borrow_mut().dcache_port.connect(Rc::clone(&dcache) as Rc<RefCell<dyn ResponsePortOwner>>);
    icache
        .borrow_mut()
        .cpu_side
        .connect(Rc::new(RefCell::new(IcacheEndpoint(Rc::clone(&cpu)))) as Rc<RefCell<dyn RequestPortOwner>>);
    dcache
        .borrow_mut()
        .cpu_side
        .connect(Rc::new(RefCell::new(DcacheEndpoint(Rc::clone(&cpu)))) as Rc<RefCell<dyn RequestPortOwner>>);
    icache.borrow_mut().mem_side.connect(Rc::clone(&icache_mem) as Rc<RefCell<dyn ResponsePortOwner>>);
    dcache.borrow_mut().mem_side.connect(Rc::clone(&dcache_mem) as Rc<RefCell<dyn ResponsePortOwner>>);
    icache_mem.borrow_mut().response_port.connect(Rc::clone(&icache) as Rc<RefCell<dyn RequestPortOwner>>);
    dcache_mem.borrow_mut().response_port.connect(Rc::clone(&dcache) as Rc<RefCell<dyn RequestPortOwner>>);

    cpu.borrow_mut().start();
    run_instruction_stream(&cpu, &scheduler, &options);

    let icache_stats = icache.borrow().stats.clone();
    let dcache_stats = dcache.borrow().stats.clone();
    eprintln!(
        "completed {} instructions in {:?} ({} simulated ticks)",
        options.instructions,
        start.elapsed(),
        scheduler.borrow().current_tick()
    );
    eprintln!("ICACHE: {}", &*icache_stats.lock().unwrap());
    eprintln!("DCACHE: {}", &*dcache_stats.lock().unwrap());

    if let Some(path) = options.stats_out_file.as_ref() {
        let combined = serde_json::json!({
            "icache": &*icache_stats.lock().unwrap(),
            "dcache": &*dcache_stats.lock().unwrap(),
        });
        std::fs::write(path, serde_json::to_string_pretty(&combined)?)?;
    }

    Ok(())
}
