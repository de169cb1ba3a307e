//! Build-time knobs and the command-line surface.
//!
//! Every tunable is a compile-time constant and stays one here — this struct exists
//! to collect them behind one name rather than to make them runtime-configurable, so
//! a future runtime-configurable edition has a single seam to change.

use clap::Parser;

/// All compile-time tunables in one place.
#[derive(Debug, Copy, Clone)]
pub struct Tunables {
    /// Cycles per preemption quantum (`QUANTUM_CYCLE`, default 1000).
    pub quantum_cycles: u64,
    /// First CPU id used for pinning; the dispatcher takes `base_cpu`, worker *i*
    /// takes `base_cpu + 1 + i`.
    pub base_cpu: usize,
    /// RX buffer pool size (`P_rx`).
    pub rx_pool_size: usize,
    /// TX buffer pool size (`P_tx`).
    pub tx_pool_size: usize,
    /// Per-core RX allocation cache size (`C_rx`) — advisory only; this crate
    /// doesn't model the driver's per-core cache, see `pool.rs`.
    pub rx_cache_size: usize,
    /// Per-core TX allocation cache size (`C_tx`).
    pub tx_cache_size: usize,
    /// Dispatch ring capacity per shard (`D_ring`), must be a power of two.
    pub dispatch_ring_size: u32,
    /// Return ring capacity per shard, must be a power of two.
    pub return_ring_size: u32,
    /// Coroutines pooled per shard (`K`).
    pub coroutines_per_shard: usize,
    /// Coroutine stack size in bytes (`STACK_SIZE`).
    pub stack_size: usize,
    /// Dispatcher non-blocking RX burst size (`B_rx`).
    pub dispatch_rx_burst: usize,
    /// Dispatcher return-ring drain burst size during reconcile (`R_ret`).
    pub reconcile_burst: u32,
    /// Shard dispatch-dequeue pacing period, in quanta (`D_dq`).
    pub dispatch_dequeue_period: u32,
    /// Shard dispatch-dequeue burst size (`B_dq`).
    pub dispatch_dequeue_burst: usize,
    /// Shard TX batch size (`B_tx`).
    pub tx_batch_size: usize,
    /// UDP service port (default 8001).
    pub server_port: u16,
}

impl Tunables {
    pub const DEFAULT: Tunables = Tunables {
        quantum_cycles: 1000,
        base_cpu: 0,
        rx_pool_size: 32767,
        tx_pool_size: 8191,
        rx_cache_size: 250,
        tx_cache_size: 250,
        dispatch_ring_size: 256,
        return_ring_size: 512,
        coroutines_per_shard: 64,
        stack_size: crate::coro::STACK_SIZE,
        dispatch_rx_burst: 32,
        reconcile_burst: 8,
        dispatch_dequeue_period: 8,
        dispatch_dequeue_burst: 4,
        tx_batch_size: 4,
        server_port: 8001,
    };
}

/// Command-line surface: `<program> <local-ipv4>`. Additional kernel-bypass runtime
/// arguments follow a `--` separator and are consumed by the I/O substrate
/// initializer, unparsed by this crate.
#[derive(Debug, Parser)]
#[command(name = "microquantad", version, about)]
pub struct Cli {
    /// The local IPv4 address this process binds its service to.
    pub local_ipv4: std::net::Ipv4Addr,

    /// Number of shard (worker) threads to start.
    #[arg(long, default_value_t = 1)]
    pub shards: usize,

    /// Opaque arguments for the kernel-bypass I/O substrate initializer, passed
    /// through unparsed after `--`.
    #[arg(last = true)]
    pub substrate_args: Vec<String>,
}
