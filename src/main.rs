//! Process entry point: parse arguments, open the backend, build buffer pools, pin
//! and start the dispatcher and shard threads.

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use microquanta::backend::{self, KvBackend, RocksBackend};
use microquanta::config::{Cli, Tunables};
use microquanta::coro::Slot;
use microquanta::cycles::{self, TscCalibration};
use microquanta::dispatcher::Dispatcher;
use microquanta::error::AppError;
use microquanta::iosub::{IfaceInfo, MockNic};
use microquanta::pool::BufferPool;
use microquanta::preemption::QuantumTimer;
use microquanta::priority::ShardQueue;
use microquanta::ring::spsc;
use microquanta::scheduler::Shard;
use microquanta::shard::ShardEntry;
use microquanta::wire::MacAddr;

fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if !cli.substrate_args.is_empty() {
        info!(
            args = ?cli.substrate_args,
            "kernel-bypass substrate arguments received (no real substrate wired in this build)"
        );
    }

    let tunables = Tunables::DEFAULT;
    let num_shards = cli.shards.max(1);

    let rx_pool = BufferPool::new(
        "rx",
        tunables.rx_pool_size,
        num_shards,
        tunables.dispatch_ring_size as usize
            + tunables.coroutines_per_shard
            + tunables.reconcile_burst as usize,
    )?;
    let tx_pool = BufferPool::new(
        "tx",
        tunables.tx_pool_size,
        num_shards,
        tunables.coroutines_per_shard + tunables.tx_batch_size,
    )?;

    info!(path = backend::DB_PATH, "opening key-value backend");
    let backend: Arc<dyn KvBackend> = Arc::new(RocksBackend::open(backend::DB_PATH)?);

    let my_mac = MacAddr([0; 6]);
    let iface = IfaceInfo {
        mac: my_mac,
        ipv4: u32::from(cli.local_ipv4),
    };
    let nic = MockNic::new(iface, num_shards);

    let mut shard_entries = Vec::with_capacity(num_shards);
    let mut shard_handles = Vec::with_capacity(num_shards);

    for id in 0..num_shards {
        let (dispatch_p, dispatch_c) = spsc(tunables.dispatch_ring_size);
        let (return_p, return_c) = spsc(tunables.return_ring_size);
        shard_entries.push(ShardEntry::new(id as u32, dispatch_p, return_c));

        let slots = (0..tunables.coroutines_per_shard)
            .map(|i| Slot::new(i as u32, corosensei::stack::DefaultStack::new(tunables.stack_size).unwrap()))
            .collect();

        let shard = Shard::new(
            id as u32,
            dispatch_c,
            return_p,
            nic.tx_handle(id),
            tx_pool.clone(),
            backend.clone(),
            slots,
            iface,
            tunables,
        );

        let base_cpu = tunables.base_cpu;
        shard_handles.push(std::thread::spawn(move || {
            run_shard(shard, base_cpu + 1 + id, tunables);
        }));
    }

    let queue = ShardQueue::new(shard_entries);
    let mut dispatcher = Dispatcher::new(nic.rx_handle(), queue, rx_pool);

    cycles::pin_to_cpu(tunables.base_cpu)?;
    info!(num_shards, "dispatcher running");
    loop {
        dispatcher.poll_and_dispatch();
    }
}

fn run_shard<T: microquanta::iosub::TxSubstrate>(mut shard: Shard<T>, cpu: usize, tunables: Tunables) {
    if let Err(e) = cycles::pin_to_cpu(cpu) {
        tracing::error!(cpu, error = %e, "failed to pin shard thread, running unpinned");
    }

    let calibration = TscCalibration::measure();
    let _timer = QuantumTimer::install(tunables.quantum_cycles, calibration)
        .expect("failed to install quantum timer");

    info!(shard = shard.id(), cpu, "shard running");
    loop {
        shard.run_once();
    }
}
