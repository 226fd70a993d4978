//! StripeStore I/O bench
//!
//! Creates a set of file-backed disks, writes random containers to them a
//! stripe at a time, reads every container back and checks it. Throughput
//! for both passes is logged at the end.

use anyhow::{Context, Result, bail};
use clap::Parser;
use rand::RngCore;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stripestore_common::{AddressingMode, ContainerId, DiskId, DiskRole, Lba, StorageConfig};
use stripestore_storage::{
    AlignedBuffer, BlockEngine, ContainerRead, ContainerWrite, DiskDescriptor, DiskRegistry,
    FileTraceSink, RawFile,
};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stripestore-io-bench")]
#[command(about = "Write and verify striped containers on file-backed disks")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "stripestore.toml")]
    config: PathBuf,

    /// Directory holding the disk image files
    #[arg(short, long, default_value = "./stripestore-bench")]
    dir: PathBuf,

    /// Number of disks (overrides `storage.num_disks`)
    #[arg(long)]
    disks: Option<u32>,

    /// Containers to write
    #[arg(long, default_value = "64")]
    containers: u32,

    /// Size of each disk in blocks
    #[arg(long, default_value = "65536")]
    disk_blocks: u64,

    /// Allocate from the free list instead of direct mapping
    #[arg(long)]
    free_list: bool,

    /// Stripe worker threads (overrides `storage.num_threads`)
    #[arg(long)]
    threads: Option<usize>,

    /// Open disks without O_DIRECT / F_NOCACHE
    #[arg(long)]
    buffered: bool,

    /// Write an I/O trace to this file
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Default)]
struct LoggingConfig {
    #[serde(default)]
    level: Option<String>,
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&config_str).with_context(|| format!("failed to parse {}", path.display()))
}

fn create_disks(dir: &Path, config: &StorageConfig, disk_blocks: u64) -> Result<Vec<DiskDescriptor>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    (0..config.num_disks)
        .map(|id| {
            let path = dir.join(format!("disk{id}.img"));
            let file = RawFile::create(&path, disk_blocks * config.block_size, config.direct_io)
                .with_context(|| format!("failed to create disk image {}", path.display()))?;
            Ok(DiskDescriptor::new(id, disk_blocks, DiskRole::Data, file))
        })
        .collect()
}

/// Disk for each container of the stripe starting at `first`
fn stripe_disks(engine: &BlockEngine, first: ContainerId, width: u32) -> Result<Vec<DiskId>> {
    if engine.addressing_mode() == AddressingMode::Direct {
        return Ok((first..first + width)
            .filter_map(|c| engine.locate(c).map(|loc| loc.disk))
            .collect());
    }

    let disks = engine.select_disks(width as usize, DiskRole::Data, &HashSet::new());
    if disks.len() < width as usize {
        bail!("only {} of {} disks available for a stripe", disks.len(), width);
    }
    Ok(disks)
}

#[allow(clippy::cast_precision_loss)]
fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    bytes as f64 / 1024.0 / 1024.0 / elapsed.as_secs_f64().max(f64::EPSILON)
}

#[allow(clippy::cast_possible_truncation)]
fn main() -> Result<()> {
    let args = Args::parse();
    let file_config = load_config(&args.config)?;

    // CLI takes precedence over the config file
    let mut config = file_config.storage;
    if let Some(disks) = args.disks {
        config.num_disks = disks;
    }
    if let Some(threads) = args.threads {
        config.num_threads = threads;
    }
    if args.free_list {
        config.addressing = AddressingMode::FreeList;
    }
    if args.buffered {
        config.direct_io = false;
    }
    let log_level = if args.log_level == "info" {
        file_config.logging.level.unwrap_or(args.log_level)
    } else {
        args.log_level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;
    let per_disk = u64::from(args.containers.div_ceil(config.num_disks));
    if per_disk * config.blocks_per_container > args.disk_blocks {
        bail!(
            "{} containers do not fit on {} disks of {} blocks",
            args.containers,
            config.num_disks,
            args.disk_blocks
        );
    }

    info!("Starting StripeStore I/O bench");
    info!("Disk directory: {}", args.dir.display());
    info!(
        "{} disks of {} blocks, {} byte blocks, {} blocks per container ({} reserved)",
        config.num_disks,
        args.disk_blocks,
        config.block_size,
        config.blocks_per_container,
        config.reserved_blocks_per_container
    );
    info!(
        "Addressing: {:?}, direct I/O: {}, threads: {}",
        config.addressing, config.direct_io, config.num_threads
    );

    let disks = create_disks(&args.dir, &config, args.disk_blocks)?;
    let config = Arc::new(config);
    let registry = Arc::new(DiskRegistry::new(disks, &config));

    let mut engine = BlockEngine::new(Arc::clone(&registry), Arc::clone(&config));
    let trace = match &args.trace {
        Some(path) => {
            let sink = Arc::new(FileTraceSink::create(path)?);
            engine = engine.with_trace(sink.clone());
            info!("Tracing I/O to {}", path.display());
            Some(sink)
        }
        None => None,
    };

    let width = config.num_disks;
    let container_size = config.container_size() as usize;
    let payloads: Vec<AlignedBuffer> = (0..args.containers)
        .map(|_| {
            let mut buf = AlignedBuffer::new(container_size);
            rand::thread_rng().fill_bytes(&mut buf);
            buf
        })
        .collect();

    // Write pass
    let mut placed: Vec<(DiskId, Lba)> = Vec::with_capacity(payloads.len());
    let start = Instant::now();
    for (stripe, chunk) in payloads.chunks(width as usize).enumerate() {
        let first = stripe as ContainerId * width;
        let disks = stripe_disks(&engine, first, width)?;
        let writes: Vec<ContainerWrite<'_>> = chunk
            .iter()
            .zip(&disks)
            .enumerate()
            .map(|(i, (buf, &disk))| ContainerWrite {
                disk,
                container: first + i as ContainerId,
                buf,
            })
            .collect();

        for (write, result) in writes.iter().zip(engine.write_stripe(&writes)) {
            let lba = result
                .with_context(|| format!("write of container {} failed", write.container))?
                .with_context(|| format!("container {} was not placed", write.container))?;
            debug!("Container {} at disk {} LBA {}", write.container, write.disk, lba);
            placed.push((write.disk, lba));
        }
    }
    registry.sync_all()?;
    let write_elapsed = start.elapsed();

    // Read-back pass
    let mut read_bufs: Vec<AlignedBuffer> = (0..payloads.len())
        .map(|_| AlignedBuffer::new(container_size))
        .collect();
    let start = Instant::now();
    for (bufs, locations) in read_bufs
        .chunks_mut(width as usize)
        .zip(placed.chunks(width as usize))
    {
        let mut reads: Vec<ContainerRead<'_>> = bufs
            .iter_mut()
            .zip(locations)
            .map(|(buf, &(disk, lba))| ContainerRead { disk, lba, buf })
            .collect();
        for (result, &(disk, lba)) in engine.read_stripe(&mut reads).into_iter().zip(locations) {
            result.with_context(|| format!("read of disk {disk} LBA {lba} failed"))?;
        }
    }
    let read_elapsed = start.elapsed();

    let mismatches = payloads
        .iter()
        .zip(&read_bufs)
        .enumerate()
        .filter(|(_, (written, read))| written[..] != read[..])
        .inspect(|(container, _)| warn!("Container {} read back differently", container))
        .count();
    if mismatches > 0 {
        bail!("{mismatches} of {} containers failed verification", payloads.len());
    }

    if let Some(sink) = trace {
        sink.flush()?;
    }

    let total = config.container_size() * u64::from(args.containers);
    info!(
        "Wrote {} containers in {:?} ({:.1} MB/s)",
        args.containers,
        write_elapsed,
        throughput(total, write_elapsed)
    );
    info!(
        "Read back {} containers in {:?} ({:.1} MB/s)",
        args.containers,
        read_elapsed,
        throughput(total, read_elapsed)
    );
    for info in registry.iter() {
        let usage = registry.usage(info.id);
        info!(
            "Disk {}: {} blocks allocated, {} bytes remaining",
            info.id, usage.allocated_blocks, usage.remaining
        );
    }

    Ok(())
}
