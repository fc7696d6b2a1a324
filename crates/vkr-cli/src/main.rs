mod observers;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use vkr_core::{DeferPolicy, ReplayConfig, DEFAULT_CONFIG_PATH};
use vkr_replay::{AshDriver, NullDriver, ReplayDriver, ReplayStats, Replayer};
use vkr_trace::{EntryPoint, PacketFlags, PacketSource, PreloadedStore, TraceStore};

use observers::{JsonDump, Summary};

#[derive(Parser)]
#[command(name = "vkreplay")]
#[command(about = "vkreplay - replay captured Vulkan traces")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a trace file
    Replay(ReplayArgs),

    /// Show the trace header and per-call packet counts
    Info {
        /// Trace file
        trace: PathBuf,
    },
}

#[derive(Args)]
struct ReplayArgs {
    /// Trace file
    trace: PathBuf,

    /// Configuration file path [default: vkreplay.toml, if present]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// First frame of the looped range
    #[arg(long)]
    loop_start: Option<u64>,

    /// Last frame of the looped range (inclusive)
    #[arg(long)]
    loop_end: Option<u64>,

    /// How many times to replay the frame range
    #[arg(long)]
    loops: Option<u32>,

    /// Read the whole trace into memory first
    #[arg(long)]
    preload: bool,

    /// Replay every trace physical device on this GPU
    #[arg(long)]
    gpu: Option<u32>,

    /// Pass queue-family and memory-type indices through untranslated
    #[arg(long)]
    no_compat: bool,

    /// When to defer memory allocations: never, inexact or always
    #[arg(long)]
    defer: Option<DeferPolicy>,

    /// Accept dirty-page differential memory payloads
    #[arg(long)]
    dirty_page_diff: bool,

    /// Print a per-call summary when replay ends
    #[arg(long)]
    summary: bool,

    /// Write one JSON line per packet to this file ("-" for stdout)
    #[arg(long)]
    dump: Option<String>,

    /// Replay against the null driver (no GPU needed)
    #[arg(long)]
    dry_run: bool,
}

impl ReplayArgs {
    fn apply(&self, config: &mut ReplayConfig) {
        if let Some(start) = self.loop_start {
            config.frames.loop_start_frame = start;
        }
        if let Some(end) = self.loop_end {
            config.frames.loop_end_frame = end;
        }
        if let Some(loops) = self.loops {
            config.frames.num_loops = loops;
        }
        if self.preload {
            config.replay.preload = true;
        }
        if self.gpu.is_some() {
            config.replay.physical_device_index = self.gpu;
        }
        if self.no_compat {
            config.replay.compatibility_mode = false;
        }
        if let Some(defer) = self.defer {
            config.memory.defer_allocations = defer;
        }
        if self.dirty_page_diff {
            config.memory.dirty_page_diff = true;
        }
    }
}

fn main() -> anyhow::Result<()> {
    vkr_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay(args) => {
            let stats = replay(&args)?;
            info!(
                packets = stats.packets,
                frames = stats.frames,
                skipped = stats.skipped,
                "done"
            );
        }
        Commands::Info { trace } => print_info(&trace)?,
    }

    Ok(())
}

fn replay(args: &ReplayArgs) -> anyhow::Result<ReplayStats> {
    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate().context("invalid replay settings")?;

    let mut file = TraceStore::open(&args.trace)
        .with_context(|| format!("failed to open trace {}", args.trace.display()))?;
    let mut preloaded;
    let source: &mut dyn PacketSource = if config.replay.preload {
        preloaded = PreloadedStore::load(&mut file).context("failed to preload trace")?;
        info!(packets = preloaded.len(), "trace preloaded");
        &mut preloaded
    } else {
        &mut file
    };

    if args.dry_run {
        info!("dry run: replaying on the null driver");
        run(NullDriver::default(), &config, source, args)
    } else {
        let driver = AshDriver::new().context("cannot replay without a Vulkan loader (try --dry-run)")?;
        run(driver, &config, source, args)
    }
}

/// A file named on the command line must load; the default one is optional.
fn load_config(path: Option<&Path>) -> anyhow::Result<ReplayConfig> {
    match path {
        Some(path) => ReplayConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(ReplayConfig::load_or_default(DEFAULT_CONFIG_PATH)),
    }
}

fn run<D: ReplayDriver>(
    driver: D,
    config: &ReplayConfig,
    source: &mut dyn PacketSource,
    args: &ReplayArgs,
) -> anyhow::Result<ReplayStats> {
    let mut replayer = Replayer::new(driver, config);
    if args.summary {
        replayer.add_observer(Box::new(Summary::default()));
    }
    if let Some(target) = &args.dump {
        let out: Box<dyn Write> = if target == "-" {
            Box::new(io::stdout())
        } else {
            let file = File::create(target).with_context(|| format!("failed to create {target}"))?;
            Box::new(BufWriter::new(file))
        };
        replayer.add_observer(Box::new(JsonDump::new(out)));
    }
    Ok(replayer.run(source)?)
}

fn print_info(path: &Path) -> anyhow::Result<()> {
    let mut store = TraceStore::open(path)
        .with_context(|| format!("failed to open trace {}", path.display()))?;

    let header = store.header().clone();
    println!("Trace: {}", path.display());
    println!("  Format version: {}", header.version);
    println!("  Captured on:    {} / {}", header.os, header.arch);
    println!("  Pointer size:   {} bytes", header.pointer_size);
    println!("  GPUs:           {}", header.gpus.len());
    for (i, gpu) in header.gpus.iter().enumerate() {
        println!(
            "    [{}] vendor {:#06x} device {:#06x} driver {:#x}",
            i, gpu.vendor_id, gpu.device_id, gpu.driver_version
        );
    }

    let mut per_entry: BTreeMap<&'static str, u64> = BTreeMap::new();
    let mut packets = 0u64;
    let mut compressed = 0u64;
    let mut bytes = 0u64;
    let mut frames = 0u64;
    while let Some(packet) = store.next_packet()? {
        packets += 1;
        bytes += packet.header.size;
        if packet.header.flags.contains(PacketFlags::COMPRESSED) {
            compressed += 1;
        }
        if packet.entry_point().is_ok_and(EntryPoint::is_present) {
            frames += 1;
        }
        *per_entry.entry(packet.name()).or_default() += 1;
    }

    println!("  Packets:        {packets} ({compressed} compressed, {bytes} bytes)");
    println!("  Frames:         {frames}");
    println!();
    for (name, count) in &per_entry {
        println!("  {name:<44} {count:>9}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_config_must_exist() {
        let missing = std::env::temp_dir().join("vkreplay-no-such-config.toml");
        assert!(load_config(Some(&missing)).is_err());
    }

    #[test]
    fn test_explicit_config_must_parse() {
        let path = std::env::temp_dir().join(format!("vkreplay-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "[frames]\nnum_loops = \"twice\"\n").unwrap();
        let loaded = load_config(Some(&path));
        std::fs::remove_file(&path).unwrap();
        assert!(loaded.is_err());
    }

    #[test]
    fn test_explicit_config_is_used() {
        let path = std::env::temp_dir().join(format!("vkreplay-good-{}.toml", std::process::id()));
        std::fs::write(&path, "[memory]\ndefer_allocations = \"always\"\n").unwrap();
        let loaded = load_config(Some(&path));
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded.unwrap().memory.defer_allocations, DeferPolicy::Always);
    }
}
