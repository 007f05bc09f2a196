//! blocksync - In-Place Binary File Delta Synchronization

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blocksync::cli::{Cli, Commands, HashArgs, SyncArgs};
use blocksync::progress::{byte_bar, print_sync_summary, track_task};
use blocksync::{
    file, manifest::suggested_block_size, patcher, HashTask, Manifest, ResolveTask, StreamFile,
};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    match cli.command {
        Commands::Hash(args) => run_hash(args),
        Commands::Sync(args) => run_sync(args),
    }
}

fn init_tracing(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => EnvFilter::new("blocksync=warn"),
        1 => EnvFilter::new("blocksync=info"),
        2 => EnvFilter::new("blocksync=debug"),
        _ => EnvFilter::new("trace"),
    };

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn run_hash(args: HashArgs) -> anyhow::Result<()> {
    let file_size = file::file_size_of(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let block_size = if args.block_size == 0 {
        suggested_block_size(file_size)
    } else {
        args.block_size as usize
    };

    tracing::info!(
        input = %args.input.display(),
        file_size,
        block_size,
        "hashing"
    );

    let task = HashTask::spawn_path(&args.input, block_size, args.jobs)?;
    let bar = byte_bar(args.progress, file_size, "hashing");
    track_task(&bar, task.state());
    let manifest = task.result()?;

    let output = args.output_path();
    manifest
        .write_to(&output)
        .with_context(|| format!("writing {}", output.display()))?;

    println!(
        "{}: {} blocks of {} bytes -> {}",
        args.input.display(),
        manifest.block_count(),
        block_size,
        output.display()
    );
    Ok(())
}

fn run_sync(args: SyncArgs) -> anyhow::Result<()> {
    let manifest_path = args.manifest_path();
    let manifest = Manifest::read_from(&manifest_path)
        .with_context(|| format!("reading {}", manifest_path.display()))?;
    let block_size = manifest.block_size;

    tracing::info!(
        local = %args.local.display(),
        remote = %args.remote.display(),
        file_size = manifest.file_size,
        block_size,
        "syncing"
    );

    file::ensure_exists(&args.local)?;
    let resolve = ResolveTask::spawn_path(&args.local, block_size, &manifest, args.jobs)?;
    let bar = byte_bar(args.progress, resolve.state().bytes_total(), "resolving");
    track_task(&bar, resolve.state());
    let mut delta = resolve.result()?;

    tracing::info!(
        blocks = delta.len(),
        in_place = delta.done_count(),
        downloads = delta.download_count(),
        "delta resolved"
    );

    let mut remote = StreamFile::open_readonly(&args.remote)
        .with_context(|| format!("opening {}", args.remote.display()))?;

    let patch_bar = byte_bar(args.progress, manifest.file_size, "patching");
    let stats = patcher::patch_path(
        &args.local,
        manifest.file_size,
        block_size,
        &mut delta,
        |block_index, block_size| {
            remote.read_at_most(block_index * block_size as i64, block_size)
        },
        |_, done, _| {
            patch_bar.set_position(done.max(0) as u64);
            true
        },
    )?;
    patch_bar.finish_and_clear();

    print_sync_summary(&stats, manifest.file_size);
    Ok(())
}
