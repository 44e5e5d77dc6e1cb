//! Pcapmap CLI

use std::path::Path;
use std::process;

use anyhow::{bail, Context};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pcapmap::config::StorageConfig;
use pcapmap::registry::EngineRegistry;
use pcapmap::storage::{Packets, FILE_HEADER_SIZE};
use pcapmap::PcapMapError;

fn usage() -> ! {
    eprintln!("Pcapmap v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: pcapmap <command> [options]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  stats <file> [config.toml]          Count records in a capture file");
    eprintln!("  copy <in> <out> [config.toml]       Rewrite a capture through the configured engine");
    eprintln!("  engines                             List storage engines");
    process::exit(1);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        usage();
    }

    if let Err(e) = run(&args[1], &args[2..]) {
        // Fatal storage errors leave a mapping in an unknown state; stop hard.
        if let Some(storage_error) = e.downcast_ref::<PcapMapError>() {
            if storage_error.is_fatal() {
                error!("Fatal storage error: {e:#}");
                process::exit(2);
            }
        }
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn run(command: &str, args: &[String]) -> anyhow::Result<()> {
    match (command, args) {
        ("stats", [file, rest @ ..]) => {
            let config = load_config(rest.first())?;
            stats(Path::new(file), &config)
        }
        ("copy", [input, output, rest @ ..]) => {
            let config = load_config(rest.first())?;
            copy(Path::new(input), Path::new(output), &config)
        }
        ("engines", []) => {
            for name in EngineRegistry::with_defaults().names() {
                println!("{name}");
            }
            Ok(())
        }
        ("stats" | "copy" | "engines", _) => usage(),
        _ => bail!("Unknown command: {command}. Run 'pcapmap' for usage information."),
    }
}

fn load_config(path: Option<&String>) -> anyhow::Result<StorageConfig> {
    match path {
        Some(path) => StorageConfig::from_file(Path::new(path))
            .with_context(|| format!("loading {path}")),
        None => Ok(StorageConfig::default()),
    }
}

fn stats(path: &Path, config: &StorageConfig) -> anyhow::Result<()> {
    let registry = EngineRegistry::with_defaults();
    let (storage, header) = registry.open(&config.engine, path, config.storage_options())?;

    let mut records = 0u64;
    let mut captured = 0u64;
    let mut original = 0u64;
    let mut failure = None;

    for packet in Packets::new(storage.as_ref()) {
        match packet {
            Ok(packet) => {
                records += 1;
                captured += u64::from(packet.header.caplen);
                original += u64::from(packet.header.len);
            }
            Err(e) => failure = Some(e),
        }
    }
    storage.prepare_close()?;

    println!("File:         {}", path.display());
    println!("Engine:       {}", storage.name());
    println!(
        "Format:       {}.{} ({:?} byte order)",
        header.version_major,
        header.version_minor,
        header.byte_order().unwrap_or(pcapmap::storage::ByteOrder::Native)
    );
    println!("Link type:    {}", header.linktype);
    println!("Snapshot len: {}", header.snaplen);
    println!("Records:      {records}");
    println!("Captured:     {captured} bytes");
    println!("On the wire:  {original} bytes");

    if let Some(e) = failure {
        warn!("Record stream ended early: {e}");
        return Err(e.into());
    }
    Ok(())
}

fn copy(input: &Path, output: &Path, config: &StorageConfig) -> anyhow::Result<()> {
    let registry = EngineRegistry::with_defaults();
    let (reader, _) = registry.open(&config.engine, input, config.storage_options())?;
    let writer = registry.create(&config.engine, output, config.storage_options())?;

    let mut records = 0u64;
    for packet in Packets::new(reader.as_ref()) {
        let packet = packet.with_context(|| format!("reading {}", input.display()))?;
        writer.write_record(&packet.header, &packet.data)?;
        records += 1;
    }

    reader.prepare_close()?;
    let size = writer.prepare_close()?;
    info!(
        "Copied {records} records ({} bytes of records) to {}",
        size - FILE_HEADER_SIZE as u64,
        output.display()
    );
    Ok(())
}
