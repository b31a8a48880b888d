//! vmdkio CLI - inspect and extract VMware VMDK images.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use vmdkio_core::descriptor::parse_descriptor;
use vmdkio_core::image::{ExtentKind, VmdkImage};
use vmdkio_core::io::{FilePool, IoPool, MmapPool};
use vmdkio_core::sparse::{Compression, SparseHeader, COWD_SIGNATURE, VMDK_SIGNATURE};

/// Read VMware VMDK images: show their structure or extract the raw disk.
#[derive(Parser)]
#[command(name = "vmdkio")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Memory-map the extent files instead of using positioned reads.
    #[arg(long, global = true)]
    mmap: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display header, geometry and extent information about an image.
    Info {
        /// Path to a sparse extent file or a descriptor file.
        image: PathBuf,
    },

    /// Write the whole virtual disk to a raw file.
    Dump {
        /// Path to a sparse extent file or a descriptor file.
        image: PathBuf,

        /// Output raw file path.
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Info { image } => show_info(&image, cli.mmap),
        Commands::Dump { image, output } => dump(&image, &output, cli.mmap),
    }
}

fn make_pool(paths: &[PathBuf], mmap: bool) -> Result<Box<dyn IoPool>> {
    Ok(if mmap {
        Box::new(MmapPool::from_paths(paths)?)
    } else {
        Box::new(FilePool::from_paths(paths)?)
    })
}

/// Open an image from either a sparse extent file (detected by signature)
/// or a descriptor file whose extent paths resolve relative to it.
fn open_image(path: &Path, mmap: bool) -> Result<VmdkImage> {
    let mut magic = [0u8; 4];
    let n = File::open(path)
        .with_context(|| format!("cannot open {}", path.display()))?
        .read(&mut magic)
        .with_context(|| format!("cannot read {}", path.display()))?;

    if n == 4 && (magic == VMDK_SIGNATURE || magic == COWD_SIGNATURE) {
        debug!("{} is a sparse extent file", path.display());
        let pool = make_pool(&[path.to_path_buf()], mmap)?;
        return Ok(VmdkImage::open_single(pool)?);
    }

    debug!("{} is not a sparse extent; parsing as descriptor", path.display());
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read descriptor {}", path.display()))?;
    let descriptor = parse_descriptor(&text)?;
    if descriptor.extents.is_empty() {
        bail!("{} describes no extents", path.display());
    }
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    let paths: Vec<PathBuf> = descriptor
        .file_names()
        .iter()
        .map(|name| base.join(name))
        .collect();
    let layout = descriptor.to_layout()?;
    let pool = make_pool(&paths, mmap)?;
    Ok(VmdkImage::open(pool, &layout)?)
}

fn show_info(path: &Path, mmap: bool) -> Result<()> {
    let mut image = open_image(path, mmap)?;

    println!("VMDK image information:");
    println!("\tMedia size:\t\t{} bytes", image.size());
    println!("\tNumber of extents:\t{}", image.spans().len());

    if let Some(text) = image.descriptor_text()? {
        if let Ok(descriptor) = parse_descriptor(&text) {
            println!("\tDisk type:\t\t{}", descriptor.create_type);
            println!("\tContent identifier:\t{:#010x}", descriptor.cid);
        }
    }
    println!();

    for (index, span) in image.spans().iter().enumerate() {
        println!("Extent {}:", index);
        println!(
            "\tVirtual range:\t\t[{}, {})",
            span.v_start,
            span.v_start + span.v_len
        );
        let kind = match span.kind {
            ExtentKind::Sparse => "sparse",
            ExtentKind::Flat => "flat",
            ExtentKind::Zero => "zero",
        };
        println!("\tKind:\t\t\t{}", kind);
        if let Some((header, geometry)) = image.sparse_details(index) {
            let variant = match header {
                SparseHeader::Cowd(h) => format!("COWD version {}", h.version),
                SparseHeader::Vmdk(h) => format!("VMDK version {}", h.version),
            };
            println!("\tVariant:\t\t{}", variant);
            println!("\tGrain size:\t\t{} bytes", geometry.grain_size);
            println!("\tGrain table entries:\t{}", geometry.gt_entries);
            println!("\tGrain directories:\t{} entries", geometry.gd_entries);
            let compression = match geometry.compression {
                Compression::None => "none",
                Compression::Deflate => "deflate",
            };
            println!("\tCompression:\t\t{}", compression);
            if geometry.is_dirty {
                println!("\tDirty:\t\t\tyes (not cleanly closed)");
            }
        }
    }
    Ok(())
}

/// Chunk size for the dump copy loop.
const DUMP_CHUNK: usize = 1024 * 1024;

fn dump(path: &Path, output: &Path, mmap: bool) -> Result<()> {
    let mut image = open_image(path, mmap)?;
    let mut out = File::create(output)
        .with_context(|| format!("cannot create {}", output.display()))?;

    let bar = ProgressBar::new(image.size());
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        )?
        .progress_chars("#>-"),
    );

    let mut buf = vec![0u8; DUMP_CHUNK];
    let mut offset = 0u64;
    while offset < image.size() {
        let n = image.read_at(offset, &mut buf)?;
        out.write_all(&buf[..n])
            .with_context(|| format!("cannot write {}", output.display()))?;
        offset += n as u64;
        bar.inc(n as u64);
    }
    out.flush()
        .with_context(|| format!("cannot flush {}", output.display()))?;
    bar.finish();
    println!("wrote {} bytes to {}", offset, output.display());
    Ok(())
}
