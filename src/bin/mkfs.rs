//! The `mkfs.mapfs` tool formats an image file into a mapfs filesystem.
//!
//! The file must exist and its size must be a multiple of the 4096-byte
//! block size; the layout is computed from the requested number of inodes.

use clap::Parser;
use mapfs::image::Image;
use mapfs::layout::{BLOCK_SIZE, MAGIC};
use mapfs::Mapfs;
use std::path::PathBuf;
use std::process::exit;

/// Command line arguments.
#[derive(Parser)]
#[command(name = "mkfs.mapfs", about = "Format an image file into a mapfs filesystem")]
struct Args {
    /// Number of inodes.
    #[arg(short, long)]
    inodes: u32,
    /// Overwrite an existing mapfs filesystem.
    #[arg(short, long)]
    force: bool,
    /// Sync the mapping to disk before exiting.
    #[arg(short, long)]
    sync: bool,
    /// Zero out the image contents first.
    #[arg(short, long)]
    zero: bool,
    /// Path to the image file.
    image: PathBuf,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut image = Image::open(&args.image).unwrap_or_else(|e| {
        eprintln!("mkfs.mapfs: {}: {e}", args.image.display());
        exit(1);
    });

    if !args.force && image.read_at::<u64>(0) == MAGIC {
        eprintln!(
            "mkfs.mapfs: {} already contains a mapfs filesystem; use -f to overwrite",
            args.image.display()
        );
        exit(1);
    }
    if args.zero {
        let len = image.len();
        image.zero(0, len);
    }

    let fs = Mapfs::format(image, args.inodes).unwrap_or_else(|e| {
        eprintln!("mkfs.mapfs: failed to format the image: {e}");
        exit(1);
    });
    let sb = fs.superblock();
    log::info!(
        "formatted {}: {} blocks of {BLOCK_SIZE} bytes, {} inodes, {} data blocks",
        args.image.display(),
        sb.size / BLOCK_SIZE,
        sb.inodes_count,
        sb.blocks_count
    );

    if args.sync {
        if let Err(e) = fs.sync() {
            eprintln!("mkfs.mapfs: sync: {e}");
            exit(1);
        }
    }
}
