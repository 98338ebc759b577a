//! The `fsck.mapfs` tool verifies the structural invariants of an image.
//!
//! Exit status 0 means the image is clean; 1 means findings were reported
//! or the image could not be opened.

use clap::Parser;
use mapfs::check::check_image;
use mapfs::Mapfs;
use std::path::PathBuf;
use std::process::exit;

/// Command line arguments.
#[derive(Parser)]
#[command(name = "fsck.mapfs", about = "Check a mapfs image for consistency")]
struct Args {
    /// Path to the image file.
    image: PathBuf,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let fs = Mapfs::open(&args.image).unwrap_or_else(|e| {
        eprintln!("fsck.mapfs: {}: {e}", args.image.display());
        exit(1);
    });

    let findings = check_image(&fs);
    if findings.is_empty() {
        println!("{}: clean", args.image.display());
        return;
    }
    for finding in &findings {
        eprintln!("fsck.mapfs: {finding}");
    }
    eprintln!(
        "fsck.mapfs: {}: {} problem(s) found",
        args.image.display(),
        findings.len()
    );
    exit(1);
}
