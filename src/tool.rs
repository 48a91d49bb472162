// Copyright (c) 2024-present, edspine
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! CLI tool for inspecting a block-store file.
//!
//! A deliberately small, non-interactive subset of the teacher's REPL shell
//! (`lsm`'s `tool.rs`): one-shot subcommands rather than a readline loop,
//! since a block file has no query language to script against.

use clap::{Parser, Subcommand};
use edspine::block_store::{BlockFile, BlockFileConfig, BlockId};
use humansize::{SizeFormatter, BINARY};

#[derive(Parser)]
#[command(name = "edspine-cli", about = "Inspect and exercise an edspine block-store file")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the file if missing and report its root pointers.
    Init {
        path: String,
        #[arg(long, default_value = "edsp0001")]
        version: String,
    },
    /// Allocate one new block and print its id.
    New { path: String },
    /// Prepend `id` to the free list.
    Free { path: String, id: u32 },
    /// List every block id currently on the free list.
    FreeList { path: String },
    /// Print `(free, last)` root pointers and the on-disk file size.
    Stat { path: String },
}

fn version_tag(s: &str) -> [u8; 8] {
    let mut tag = [0u8; 8];
    let bytes = s.as_bytes();
    let len = bytes.len().min(8);
    tag[..len].copy_from_slice(&bytes[..len]);
    tag
}

fn open(path: &str, version: &str) -> edspine::Result<BlockFile> {
    BlockFile::open(path, version_tag(version), BlockFileConfig::default())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Init { path, version } => open(&path, &version).map(|bf| {
            let (free, last) = bf.root_pointers();
            println!("initialized {} (free={free}, last={last})", bf.path().display());
        }),
        Command::New { path } => open(&path, "edsp0001").and_then(|bf| {
            let guard = bf.new_block()?;
            let id = guard.id();
            drop(guard);
            bf.sync()?;
            println!("{id}");
            Ok(())
        }),
        Command::Free { path, id } => open(&path, "edsp0001").and_then(|bf| {
            bf.free_block(BlockId(id))?;
            bf.sync()?;
            println!("freed {}", BlockId(id));
            Ok(())
        }),
        Command::FreeList { path } => open(&path, "edsp0001").and_then(|bf| {
            for id in bf.free_list()? {
                println!("{id}");
            }
            Ok(())
        }),
        Command::Stat { path } => open(&path, "edsp0001").and_then(|bf| {
            let (free, last) = bf.root_pointers();
            let size = std::fs::metadata(bf.path())?.len();
            println!("free={free} last={last} size={}", SizeFormatter::new(size, BINARY));
            Ok(())
        }),
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
