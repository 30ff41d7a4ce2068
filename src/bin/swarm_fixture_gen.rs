use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use rust_swarm::download::hash_tree::{ContentHash, HashTree, suggested_chunk_size};

#[derive(Serialize)]
struct SwarmFixture {
    file_name: String,
    file_size: u64,
    content_urn: String,
    chunk_size: u64,
    tree_root_hex: String,
    leaves_hex: Vec<String>,
}

fn fixture_for_path(path: &Path) -> Result<SwarmFixture> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to read metadata for {}", path.display()))?;
    if !metadata.is_file() {
        anyhow::bail!("not a regular file: {}", path.display());
    }

    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let chunk_size = suggested_chunk_size(bytes.len() as u64);
    let tree = HashTree::build(&bytes, chunk_size)
        .with_context(|| format!("failed to build hash tree for {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| path.display().to_string());

    Ok(SwarmFixture {
        file_name,
        file_size: metadata.len(),
        content_urn: ContentHash::digest(&bytes).to_urn(),
        chunk_size: tree.chunk_size(),
        tree_root_hex: tree.root_hex(),
        leaves_hex: tree.leaves_hex(),
    })
}

fn run(args: Vec<OsString>) -> Result<()> {
    if args.is_empty() {
        anyhow::bail!("usage: cargo run --quiet --bin swarm_fixture_gen -- <file> [<file>...]");
    }

    let mut fixtures = Vec::with_capacity(args.len());
    for arg in args {
        fixtures.push(fixture_for_path(Path::new(&arg))?);
    }

    println!("{}", serde_json::to_string_pretty(&fixtures)?);
    Ok(())
}

fn main() -> Result<()> {
    run(env::args_os().skip(1).collect())
}
