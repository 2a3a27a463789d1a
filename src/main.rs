//! blocksync - differential block-level file synchronization over TCP
//!
//! One binary, two roles: `--source` hashes a local file and streams changed
//! blocks to the target; `--target` serves one sync session and applies the
//! stream to its file. Block size must match on both sides.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{ArgGroup, Parser};
use log::{error, info};

use blocksync::client::SyncClient;
use blocksync::error::SyncError;
use blocksync::protocol::valid_block_size;
use blocksync::server::SyncServer;
use blocksync::SyncOptions;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Synchronize a block device or disk image to a remote target, moving only changed blocks"
)]
#[command(group = ArgGroup::new("role").required(true).args(["source", "target"]))]
struct Args {
    /// File or device to synchronize
    file: PathBuf,

    /// Run as the source (sending) side
    #[arg(long)]
    source: bool,

    /// Run as the target (receiving) side
    #[arg(long)]
    target: bool,

    /// Address of the target, source mode only
    #[arg(long, required_if_eq("source", "true"))]
    target_address: Option<String>,

    /// Port to listen on (target) or connect to (source)
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Block size, must be a positive multiple of 4096
    #[arg(long, default_value_t = blocksync::protocol::DEFAULT_BLOCK_SIZE, value_parser = parse_block_size)]
    block_size: u64,

    /// Write zeros instead of punching holes, target mode only
    #[arg(long)]
    preallocate: bool,
}

fn parse_block_size(arg: &str) -> Result<u64, String> {
    let size: u64 = arg
        .parse()
        .map_err(|_| format!("`{arg}` is not a number"))?;
    if !valid_block_size(size) {
        return Err(SyncError::InvalidBlockSize(size).to_string());
    }
    Ok(size)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("BLOCKSYNC_LOG", "info"),
    )
    .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => {
            info!("successfully completed sync");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("sync failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let opts = SyncOptions {
        block_size: args.block_size,
        preallocate: args.preallocate,
    };
    if args.source {
        let Some(target_address) = args.target_address.as_deref() else {
            anyhow::bail!("target-address must be specified in source mode");
        };
        let mut client = SyncClient::new(&args.file, target_address, args.port, &opts)?;
        client.connect_to_target()
    } else {
        SyncServer::new(&args.file, args.port, &opts).start()
    }
}
