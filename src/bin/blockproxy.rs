//! blockproxy - identifier-multiplex proxy for blocksync
//!
//! Target mode accepts one connection per declared identifier on a single
//! listening port and bridges each to a freshly launched `blocksync --target`
//! bound to the file the environment maps the identifier to. Source mode
//! relays one locally accepted sync connection to the proxy target, sending
//! the identifier first. Either way the control file is touched on exit so
//! an orchestrator can watch for completion.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use log::{error, info};

use blocksync::error::SyncError;
use blocksync::protocol::valid_block_size;
use blocksync::proxy::{ProxyClient, ProxyServer};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Multiplex several blocksync sessions over one listening port, keyed by identifier"
)]
#[command(group = ArgGroup::new("role").required(true).args(["source", "target"]))]
struct Args {
    /// Run as the source (sending) side
    #[arg(long)]
    source: bool,

    /// Run as the target (receiving) side
    #[arg(long)]
    target: bool,

    /// Session identifier; repeatable in target mode, exactly one in source mode
    #[arg(long = "identifier", required = true)]
    identifiers: Vec<String>,

    /// Address of the proxy target, source mode only
    #[arg(long, required_if_eq("source", "true"))]
    target_address: Option<String>,

    /// Port to listen on
    #[arg(long, default_value_t = 9080)]
    listen_port: u16,

    /// Proxy target port to connect to, source mode only
    #[arg(long, default_value_t = 9000)]
    target_port: u16,

    /// Path to the blocksync binary, target mode only
    #[arg(long, default_value = "/blocksync")]
    blocksync_path: PathBuf,

    /// Block size passed to backend servers, must be a positive multiple of 4096
    #[arg(long, default_value_t = blocksync::protocol::DEFAULT_BLOCK_SIZE, value_parser = parse_block_size)]
    block_size: u64,

    /// File to create when the proxy exits
    #[arg(long, required = true)]
    control_file: PathBuf,
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
    let outcome = run(&args);

    info!("writing control file {}", args.control_file.display());
    if let Err(e) = create_control_file(&args.control_file) {
        error!("unable to create control file: {e:#}");
    }

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("proxy failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    if args.source {
        let [identifier] = args.identifiers.as_slice() else {
            bail!("exactly one identifier must be specified in source mode");
        };
        let Some(target_address) = args.target_address.as_deref() else {
            bail!("target-address must be specified in source mode");
        };
        ProxyClient::new(args.listen_port, args.target_port, target_address)
            .connect_to_target(identifier)
    } else {
        ProxyServer::new(
            &args.blocksync_path,
            args.block_size,
            args.listen_port,
            args.identifiers.clone(),
        )
        .start()
    }
}

fn create_control_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    Ok(())
}
