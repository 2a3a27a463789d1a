use std::fs;
use std::io::Write;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use blocksync::client::{SyncClient, TcpConnectionProvider};
use blocksync::proxy::{ProxyClient, ProxyServer};
use blocksync::SyncOptions;

const BLOCK_SIZE: u64 = 4096;

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut f = fs::File::create(path)?;
    f.write_all(contents)?;
    Ok(())
}

fn patterned(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251 + 1) as u8).collect()
}

fn free_port() -> u16 {
    let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = sock.local_addr().unwrap().port();
    drop(sock);
    port
}

/// Full chain: sync source -> proxy client -> proxy server -> spawned
/// `blocksync --target` backend, all over localhost.
#[test]
fn proxied_sync_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.img");
    let target = dir.path().join("target.img");
    let mut data = patterned(BLOCK_SIZE as usize * 5 + 33);
    data[BLOCK_SIZE as usize..BLOCK_SIZE as usize * 2].fill(0);
    write_file(&source, &data).unwrap();

    let identifier = format!("{:x}", md5::compute(b"proxied sync end to end"));
    std::env::set_var(&identifier, target.as_os_str());

    let proxy_port = free_port();
    let local_port = free_port();

    let proxy_server = ProxyServer::new(
        env!("CARGO_BIN_EXE_blocksync"),
        BLOCK_SIZE,
        proxy_port,
        vec![identifier.clone()],
    );
    let server_thread = thread::spawn(move || proxy_server.start());

    let proxy_client = ProxyClient::new(local_port, proxy_port, "127.0.0.1");
    let client_identifier = identifier.clone();
    let client_thread = thread::spawn(move || proxy_client.connect_to_target(&client_identifier));

    let provider = TcpConnectionProvider::with_retry(
        "127.0.0.1",
        local_port,
        300,
        Duration::from_millis(10),
    );
    let opts = SyncOptions {
        block_size: BLOCK_SIZE,
        preallocate: false,
    };
    let mut sync = SyncClient::with_provider(&source, Box::new(provider), &opts).unwrap();
    sync.connect_to_target().unwrap();

    client_thread.join().unwrap().unwrap();
    server_thread.join().unwrap().unwrap();
    std::env::remove_var(&identifier);

    assert_eq!(fs::read(&target).unwrap(), data);
}
