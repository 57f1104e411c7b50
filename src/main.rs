//! minikvdb — an embeddable relational storage engine with a WAL, MVCC,
//! and a B+ tree index, fronted by a length-prefixed line protocol.
//!
//! Architecture:
//! statement -> Session (C12) -> Executor (C10) -> MVCC (C7) -> Data Items
//! (C4) -> Page Cache (C1), with the B+ Tree (C9) serving indexed reads and
//! the Database Registry (C11) owning one stack per named database.

use std::path::PathBuf;

use log::info;

use minikvdb::{Config, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = Config::default();
    let args: Vec<String> = std::env::args().collect();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-create" | "-open" => {
                if i + 1 < args.len() {
                    config.data_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                } else {
                    return Err(format!("{} requires a path argument", args[i]).into());
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    let port: u16 = args[i + 1].parse()?;
                    config.bind_addr.set_port(port);
                    i += 1;
                }
            }
            "--data-dir" | "-d" => {
                if i + 1 < args.len() {
                    config.data_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("minikvdb - an embeddable relational storage engine");
                println!();
                println!("Usage: minikvdb [-create <path> | -open <path>] [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -create PATH          Registry root for a fresh set of databases");
                println!("  -open PATH            Registry root of an existing set of databases");
                println!("  -p, --port PORT       Port to listen on (default: 9999)");
                println!("  -d, --data-dir DIR    Registry root directory (default: ./data)");
                println!("  -h, --help            Show this help");
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
        i += 1;
    }

    info!("starting minikvdb");
    let server = Server::new(config)?;
    server.run().await?;

    Ok(())
}
