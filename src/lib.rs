use std::sync::Arc;

use log::{error, info};
use tokio::net::TcpListener;

pub mod btree;
pub mod catalog;
pub mod config;
pub mod data_item;
pub mod error;
pub mod executor;
pub mod fsm;
pub mod lexer;
pub mod lock_manager;
pub mod mvcc;
pub mod page_cache;
pub mod parser;
pub mod protocol;
pub mod recovery;
pub mod registry;
pub mod session;
pub mod types;
pub mod wal;
pub mod xid;

pub use config::Config;

use crate::protocol::ConnectionHandler;
use crate::registry::Registry;

/// Accepts connections and spawns one `ConnectionHandler` per socket
/// against a shared database registry.
pub struct Server {
    config: Config,
    registry: Arc<Registry>,
}

impl Server {
    pub fn new(config: Config) -> error::Result<Self> {
        let registry = Arc::new(Registry::new(config.clone())?);
        Ok(Self { config, registry })
    }

    pub async fn run(&self) -> error::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("minisql listening on {}", self.config.bind_addr);
        info!("data directory: {:?}", self.config.data_dir);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("new connection from {}", addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        error!("failed to set TCP_NODELAY for {}: {}", addr, e);
                    }
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        let handler = ConnectionHandler::new(stream, registry);
                        if let Err(e) = handler.run().await {
                            error!("connection error from {}: {}", addr, e);
                        }
                        info!("connection closed: {}", addr);
                    });
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                }
            }
        }
    }
}
