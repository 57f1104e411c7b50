//! Length-prefixed JSON-frame wire protocol. (C12 collaborator)
//!
//! Each frame is a `u32` big-endian length prefix followed by a one-byte
//! status (`0x00` ok, `0x01` error) and either a `serde_json`-encoded
//! `ExecResult` or a UTF-8 error message. One `ConnectionHandler` runs per
//! accepted socket, spawned onto its own task by the server loop.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::Result;
use crate::registry::Registry;
use crate::session::Session;
use crate::types::ExecResult;

const STATUS_OK: u8 = 0x00;
const STATUS_ERR: u8 = 0x01;

pub struct ConnectionHandler {
    stream: TcpStream,
    session: Session,
}

impl ConnectionHandler {
    pub fn new(stream: TcpStream, registry: Arc<Registry>) -> Self {
        Self {
            stream,
            session: Session::new(registry),
        }
    }

    /// Read frames until the client disconnects, running each as a
    /// statement and writing back a response frame.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let Some(sql) = read_frame(&mut self.stream).await? else {
                return Ok(());
            };
            let sql = String::from_utf8_lossy(&sql).into_owned();
            let response = self.session.handle(&sql);
            write_response(&mut self.stream, response).await?;
        }
    }
}

/// Read one length-prefixed frame. `Ok(None)` means the client closed the
/// connection cleanly before sending a length prefix.
async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_response(stream: &mut TcpStream, response: Result<ExecResult>) -> Result<()> {
    let (status, body) = match response {
        Ok(result) => (STATUS_OK, serde_json::to_vec(&result)?),
        Err(e) => (STATUS_ERR, e.to_string().into_bytes()),
    };
    let mut frame = Vec::with_capacity(5 + body.len());
    frame.extend_from_slice(&((body.len() + 1) as u32).to_be_bytes());
    frame.push(status);
    frame.extend_from_slice(&body);
    stream.write_all(&frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::net::TcpListener;

    async fn spawn_server() -> (std::net::SocketAddr, Arc<Registry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            cache_capacity: 64,
            wal_buffer_size: 1 << 16,
            ..Config::default()
        };
        let registry = Arc::new(Registry::new(config).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry_clone = Arc::clone(&registry);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let handler = ConnectionHandler::new(stream, registry_clone);
            let _ = handler.run().await;
        });
        (addr, registry, dir)
    }

    async fn send(stream: &mut TcpStream, sql: &str) -> (u8, Vec<u8>) {
        let body = sql.as_bytes();
        stream.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
        stream.write_all(body).await.unwrap();
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        (buf[0], buf[1..].to_vec())
    }

    #[tokio::test]
    async fn round_trip_insert_and_select() {
        let (addr, _registry, _dir) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let (status, _) = send(&mut client, "CREATE DATABASE shop").await;
        assert_eq!(status, STATUS_OK);
        let (status, _) = send(&mut client, "USE shop").await;
        assert_eq!(status, STATUS_OK);
        let (status, _) = send(&mut client, "CREATE TABLE t (id INT64 PRIMARY KEY)").await;
        assert_eq!(status, STATUS_OK);
        let (status, _) = send(&mut client, "INSERT INTO t VALUES (1)").await;
        assert_eq!(status, STATUS_OK);

        let (status, body) = send(&mut client, "SELECT * FROM t").await;
        assert_eq!(status, STATUS_OK);
        let result: ExecResult = serde_json::from_slice(&body).unwrap();
        match result {
            ExecResult::Result { result_rows, .. } => assert_eq!(result_rows, 1),
            other => panic!("expected Result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_table_reports_error_status() {
        let (addr, _registry, _dir) = spawn_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (status, _) = send(&mut client, "CREATE DATABASE shop").await;
        assert_eq!(status, STATUS_OK);
        let (status, _) = send(&mut client, "USE shop").await;
        assert_eq!(status, STATUS_OK);
        let (status, body) = send(&mut client, "SELECT * FROM missing").await;
        assert_eq!(status, STATUS_ERR);
        assert!(!body.is_empty());
    }
}
