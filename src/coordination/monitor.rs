//! Four-letter monitoring commands
//!
//! A client writes a four-letter word and the service answers with plain
//! text, then closes the connection:
//!
//! ```text
//! ruok -> imok
//! wchs -> 4 connections watching 94 paths
//!         Total watches:160
//! ```

use super::LocalCoordinationService;
use crate::common::{Error, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Render the answer to one command
pub fn respond(service: &LocalCoordinationService, command: &str) -> Result<String> {
    match command.trim() {
        "ruok" => Ok("imok".to_string()),
        "wchs" => {
            let stats = service.watch_stats()?;
            Ok(format!(
                "{} connections watching {} paths\nTotal watches:{}\n",
                stats.connections, stats.paths, stats.total
            ))
        }
        other => Err(Error::Coordination(format!(
            "unknown monitor command '{}'",
            other
        ))),
    }
}

/// Accept monitor connections until the listener fails
pub async fn serve_monitor(listener: TcpListener, service: LocalCoordinationService) -> Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "Coordination monitor listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &service).await {
                tracing::debug!(%peer, error = %e, "Monitor connection failed");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, service: &LocalCoordinationService) -> Result<()> {
    let mut command = [0u8; 4];
    stream.read_exact(&mut command).await?;
    let command = String::from_utf8_lossy(&command).to_string();

    let reply = match respond(service, &command) {
        Ok(reply) => reply,
        Err(_) => String::new(),
    };
    stream.write_all(reply.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Extract the total watch count from a `wchs` response: the value after
/// the colon on the line that has one.
pub fn parse_watch_count(response: &str) -> Result<u64> {
    let line = response
        .lines()
        .find(|line| line.contains(':'))
        .ok_or_else(|| Error::Coordination(format!("no watch count in '{}'", response.trim())))?;
    let (_, value) = line
        .split_once(':')
        .ok_or_else(|| Error::Coordination("malformed watch count line".into()))?;
    value
        .trim()
        .parse()
        .map_err(|_| Error::Coordination(format!("invalid watch count '{}'", value.trim())))
}

/// Send `wchs` to a monitor and return the total watch count
pub async fn fetch_watch_count(addr: SocketAddr) -> Result<u64> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(b"wchs").await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    parse_watch_count(&response)
}
