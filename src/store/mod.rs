//! Minute store client
//!
//! The collector reads raw per-minute counters from a remote time-series
//! store. `MinuteStore` is the contract the engine depends on; `StoreClient`
//! is the TCP implementation. The scheduler owns connection recycling: on a
//! transport error it calls `close` then `reopen` and retries next tick.

pub mod codec;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::StoreConfig;

/// One store row: the minute's row key and its `(qualifier, count)` columns.
/// Consumed entirely within one aggregation cycle, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub key: String,
    pub columns: Vec<(String, u64)>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store request timed out")]
    Timeout,
    #[error("store protocol error: {0}")]
    Protocol(String),
    #[error("store rejected request: {0}")]
    Remote(String),
}

/// Read access to the remote store, one minute at a time.
#[async_trait]
pub trait MinuteStore: Send {
    /// Fetch the row for one minute, constrained to a column-qualifier prefix.
    /// Returns zero rows when the minute has no data yet.
    async fn read_minute(
        &mut self,
        row_key: &str,
        column_prefix: &str,
    ) -> Result<Vec<RawRow>, StoreError>;

    /// Scan up to `count` consecutive minutes starting at `start_key`.
    /// Rows come back with their keys; minutes with no data yield no row.
    async fn read_minutes(
        &mut self,
        start_key: &str,
        column_prefix: &str,
        count: u32,
    ) -> Result<Vec<RawRow>, StoreError>;

    async fn close(&mut self);

    async fn reopen(&mut self) -> Result<(), StoreError>;
}

/// TCP client speaking the length-prefixed binary protocol of `codec`.
///
/// The connection is dialed lazily on first use and dropped on any exchange
/// failure, so the next call (or an explicit `reopen`) redials.
pub struct StoreClient {
    addr: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    conn: Option<TcpStream>,
}

impl StoreClient {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            addr: format!("{}:{}", config.host, config.port),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            conn: None,
        }
    }

    async fn dial(&self) -> Result<TcpStream, StoreError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(StoreError::Connect)?;
        info!("Connected to store at {}", self.addr);
        Ok(stream)
    }

    async fn call(&mut self, request: bytes::BytesMut) -> Result<Vec<RawRow>, StoreError> {
        let mut stream = match self.conn.take() {
            Some(stream) => stream,
            None => self.dial().await?,
        };

        match Self::exchange(&mut stream, &request, self.read_timeout).await {
            Ok(rows) => {
                self.conn = Some(stream);
                Ok(rows)
            }
            // The stream may be mid-frame; drop it rather than resync.
            Err(e) => Err(e),
        }
    }

    async fn exchange(
        stream: &mut TcpStream,
        request: &[u8],
        read_timeout: Duration,
    ) -> Result<Vec<RawRow>, StoreError> {
        stream.write_all(request).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; 4];
        timeout(read_timeout, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| StoreError::Timeout)??;
        let len = u32::from_be_bytes(len_buf);
        if len > codec::MAX_FRAME {
            return Err(StoreError::Protocol(format!("frame too large: {} bytes", len)));
        }

        let mut payload = vec![0u8; len as usize];
        timeout(read_timeout, stream.read_exact(&mut payload))
            .await
            .map_err(|_| StoreError::Timeout)??;

        codec::decode_response(&payload)
    }
}

#[async_trait]
impl MinuteStore for StoreClient {
    async fn read_minute(
        &mut self,
        row_key: &str,
        column_prefix: &str,
    ) -> Result<Vec<RawRow>, StoreError> {
        debug!("Reading row {}", row_key);
        self.call(codec::encode_row_request(row_key, column_prefix)).await
    }

    async fn read_minutes(
        &mut self,
        start_key: &str,
        column_prefix: &str,
        count: u32,
    ) -> Result<Vec<RawRow>, StoreError> {
        debug!("Scanning {} minutes from {}", count, start_key);
        self.call(codec::encode_scan_request(start_key, column_prefix, count)).await
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.conn.take() {
            let _ = stream.shutdown().await;
        }
    }

    async fn reopen(&mut self) -> Result<(), StoreError> {
        self.close().await;
        let stream = self.dial().await?;
        self.conn = Some(stream);
        Ok(())
    }
}
