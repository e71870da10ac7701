//! Sender side of the side-channel.
//!
//! `try_publish` only enqueues; a background task owns the socket and does
//! the actual `send_to`. When the queue is full the record being published is
//! dropped, so the capture loop never waits on the network.

use bytes::BytesMut;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Encoder;
use tracing::{debug, info, warn};

use super::codec::TimestampCodec;
use crate::error::{LatencyFault, Result, StreamError};
use crate::latency::TimestampRecord;
use crate::metrics::LatencyMetrics;

/// Why a record could not be handed to the side-channel.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    #[error("timestamp queue is full")]
    QueueFull,
    #[error("side-channel has shut down")]
    Closed,
}

/// Non-blocking destination for timestamp records.
pub trait TimestampSink: Send {
    /// Hand a record off without waiting.
    fn try_publish(&self, record: TimestampRecord) -> std::result::Result<(), PublishError>;
}

/// Fans records out to every configured receiver over UDP.
pub struct UdpPublisher {
    tx: mpsc::Sender<TimestampRecord>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl UdpPublisher {
    /// Bind an ephemeral socket and start the send task.
    pub async fn start(
        targets: Vec<SocketAddr>,
        queue_capacity: usize,
        metrics: Arc<LatencyMetrics>,
    ) -> Result<Self> {
        let any: IpAddr = match targets.first() {
            Some(SocketAddr::V6(_)) => Ipv6Addr::UNSPECIFIED.into(),
            _ => Ipv4Addr::UNSPECIFIED.into(),
        };
        let bind = SocketAddr::new(any, 0);
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| StreamError::side_channel(bind, e))?;
        let local_addr = socket.local_addr().map_err(|e| StreamError::side_channel(bind, e))?;

        info!(
            "Publishing frame timestamps from {} to {}",
            local_addr,
            targets.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
        );

        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let task = tokio::spawn(send_loop(socket, targets, rx, metrics));

        Ok(Self { tx, task, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting records and wait for queued ones to go out.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            warn!("Timestamp publisher task ended abnormally: {}", e);
        }
    }
}

impl TimestampSink for UdpPublisher {
    fn try_publish(&self, record: TimestampRecord) -> std::result::Result<(), PublishError> {
        self.tx.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PublishError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
        })
    }
}

async fn send_loop(
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
    mut rx: mpsc::Receiver<TimestampRecord>,
    metrics: Arc<LatencyMetrics>,
) {
    let mut codec = TimestampCodec;
    let mut buf = BytesMut::new();
    let mut failures: u64 = 0;

    while let Some(record) = rx.recv().await {
        // Encoded once, sent once per target; a failed send is not retried
        buf.clear();
        if let Err(e) = codec.encode(record, &mut buf) {
            debug!("Could not encode timestamp for frame {}: {}", record.sequence_id, e);
            metrics.record_fault(LatencyFault::SideChannelUnavailable);
            continue;
        }
        let mut delivered = false;
        for target in &targets {
            match socket.send_to(&buf, *target).await {
                Ok(_) => delivered = true,
                Err(e) => {
                    failures += 1;
                    if failures == 1 {
                        warn!("Timestamp send to {} failed: {} (further failures logged at debug)", target, e);
                    } else {
                        debug!("Timestamp send to {} failed for frame {}: {}", target, record.sequence_id, e);
                    }
                }
            }
        }
        if !delivered {
            metrics.record_fault(LatencyFault::SideChannelUnavailable);
        }
    }

    debug!("Timestamp publisher stopped ({} send failures)", failures);
}
