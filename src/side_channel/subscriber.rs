//! Receiver side of the side-channel.
//!
//! A dedicated task drains the socket into the shared correlation table, so
//! frame matching never waits on the network.

use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::udp::UdpFramed;
use tracing::{debug, info, warn};

use super::codec::{Datagram, TimestampCodec};
use crate::error::{Result, StreamError};
use crate::latency::correlation::CorrelationTable;
use crate::latency::TimestampRecord;
use crate::metrics::LatencyMetrics;

/// Correlation table shared between the subscriber task and the frame loop.
pub type SharedTable = Arc<std::sync::Mutex<CorrelationTable>>;

/// Insert a record into a shared table and account for what it displaced.
pub fn ingest(table: &SharedTable, record: TimestampRecord, metrics: &LatencyMetrics) {
    let outcome = {
        let mut table = table.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        table.insert(record)
    };
    metrics.record_received();
    metrics.record_evicted(outcome.evicted as u64);
    if outcome.session_reset {
        metrics.record_session_reset();
    }
}

/// Bound listener feeding a [`SharedTable`].
pub struct TimestampSubscriber {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl TimestampSubscriber {
    pub async fn start(
        bind: SocketAddr,
        table: SharedTable,
        metrics: Arc<LatencyMetrics>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| StreamError::side_channel(bind, e))?;
        let local_addr = socket.local_addr().map_err(|e| StreamError::side_channel(bind, e))?;
        info!("Listening for frame timestamps on {}", local_addr);

        let task = tokio::spawn(receive_loop(socket, table, metrics, cancel));
        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the task to exit after its cancellation token fired.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Timestamp subscriber task ended abnormally: {}", e);
        }
    }
}

async fn receive_loop(
    socket: UdpSocket,
    table: SharedTable,
    metrics: Arc<LatencyMetrics>,
    cancel: CancellationToken,
) {
    let mut framed = UdpFramed::new(socket, TimestampCodec);
    let mut first_record = true;

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = framed.next() => item,
        };

        match item {
            Some(Ok((Datagram::Record(record), from))) => {
                if first_record {
                    info!("First timestamp record from {} (session {})", from, record.session);
                    first_record = false;
                }
                ingest(&table, record, &metrics);
            }
            Some(Ok((Datagram::Malformed { len }, from))) => {
                debug!("Ignoring malformed {}-byte datagram from {}", len, from);
                metrics.record_malformed();
            }
            Some(Err(e)) => {
                // Receive errors are transient on UDP (e.g. ICMP feedback)
                debug!("Timestamp receive failed: {}", e);
            }
            None => break,
        }
    }

    debug!("Timestamp subscriber stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::side_channel::publisher::{TimestampSink, UdpPublisher};
    use std::time::Duration;
    use uuid::Uuid;

    fn shared_table() -> SharedTable {
        Arc::new(std::sync::Mutex::new(CorrelationTable::new(Duration::from_secs(5), 100)))
    }

    #[tokio::test]
    async fn published_records_land_in_table() {
        let table = shared_table();
        let metrics = Arc::new(LatencyMetrics::new());
        let cancel = CancellationToken::new();
        let subscriber = TimestampSubscriber::start(
            "127.0.0.1:0".parse().unwrap(),
            table.clone(),
            metrics.clone(),
            cancel.clone(),
        )
        .await
        .unwrap();

        let publisher =
            UdpPublisher::start(vec![subscriber.local_addr()], 8, Arc::new(LatencyMetrics::new()))
                .await
                .unwrap();
        let session = Uuid::new_v4();
        for id in 0..3 {
            publisher
                .try_publish(TimestampRecord { session, sequence_id: id, send_time: 1.0 })
                .unwrap();
        }

        // Also make sure garbage does not stop the loop
        let noise = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        noise.send_to(b"not a record", subscriber.local_addr()).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let snapshot = metrics.snapshot();
            if snapshot.records_received == 3 && snapshot.malformed_datagrams == 1 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "records never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        {
            let mut table = table.lock().unwrap();
            assert_eq!(table.len(), 3);
            assert!(table.match_id(1).is_some());
        }

        cancel.cancel();
        subscriber.join().await;
        publisher.shutdown().await;
    }

    #[test]
    fn ingest_counts_session_changes() {
        let table = shared_table();
        let metrics = LatencyMetrics::new();
        ingest(&table, TimestampRecord { session: Uuid::new_v4(), sequence_id: 0, send_time: 0.0 }, &metrics);
        ingest(&table, TimestampRecord { session: Uuid::new_v4(), sequence_id: 0, send_time: 0.0 }, &metrics);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_received, 2);
        assert_eq!(snapshot.session_resets, 1);
    }
}
