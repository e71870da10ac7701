/*!
 * Timestamp Side-Channel
 *
 * Best-effort UDP path carrying one `TimestampRecord` per tagged frame from
 * the robot streamer to the viewer and recorder. No acknowledgements and no
 * retransmission: a lost datagram is simply a frame without a latency sample.
 */

pub mod codec;
pub mod publisher;
pub mod subscriber;

pub use codec::{Datagram, TimestampCodec, DATAGRAM_LEN};
pub use publisher::{PublishError, TimestampSink, UdpPublisher};
pub use subscriber::{ingest, SharedTable, TimestampSubscriber};
