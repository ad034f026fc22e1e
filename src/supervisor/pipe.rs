//! Output piping: child stdout/stderr bytes → identified log entries.
//!
//! Each stream gets its own task driving a [`FramedRead`] over
//! [`LogLineCodec`]. Lines keep their trailing newline; a terminated
//! partial line at stream end is emitted as-is. The buffer mints ids, so
//! entries across streams and agents are globally ordered and the ack
//! watermark stays meaningful.

use std::sync::Arc;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, warn};

use crate::log_buffer::LogBuffer;
use crate::protocol::{LogEntry, LogStream};
use crate::transport::TransportHandle;

/// Cap on a single buffered line: 1 MiB.
///
/// A stream that emits more than this without a newline gets the buffered
/// chunk flushed as its own entry instead of growing without bound. Output
/// is never dropped, only split.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-preserving line splitter for agent output streams.
#[derive(Debug)]
pub struct LogLineCodec {
    max_line_bytes: usize,
}

impl LogLineCodec {
    /// Codec with the default [`MAX_LINE_BYTES`] cap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_line_bytes: MAX_LINE_BYTES,
        }
    }
}

impl Default for LogLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LogLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<String>> {
        if let Some(pos) = src.iter().position(|byte| *byte == b'\n') {
            let line = src.split_to(pos + 1);
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        if src.len() > self.max_line_bytes {
            // Unterminated oversized chunk: flush it as one entry.
            let chunk = src.split();
            return Ok(Some(String::from_utf8_lossy(&chunk).into_owned()));
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> std::io::Result<Option<String>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            Ok(None)
        } else {
            // Terminated partial line at stream end.
            let rest = src.split();
            Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
        }
    }
}

/// Spawn the line-piping task for one child stream.
///
/// Each decoded line gets its id from the buffer and is appended while the
/// lock is still held, then sent through the transport. Per-stream
/// ordering is the sequential decode order; the task ends at EOF or on a
/// read error.
#[must_use]
pub fn spawn_pipe<R>(
    agent_id: String,
    stream: LogStream,
    reader: R,
    buffer: Arc<Mutex<LogBuffer>>,
    transport: TransportHandle,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut framed = FramedRead::new(reader, LogLineCodec::new());

        while let Some(item) = framed.next().await {
            match item {
                Ok(line) => {
                    let entry = {
                        let mut buffer = buffer.lock().await;
                        let id = buffer.next_id();
                        let entry = LogEntry::new(id, agent_id.clone(), stream, line);
                        buffer.push(entry.clone());
                        entry
                    };
                    transport.send_log(entry);
                }
                Err(err) => {
                    warn!(agent_id, stream = stream.as_str(), %err, "pipe read error, stopping");
                    break;
                }
            }
        }

        debug!(agent_id, stream = stream.as_str(), "pipe closed");
    })
}
