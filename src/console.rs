//! Console log multiplexer
//!
//! One channel per instance. Records pushed by the launcher's console pump
//! are appended to a bounded replay buffer and fanned out to live
//! subscribers over a `tokio::sync::broadcast` channel.
//!
//! # Backpressure
//!
//! Ingestion never waits on subscribers. Each subscriber has a bounded queue
//! (`console.subscriber_queue`); when it falls further behind, its oldest
//! undelivered records are dropped and it receives one `system` record
//! saying how many were lost, then continues with the newest records.

use futures::Stream;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::ConsoleConfig;
use crate::guest;
use crate::models::{InstanceId, LogRecord, LogType};
use crate::{Error, Result};

const TRUNCATED_MARKER: &str = " [truncated]";

struct ChannelInner {
    buffer: VecDeque<LogRecord>,
    bytes: usize,
    /// `None` once the instance is torn down; subscribers then see end of stream
    sender: Option<broadcast::Sender<LogRecord>>,
}

struct Channel {
    inner: Mutex<ChannelInner>,
}

/// Per-instance log buffers and subscriber fan-out
pub struct ConsoleHub {
    config: ConsoleConfig,
    channels: RwLock<HashMap<InstanceId, Arc<Channel>>>,
}

impl ConsoleHub {
    pub fn new(config: ConsoleConfig) -> Self {
        Self {
            config,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Create the channel for `id` and return the ingestion handle.
    /// Opening an existing channel hands out another writer for it.
    pub fn open(&self, id: &InstanceId) -> ConsoleWriter {
        let channel = self
            .channels
            .write()
            .entry(id.clone())
            .or_insert_with(|| {
                let (tx, _rx) = broadcast::channel(self.config.subscriber_queue);
                Arc::new(Channel {
                    inner: Mutex::new(ChannelInner {
                        buffer: VecDeque::new(),
                        bytes: 0,
                        sender: Some(tx),
                    }),
                })
            })
            .clone();

        ConsoleWriter {
            id: id.clone(),
            channel,
            max_lines: self.config.buffer_lines,
            max_bytes: self.config.buffer_bytes,
            max_line_length: self.config.max_line_length,
        }
    }

    fn channel(&self, id: &InstanceId) -> Result<Arc<Channel>> {
        self.channels
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))
    }

    /// Buffered records in arrival order
    pub fn snapshot(&self, id: &InstanceId) -> Result<Vec<LogRecord>> {
        let channel = self.channel(id)?;
        let inner = channel.inner.lock();
        Ok(inner.buffer.iter().cloned().collect())
    }

    /// Records ingested from now on, in arrival order
    pub fn subscribe(&self, id: &InstanceId) -> Result<LogSubscription> {
        Ok(self.subscribe_with_snapshot(id)?.1)
    }

    /// Buffer contents plus a subscription starting right after them.
    /// No record is missed or seen twice across the two.
    pub fn subscribe_with_snapshot(
        &self,
        id: &InstanceId,
    ) -> Result<(Vec<LogRecord>, LogSubscription)> {
        let channel = self.channel(id)?;
        let inner = channel.inner.lock();
        let snapshot = inner.buffer.iter().cloned().collect();
        let subscription = LogSubscription {
            rx: inner.sender.as_ref().map(broadcast::Sender::subscribe),
        };
        Ok((snapshot, subscription))
    }

    /// Append an orchestrator-authored record
    pub fn append_system(&self, id: &InstanceId, message: impl Into<String>) {
        if let Ok(channel) = self.channel(id) {
            push_record(
                &channel,
                LogRecord::system(message),
                self.config.buffer_lines,
                self.config.buffer_bytes,
            );
        }
    }

    /// End every subscription; the buffer stays readable
    pub fn close(&self, id: &InstanceId) {
        if let Ok(channel) = self.channel(id) {
            channel.inner.lock().sender = None;
        }
    }

    /// Close and discard the buffer
    pub fn remove(&self, id: &InstanceId) {
        if let Some(channel) = self.channels.write().remove(id) {
            channel.inner.lock().sender = None;
        }
    }

    pub fn subscriber_count(&self, id: &InstanceId) -> usize {
        self.channel(id)
            .map(|c| {
                c.inner
                    .lock()
                    .sender
                    .as_ref()
                    .map_or(0, broadcast::Sender::receiver_count)
            })
            .unwrap_or(0)
    }
}

fn push_record(channel: &Channel, record: LogRecord, max_lines: usize, max_bytes: usize) {
    let mut inner = channel.inner.lock();

    inner.bytes += record.payload_len();
    inner.buffer.push_back(record.clone());
    while inner.buffer.len() > 1 && (inner.buffer.len() > max_lines || inner.bytes > max_bytes) {
        if let Some(evicted) = inner.buffer.pop_front() {
            inner.bytes -= evicted.payload_len();
        }
    }

    // Sending under the lock keeps buffer order and delivery order identical
    if let Some(tx) = &inner.sender {
        let _ = tx.send(record);
    }
}

/// Ingestion side of one instance's channel
#[derive(Clone)]
pub struct ConsoleWriter {
    id: InstanceId,
    channel: Arc<Channel>,
    max_lines: usize,
    max_bytes: usize,
    max_line_length: usize,
}

impl ConsoleWriter {
    pub fn instance(&self) -> &InstanceId {
        &self.id
    }

    pub fn push(&self, mut record: LogRecord) {
        if let Some(message) = record.message.as_mut() {
            truncate_line(message, self.max_line_length);
        }

        if record.log_type == LogType::State {
            tracing::info!(
                instance = %self.id,
                state = record.state.as_deref().unwrap_or_default(),
                detail = record.message.as_deref().unwrap_or_default(),
                "Guest state"
            );
        }

        push_record(&self.channel, record, self.max_lines, self.max_bytes);
    }

    /// Parse a raw console line and push the resulting record
    pub fn push_line(&self, line: &str) {
        self.push(guest::parse_line(line));
    }
}

fn truncate_line(message: &mut String, max: usize) {
    if message.len() <= max {
        return;
    }
    let mut cut = max.saturating_sub(TRUNCATED_MARKER.len());
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    message.truncate(cut);
    message.push_str(TRUNCATED_MARKER);
}

/// A live log subscription. Dropping it unsubscribes.
pub struct LogSubscription {
    rx: Option<broadcast::Receiver<LogRecord>>,
}

impl LogSubscription {
    /// Next record, or `None` once the instance is torn down
    pub async fn next(&mut self) -> Option<LogRecord> {
        let rx = self.rx.as_mut()?;
        match rx.recv().await {
            Ok(record) => Some(record),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Some(LogRecord::system(format!(
                "subscriber fell behind, {} records dropped",
                skipped
            ))),
            Err(broadcast::error::RecvError::Closed) => {
                self.rx = None;
                None
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = LogRecord> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let record = sub.next().await?;
            Some((record, sub))
        })
    }
}
