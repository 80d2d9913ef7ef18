//! Buffered delivery stream with background flush to the object sink.
//!
//! A stream accumulates newline-terminated JSON records and writes them as one
//! archived object when either the buffered size reaches `size_bytes` or
//! `interval_secs` have passed since the first record of the buffer.
//!
//! Flushing swaps the buffer out under the lock, so submissions made while an
//! object is being written land in the next buffer. A separate flush lock keeps
//! at most one flush per stream in flight. When every retry fails the records
//! are put back at the front of the buffer and the stream raises its alarm.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{Compression, StreamConfig};
use crate::sink::{ObjectCreated, ObjectSink};
use crate::storage::archive_path;
use crate::PipelineError;

/// Records waiting for the next flush.
#[derive(Default)]
struct Pending {
    records: Vec<Bytes>,
    bytes: usize,
    /// Wall-clock time of the first record; names the archived object.
    opened_at: Option<DateTime<Utc>>,
    /// When the interval threshold fires for this buffer.
    due_at: Option<Instant>,
}

/// Point-in-time view of a stream, served by the stream API.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub name: String,
    pub prefix: String,
    pub compression: &'static str,
    pub buffered_records: usize,
    pub buffered_bytes: usize,
    pub records_delivered: u64,
    pub objects_written: u64,
    pub failed_flushes: u64,
    pub alarm: bool,
}

/// One buffered delivery stream.
pub struct DeliveryStream {
    config: StreamConfig,
    objects: Arc<ObjectSink>,
    buffer: Mutex<Pending>,
    flush_lock: Mutex<()>,
    wake: Notify,
    buffered_records: AtomicUsize,
    buffered_bytes: AtomicUsize,
    records_delivered: AtomicU64,
    objects_written: AtomicU64,
    failed_flushes: AtomicU64,
    alarm: AtomicBool,
    closed: AtomicBool,
}

impl DeliveryStream {
    pub fn new(config: StreamConfig, objects: Arc<ObjectSink>) -> Self {
        Self {
            config,
            objects,
            buffer: Mutex::new(Pending::default()),
            flush_lock: Mutex::new(()),
            wake: Notify::new(),
            buffered_records: AtomicUsize::new(0),
            buffered_bytes: AtomicUsize::new(0),
            records_delivered: AtomicU64::new(0),
            objects_written: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
            alarm: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Serialize a value as one JSON record and submit it.
    pub async fn put_json<T: Serialize>(&self, value: &T) -> Result<(), PipelineError> {
        let record =
            serde_json::to_vec(value).map_err(|e| PipelineError::JsonEncode { source: e })?;
        self.put_record(Bytes::from(record)).await
    }

    /// Submit one record. A trailing newline is added if missing.
    pub async fn put_record(&self, record: Bytes) -> Result<(), PipelineError> {
        self.put_record_batch(vec![record]).await
    }

    /// Submit several records; either all are buffered or none are.
    ///
    /// # Errors
    ///
    /// [`PipelineError::StreamRejected`] if the stream is closed, a record is
    /// empty or larger than `max_record_bytes`, or the buffer would grow past
    /// `max_buffer_bytes`.
    pub async fn put_record_batch(&self, records: Vec<Bytes>) -> Result<(), PipelineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.rejected("stream is closed"));
        }

        let records = records
            .into_iter()
            .map(|r| self.normalise(r))
            .collect::<Result<Vec<_>, _>>()?;
        let batch_bytes: usize = records.iter().map(Bytes::len).sum();
        let batch_len = records.len();
        if batch_len == 0 {
            return Ok(());
        }

        let mut buffer = self.buffer.lock().await;
        // close() may have run, and the final flush taken the buffer, while we waited.
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.rejected("stream is closed"));
        }
        if buffer.bytes + batch_bytes > self.config.max_buffer_bytes {
            return Err(self.rejected(&format!(
                "buffer full: {} bytes, max {} bytes",
                buffer.bytes + batch_bytes,
                self.config.max_buffer_bytes
            )));
        }

        let opened = buffer.opened_at.is_none();
        if opened {
            buffer.opened_at = Some(Utc::now());
            buffer.due_at = Some(Instant::now() + self.config.interval());
        }
        buffer.records.extend(records);
        buffer.bytes += batch_bytes;
        self.buffered_records.fetch_add(batch_len, Ordering::SeqCst);
        self.buffered_bytes.store(buffer.bytes, Ordering::SeqCst);
        let reached_size = buffer.bytes >= self.config.size_bytes;
        drop(buffer);

        metrics::counter!("trace_archive.stream.records", "stream" => self.config.name.clone())
            .increment(batch_len as u64);
        if opened || reached_size {
            self.wake.notify_one();
        }
        Ok(())
    }

    fn normalise(&self, record: Bytes) -> Result<Bytes, PipelineError> {
        if record.is_empty() {
            return Err(self.rejected("empty record"));
        }
        let record = if record.ends_with(b"\n") {
            record
        } else {
            let mut terminated = Vec::with_capacity(record.len() + 1);
            terminated.extend_from_slice(&record);
            terminated.push(b'\n');
            Bytes::from(terminated)
        };
        if record.len() > self.config.max_record_bytes {
            return Err(self.rejected(&format!(
                "record of {} bytes exceeds {} bytes",
                record.len(),
                self.config.max_record_bytes
            )));
        }
        Ok(record)
    }

    fn rejected(&self, reason: &str) -> PipelineError {
        metrics::counter!("trace_archive.stream.rejected", "stream" => self.config.name.clone())
            .increment(1);
        PipelineError::StreamRejected {
            stream: self.config.name.clone(),
            reason: reason.to_owned(),
        }
    }

    /// Whether a flush threshold has been reached.
    pub async fn is_due(&self) -> bool {
        let buffer = self.buffer.lock().await;
        buffer.bytes >= self.config.size_bytes
            || buffer.due_at.is_some_and(|due| Instant::now() >= due)
    }

    async fn due_at(&self) -> Option<Instant> {
        self.buffer.lock().await.due_at
    }

    /// Write everything buffered as one object.
    ///
    /// Returns `None` when there was nothing to write. On exhausted retries
    /// the records return to the front of the buffer and the alarm is raised.
    pub async fn flush(&self) -> Result<Option<ObjectCreated>, PipelineError> {
        let _flushing = self.flush_lock.lock().await;

        let pending = {
            let mut buffer = self.buffer.lock().await;
            self.buffered_records.store(0, Ordering::SeqCst);
            self.buffered_bytes.store(0, Ordering::SeqCst);
            std::mem::take(&mut *buffer)
        };
        let Some(opened_at) = pending.opened_at else {
            return Ok(None);
        };

        let body = match encode(&pending.records, self.config.compression) {
            Ok(body) => body,
            Err(e) => {
                self.restore(pending).await;
                return Err(e);
            }
        };

        let max_retries = self.config.max_retries;
        let mut last_error = None;
        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay = self.config.retry.backoff(attempt - 1);
                tracing::warn!(
                    stream = %self.config.name,
                    attempt,
                    max_retries,
                    delay_ms = delay.as_millis(),
                    "Retrying flush after failure"
                );
                tokio::time::sleep(delay).await;
            }

            let path = archive_path(
                &self.config.prefix,
                &self.config.name,
                opened_at,
                self.config.compression,
            );
            match self.objects.put(&path, body.clone()).await {
                Ok(created) => {
                    let records = pending.records.len() as u64;
                    self.records_delivered.fetch_add(records, Ordering::SeqCst);
                    self.objects_written.fetch_add(1, Ordering::SeqCst);
                    if self.alarm.swap(false, Ordering::SeqCst) {
                        tracing::info!(stream = %self.config.name, "Stream alarm cleared");
                    }
                    metrics::counter!(
                        "trace_archive.stream.flushes",
                        "stream" => self.config.name.clone(),
                        "status" => "ok"
                    )
                    .increment(1);
                    metrics::histogram!(
                        "trace_archive.stream.object_bytes",
                        "stream" => self.config.name.clone()
                    )
                    .record(created.size as f64);
                    tracing::info!(
                        stream = %self.config.name,
                        path = %created.path,
                        records,
                        bytes = created.size,
                        attempts = attempt + 1,
                        "Flushed stream buffer"
                    );
                    return Ok(Some(created));
                }
                Err(e) => {
                    tracing::error!(
                        stream = %self.config.name,
                        attempt,
                        error = %e,
                        "Archive write failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let records = pending.records.len();
        self.restore(pending).await;
        self.failed_flushes.fetch_add(1, Ordering::SeqCst);
        self.alarm.store(true, Ordering::SeqCst);
        metrics::counter!(
            "trace_archive.stream.flushes",
            "stream" => self.config.name.clone(),
            "status" => "failed"
        )
        .increment(1);
        metrics::counter!("trace_archive.stream.alarms", "stream" => self.config.name.clone())
            .increment(1);
        tracing::error!(
            stream = %self.config.name,
            alarm = true,
            records,
            attempts = max_retries + 1,
            "All flush retries exhausted, records retained for the next flush"
        );

        Err(last_error.unwrap_or_else(|| PipelineError::Export {
            sink: self.config.name.clone(),
            message: "flush failed after all retries".to_owned(),
        }))
    }

    /// Put unflushed records back ahead of anything submitted meanwhile.
    async fn restore(&self, mut pending: Pending) {
        let mut buffer = self.buffer.lock().await;
        let newer = std::mem::take(&mut *buffer);
        pending.records.extend(newer.records);
        pending.bytes += newer.bytes;
        // The next attempt waits a full interval unless the size threshold fires.
        pending.due_at = Some(Instant::now() + self.config.interval());
        self.buffered_records
            .store(pending.records.len(), Ordering::SeqCst);
        self.buffered_bytes.store(pending.bytes, Ordering::SeqCst);
        *buffer = pending;
    }

    /// Stop accepting records. Buffered records stay until the final flush.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn alarm(&self) -> bool {
        self.alarm.load(Ordering::SeqCst)
    }

    pub fn buffered_records(&self) -> usize {
        self.buffered_records.load(Ordering::SeqCst)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            name: self.config.name.clone(),
            prefix: self.config.prefix.clone(),
            compression: match self.config.compression {
                Compression::Gzip => "gzip",
                Compression::Uncompressed => "uncompressed",
            },
            buffered_records: self.buffered_records(),
            buffered_bytes: self.buffered_bytes(),
            records_delivered: self.records_delivered.load(Ordering::SeqCst),
            objects_written: self.objects_written.load(Ordering::SeqCst),
            failed_flushes: self.failed_flushes.load(Ordering::SeqCst),
            alarm: self.alarm(),
        }
    }
}

/// Concatenate records and compress them per stream settings.
fn encode(records: &[Bytes], compression: Compression) -> Result<Bytes, PipelineError> {
    match compression {
        Compression::Uncompressed => Ok(Bytes::from(records.concat())),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            for record in records {
                encoder.write_all(record)?;
            }
            Ok(Bytes::from(encoder.finish()?))
        }
    }
}

/// Handle for controlling a stream's background flush task.
pub struct FlushHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: JoinHandle<()>,
}

impl FlushHandle {
    /// Signal the background task to stop and wait for it to complete.
    ///
    /// The stream is closed and flushed one final time before the task exits.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.join_handle.await;
    }

    /// Abort the background task immediately without flushing.
    pub fn abort(self) {
        self.join_handle.abort();
    }
}

/// Start the timer task that flushes `stream` on its size and interval
/// thresholds.
pub fn start_background_flush(stream: Arc<DeliveryStream>) -> FlushHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let join_handle = tokio::spawn(async move {
        tracing::info!(
            stream = %stream.name(),
            interval_secs = stream.config().interval_secs,
            size_bytes = stream.config().size_bytes,
            "Starting background flush task"
        );

        loop {
            let deadline = stream.due_at().await;
            tokio::select! {
                _ = &mut shutdown_rx => break,
                () = stream.wake.notified() => {}
                () = sleep_until_opt(deadline) => {}
            }

            if !stream.is_due().await {
                continue;
            }
            if let Err(e) = stream.flush().await {
                tracing::error!(stream = %stream.name(), error = %e, "Background flush failed");
                // Back off before retrying retained records.
                let cooldown = stream.config().retry.backoff(stream.config().max_retries);
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    () = tokio::time::sleep(cooldown) => {}
                }
            }
        }

        stream.close();
        if let Err(e) = stream.flush().await {
            tracing::error!(
                stream = %stream.name(),
                alarm = true,
                records = stream.buffered_records(),
                error = %e,
                "Final flush failed, buffered records are lost"
            );
        }
        tracing::info!(stream = %stream.name(), "Background flush task stopped");
    });

    FlushHandle {
        shutdown_tx: Some(shutdown_tx),
        join_handle,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
