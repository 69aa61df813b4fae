use super::{BoxedReader, BoxedWriter, SerialConfig, SessionLog, Utf8ChunkDecoder};
use crate::activity::ActivityLog;
use crate::alert::AlertCenter;
use crate::analytics::{parse_readings, readings_map, SensorStore};
use crate::device::{CommandSink, DeviceControl};
use crate::event::{EventBus, EventPayload};
use crate::notify::NotificationCenter;
use crate::{Result, SosConnect, SosError};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Write half of an attached source. Released on disconnect; writes after
/// that fail with `DeviceError`.
pub struct SerialWriter {
    inner: Mutex<Option<BoxedWriter>>,
}

impl SerialWriter {
    fn new(writer: Option<BoxedWriter>) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    async fn release(&self) {
        if let Some(mut w) = self.inner.lock().await.take() {
            if let Err(e) = w.shutdown().await {
                debug!(target: "serial", error = %e, "Writer shutdown failed");
            }
        }
    }
}

#[async_trait]
impl CommandSink for SerialWriter {
    async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let w = guard
            .as_mut()
            .ok_or_else(|| SosError::DeviceError("Serial port not connected".into()))?;
        w.write_all(bytes)
            .await
            .map_err(|e| SosError::DeviceError(e.to_string()))?;
        w.flush()
            .await
            .map_err(|e| SosError::DeviceError(e.to_string()))
    }
}

/// Everything a chunk touches on its way through the pipeline.
#[derive(Clone)]
struct Pipeline {
    source: String,
    session: Arc<Mutex<SessionLog>>,
    alerts: Arc<Mutex<AlertCenter>>,
    activity: Arc<Mutex<ActivityLog>>,
    notifications: Arc<Mutex<NotificationCenter>>,
    sensors: Arc<Mutex<SensorStore>>,
    device: Arc<Mutex<DeviceControl>>,
    bus: Arc<EventBus>,
}

impl Pipeline {
    /// Session log, keyword scan, event fan-out, then sensor lines. Runs
    /// strictly in arrival order on the read task.
    async fn handle_chunk(&self, text: &str, lines: &mut LineBuffer) {
        self.session.lock().await.append(text);

        match self.alerts.lock().await.process_chunk(text).await {
            Ok(Some(alert)) => {
                self.activity.lock().await.log_emergency(
                    "Emergency keyword detected",
                    json!({ "keyword": alert.keyword, "title": alert.title, "alert_id": alert.id }),
                );
            }
            Ok(None) => {}
            Err(e) => {
                error!(target: "serial", error = %e, "Alert could not be presented");
                self.activity
                    .lock()
                    .await
                    .log_error("Alert display failed", json!({ "error": e.to_string() }));
            }
        }

        self.bus
            .emit(
                "serial",
                EventPayload::ChunkReceived {
                    text: text.to_string(),
                },
            )
            .await;

        for line in lines.push(text) {
            self.handle_line(&line).await;
        }
    }

    async fn handle_line(&self, line: &str) {
        let parsed = parse_readings(line);
        if parsed.is_empty() {
            return;
        }
        let now = Utc::now();
        self.sensors.lock().await.record_all(&parsed, now);
        let readings = readings_map(&parsed);
        let fired = self
            .device
            .lock()
            .await
            .check_automation_rules(&readings, now)
            .await;
        if !fired.is_empty() {
            let names: Vec<&str> = fired.iter().map(|r| r.name.as_str()).collect();
            self.activity
                .lock()
                .await
                .log_sensor("Automation rules fired", json!({ "rules": names, "readings": readings }));
        }
    }

    async fn connected(&self, cfg: &SerialConfig) {
        let line = cfg.describe();
        {
            let mut session = self.session.lock().await;
            session.clear();
            session.note("Connected successfully!");
            session.note("Listening for data...");
        }
        self.activity
            .lock()
            .await
            .log_connection("Device connected", json!({ "source": self.source, "line": line }));
        self.notifications
            .lock()
            .await
            .show_connection_status(
                true,
                &format!("Serial device connected successfully at {} baud rate", cfg.baud_rate),
            )
            .await;
        self.bus
            .emit(
                "serial",
                EventPayload::SerialConnected {
                    source: self.source.clone(),
                },
            )
            .await;
    }

    async fn disconnected(&self, reason: &str) {
        self.session.lock().await.note("\nDisconnected.");
        self.sensors.lock().await.flush();
        self.alerts.lock().await.reset_stream();
        self.device.lock().await.clear_sink();
        self.activity
            .lock()
            .await
            .log_connection("Device disconnected", json!({ "source": self.source, "reason": reason }));
        self.notifications
            .lock()
            .await
            .show_connection_status(false, "Serial device has been disconnected")
            .await;
        self.bus
            .emit(
                "serial",
                EventPayload::SerialDisconnected {
                    source: self.source.clone(),
                    reason: reason.to_string(),
                },
            )
            .await;
    }
}

/// Attaches byte streams to the monitor pipeline of one [`SosConnect`].
pub struct SerialMonitor {
    cfg: SerialConfig,
    session: Arc<Mutex<SessionLog>>,
    alerts: Arc<Mutex<AlertCenter>>,
    activity: Arc<Mutex<ActivityLog>>,
    notifications: Arc<Mutex<NotificationCenter>>,
    sensors: Arc<Mutex<SensorStore>>,
    device: Arc<Mutex<DeviceControl>>,
    bus: Arc<EventBus>,
}

impl SerialMonitor {
    pub fn new(app: &SosConnect, cfg: SerialConfig) -> Self {
        Self {
            session: Arc::new(Mutex::new(SessionLog::new(cfg.max_log_size))),
            cfg,
            alerts: Arc::clone(&app.alerts),
            activity: Arc::clone(&app.activity),
            notifications: Arc::clone(&app.notifications),
            sensors: Arc::clone(&app.sensors),
            device: Arc::clone(&app.device),
            bus: Arc::clone(&app.event_bus),
        }
    }

    pub fn config(&self) -> &SerialConfig {
        &self.cfg
    }

    pub fn session(&self) -> Arc<Mutex<SessionLog>> {
        Arc::clone(&self.session)
    }

    /// Start the read loop over `reader`. A `writer`, when given, becomes the
    /// device command sink until the connection ends.
    pub async fn attach(
        &self,
        source: &str,
        reader: BoxedReader,
        writer: Option<BoxedWriter>,
    ) -> SerialConnection {
        let pipeline = Pipeline {
            source: source.to_string(),
            session: Arc::clone(&self.session),
            alerts: Arc::clone(&self.alerts),
            activity: Arc::clone(&self.activity),
            notifications: Arc::clone(&self.notifications),
            sensors: Arc::clone(&self.sensors),
            device: Arc::clone(&self.device),
            bus: Arc::clone(&self.bus),
        };

        let writable = writer.is_some();
        let writer = Arc::new(SerialWriter::new(writer));
        if writable {
            self.device
                .lock()
                .await
                .set_sink(Arc::clone(&writer) as Arc<dyn CommandSink>);
        }

        info!(target: "serial", source, line = %self.cfg.describe(), writable, "Serial attached");
        pipeline.connected(&self.cfg).await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(read_loop(
            pipeline,
            reader,
            cancel_rx,
            self.cfg.read_buffer_size.max(1),
        ));

        SerialConnection {
            source: source.to_string(),
            cancel: cancel_tx,
            task,
            writer,
        }
    }
}

async fn read_loop(
    pipeline: Pipeline,
    mut reader: BoxedReader,
    mut cancel: watch::Receiver<bool>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    let mut decoder = Utf8ChunkDecoder::new();
    let mut lines = LineBuffer::new(buffer_size * LINE_BUFFER_READS);

    let reason = loop {
        let n = tokio::select! {
            _ = cancel.changed() => break "disconnected".to_string(),
            read = reader.read(&mut buf) => match read {
                Ok(0) => break "end of stream".to_string(),
                Ok(n) => n,
                Err(e) => {
                    error!(target: "serial", error = %e, "Read error");
                    pipeline.session.lock().await.note(&format!("\nERROR: {}", e));
                    break e.to_string();
                }
            },
        };

        let text = decoder.decode(&buf[..n]);
        if text.is_empty() {
            continue;
        }
        pipeline.handle_chunk(&text, &mut lines).await;
    };

    let tail = decoder.finish();
    if !tail.is_empty() {
        pipeline.handle_chunk(&tail, &mut lines).await;
    }
    if let Some(line) = lines.take_rest() {
        pipeline.handle_line(&line).await;
    }

    info!(target: "serial", source = %pipeline.source, reason = %reason, "Serial read loop ended");
    pipeline.disconnected(&reason).await;
}

/// How many full reads an unterminated line may span before its oldest
/// bytes are dropped.
const LINE_BUFFER_READS: usize = 8;

/// Splits the stream into sensor lines. Either `\n` or `\r` ends a line;
/// an unterminated run longer than `cap` keeps only its newest bytes.
struct LineBuffer {
    buf: String,
    cap: usize,
}

impl LineBuffer {
    fn new(cap: usize) -> Self {
        Self {
            buf: String::new(),
            cap: cap.max(1),
        }
    }

    fn push(&mut self, text: &str) -> Vec<String> {
        self.buf.push_str(text);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find(|c| c == '\n' || c == '\r') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        if self.buf.len() > self.cap {
            let mut cut = self.buf.len() - self.cap;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            debug!(target: "serial", dropped = cut, "Unterminated line too long, dropping oldest bytes");
            self.buf.drain(..cut);
        }
        lines
    }

    fn take_rest(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim_end();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

/// A running read loop plus the write half it was attached with.
pub struct SerialConnection {
    source: String,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
    writer: Arc<SerialWriter>,
}

impl SerialConnection {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn writer(&self) -> Arc<SerialWriter> {
        Arc::clone(&self.writer)
    }

    /// True once the read loop has ended on its own (EOF or read error).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the in-flight read, wait for the loop to wind down and release
    /// the writer.
    pub async fn disconnect(self) -> Result<()> {
        let _ = self.cancel.send(true);
        let joined = self.task.await;
        self.writer.release().await;
        joined.map_err(|e| SosError::SerialError(format!("read task failed: {}", e)))?;
        info!(target: "serial", source = %self.source, "Disconnected");
        Ok(())
    }

    /// Wait for the stream to end by itself, then release the writer.
    pub async fn closed(self) -> Result<()> {
        let joined = self.task.await;
        self.writer.release().await;
        if let Err(e) = joined {
            warn!(target: "serial", error = %e, "Read task failed");
            return Err(SosError::SerialError(format!("read task failed: {}", e)));
        }
        Ok(())
    }
}
