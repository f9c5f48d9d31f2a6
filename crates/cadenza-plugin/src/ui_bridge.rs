//! Out-of-process plugin UI reached over a pair of byte pipes.
//!
//! A reader thread parses [`UiMessage`]s from the UI's output into a channel;
//! the host drains it from `ui_idle()`. Writes go through a lock so the main
//! thread and the idle loop can both talk to the UI.

use crate::error::{PluginError, Result};
use crate::protocol::{UiMessage, UiMessageReader};
use crossbeam_channel::{Receiver, TryRecvError};
use parking_lot::Mutex;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Liveness of a bridged UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Started, nothing received yet and still within the timeout.
    Starting,
    Running,
    /// Nothing was received within the startup timeout.
    TimedOut,
    /// The UI closed its end of the pipe.
    Closed,
}

pub struct UiBridge {
    writer: Mutex<Box<dyn Write + Send>>,
    messages: Receiver<UiMessage>,
    child: Option<Child>,
    reader_thread: Option<thread::JoinHandle<()>>,
    closed: Arc<AtomicBool>,
    responded: AtomicBool,
    started: Instant,
    timeout: Duration,
}

impl std::fmt::Debug for UiBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiBridge")
            .field("pid", &self.child.as_ref().map(Child::id))
            .field("state", &self.state())
            .finish()
    }
}

impl UiBridge {
    /// Launch `executable` with `args`; its stdin/stdout become the message pipes.
    pub fn spawn(executable: &Path, args: &[String], timeout: Duration) -> Result<Self> {
        if !executable.exists() {
            return Err(PluginError::Bridge(format!(
                "UI bridge binary '{}' not found",
                executable.display()
            )));
        }

        let mut child = Command::new(executable)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PluginError::Bridge(format!("failed to start UI bridge: {e}")))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(PluginError::Bridge("UI bridge pipes unavailable".into()));
        };

        tracing::debug!("Started UI bridge {} (pid {})", executable.display(), child.id());
        let mut bridge = Self::from_streams(stdout, stdin, timeout)?;
        bridge.child = Some(child);
        Ok(bridge)
    }

    /// Bridge over an arbitrary reader/writer pair.
    pub fn from_streams<R, W>(reader: R, writer: W, timeout: Duration) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        let closed = Arc::new(AtomicBool::new(false));

        let reader_thread = {
            let closed = Arc::clone(&closed);
            thread::Builder::new()
                .name("lv2-ui-bridge".to_string())
                .spawn(move || {
                    let mut reader = UiMessageReader::new(BufReader::new(reader));
                    loop {
                        match reader.read_message() {
                            Ok(Some(message)) => {
                                if tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(PluginError::Io(err)) => {
                                tracing::debug!("UI bridge pipe failed: {}", err);
                                break;
                            }
                            Err(err) => tracing::warn!("UI bridge sent a bad message: {}", err),
                        }
                    }
                    closed.store(true, Ordering::Release);
                })?
        };

        Ok(Self {
            writer: Mutex::new(Box::new(writer)),
            messages: rx,
            child: None,
            reader_thread: Some(reader_thread),
            closed,
            responded: AtomicBool::new(false),
            started: Instant::now(),
            timeout,
        })
    }

    pub fn send(&self, message: &UiMessage) -> Result<()> {
        let mut writer = self.writer.lock();
        message.write_to(&mut **writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Send several messages under one lock, flushed once.
    pub fn send_all(&self, messages: &[UiMessage]) -> Result<()> {
        let mut writer = self.writer.lock();
        for message in messages {
            message.write_to(&mut **writer)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Next received message, if any. Never blocks.
    pub fn try_recv(&self) -> Option<UiMessage> {
        match self.messages.try_recv() {
            Ok(message) => {
                self.responded.store(true, Ordering::Release);
                Some(message)
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn state(&self) -> BridgeState {
        if self.closed.load(Ordering::Acquire) && self.messages.is_empty() {
            return BridgeState::Closed;
        }
        if self.responded.load(Ordering::Acquire) || !self.messages.is_empty() {
            return BridgeState::Running;
        }
        if self.started.elapsed() >= self.timeout {
            BridgeState::TimedOut
        } else {
            BridgeState::Starting
        }
    }

    /// Ask the UI to quit and reap the process.
    pub fn close(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(err) = self.send(&UiMessage::Exiting) {
                tracing::debug!("Could not notify UI bridge: {}", err);
            }
        }

        if let Some(mut child) = self.child.take() {
            let deadline = Instant::now() + Duration::from_millis(500);
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    _ => {
                        tracing::warn!("UI bridge did not exit, killing it");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
        }

        // The reader thread only finishes once the pipe closes; detach it for
        // in-process streams that stay open.
        if self.closed.load(Ordering::Acquire) {
            if let Some(handle) = self.reader_thread.take() {
                let _ = handle.join();
            }
        } else {
            self.reader_thread.take();
        }
    }
}

impl Drop for UiBridge {
    fn drop(&mut self) {
        if self.child.is_some() || self.reader_thread.is_some() {
            self.close();
        }
    }
}
