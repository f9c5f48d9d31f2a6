//! Audio driver collaborators.
//!
//! A driver delivers fixed-size blocks by calling [`Engine::process`] from
//! its own thread and reports device changes through
//! [`Engine::buffer_size_changed`] and [`Engine::sample_rate_changed`].

use crate::engine::{Engine, ENGINE_AUDIO_CHANNELS};
use cadenza_core::{EventBuffer, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

pub trait Driver: Send {
    fn name(&self) -> &str;

    fn device_names(&self) -> Vec<String>;

    /// Start calling `engine.process()` with blocks of `buffer_size` frames.
    fn start(&mut self, engine: Weak<Engine>, buffer_size: u32, sample_rate: f64) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// Driver without audio hardware: processes silence in real time.
#[derive(Default)]
pub struct DummyDriver {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DummyDriver {
    pub const NAME: &'static str = "Dummy";

    pub fn new() -> Self {
        Self::default()
    }

    fn run(engine: Weak<Engine>, running: Arc<AtomicBool>, sample_rate: f64) {
        let mut inputs = vec![Vec::<f32>::new(); ENGINE_AUDIO_CHANNELS];
        let mut outputs = inputs.clone();
        let mut events_out = EventBuffer::new();

        while running.load(Ordering::Acquire) {
            let Some(engine) = engine.upgrade() else {
                break;
            };
            let frames = engine.buffer_size();
            for buffer in inputs.iter_mut().chain(outputs.iter_mut()) {
                buffer.resize(frames as usize, 0.0);
            }
            engine.process(&inputs, &mut outputs, &[], &mut events_out, frames);
            drop(engine);

            let period = f64::from(frames) / sample_rate.max(1.0);
            std::thread::sleep(Duration::from_secs_f64(period));
        }
    }
}

impl Driver for DummyDriver {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn device_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn start(&mut self, engine: Weak<Engine>, _buffer_size: u32, sample_rate: f64) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let thread = std::thread::Builder::new()
            .name("cadenza-dummy-driver".to_string())
            .spawn(move || Self::run(engine, running, sample_rate))?;
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            // the last engine handle may be released by the driver thread itself
            if thread.thread().id() == std::thread::current().id() {
                return Ok(());
            }
            if thread.join().is_err() {
                tracing::error!("Dummy driver thread panicked");
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for DummyDriver {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
