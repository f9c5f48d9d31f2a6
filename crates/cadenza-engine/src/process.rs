//! Block processing, called by the driver thread.
//!
//! Rack mode runs the plugins in series on a stereo pair, each synth adding
//! its output to what came before. Patchbay mode follows the internal graph:
//! plugin inputs are summed from their connected sources, and a source with a
//! higher id than its target contributes its output from the previous block.

use crate::engine::{Engine, ENGINE_AUDIO_CHANNELS};
use crate::graph::{AudioSource, EventSource, Routing};
use cadenza_core::{EngineEvent, EventBuffer, ProcessMode, TimeInfo};
use cadenza_plugin::ProcessContext;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Buffers reused from block to block.
#[derive(Debug)]
pub(crate) struct ProcessScratch {
    frames: usize,
    rack_in: Vec<Vec<f32>>,
    rack_out: Vec<Vec<f32>>,
    plugin_in: Vec<Vec<f32>>,
    events_in: EventBuffer,
    events_out: EventBuffer,
    plugin_out: Vec<Vec<Vec<f32>>>,
    plugin_events: Vec<EventBuffer>,
}

impl ProcessScratch {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            rack_in: vec![vec![0.0; frames]; ENGINE_AUDIO_CHANNELS],
            rack_out: vec![vec![0.0; frames]; ENGINE_AUDIO_CHANNELS],
            plugin_in: Vec::new(),
            events_in: EventBuffer::new(),
            events_out: EventBuffer::new(),
            plugin_out: Vec::new(),
            plugin_events: Vec::new(),
        }
    }

    /// Resize every buffer for blocks of `frames`.
    pub fn resize(&mut self, frames: usize) {
        self.frames = frames;
        let buffers = self
            .rack_in
            .iter_mut()
            .chain(self.rack_out.iter_mut())
            .chain(self.plugin_in.iter_mut())
            .chain(self.plugin_out.iter_mut().flatten());
        for buffer in buffers {
            buffer.clear();
            buffer.resize(frames, 0.0);
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }
}

/// Make `buffers` hold `count` zeroed buffers of `frames` samples.
fn ensure_buffers(buffers: &mut Vec<Vec<f32>>, count: usize, frames: usize) {
    if buffers.len() < count {
        buffers.resize_with(count, || vec![0.0; frames]);
    }
    for buffer in buffers.iter_mut().take(count) {
        buffer.resize(frames, 0.0);
        buffer.fill(0.0);
    }
}

fn mix_into(dest: &mut [f32], source: &[f32]) {
    for (d, s) in dest.iter_mut().zip(source) {
        *d += s;
    }
}

/// Applies the posted structural action once the block is done, even on early return.
struct RunPendingOnDrop<'a>(&'a Engine);

impl Drop for RunPendingOnDrop<'_> {
    fn drop(&mut self) {
        let engine = self.0;
        engine
            .action
            .run_pending(|action| engine.registry.apply(action));
    }
}

fn silence(outputs: &mut [Vec<f32>], events_out: &mut EventBuffer, frames: usize) {
    for output in outputs.iter_mut() {
        let end = frames.min(output.len());
        output[..end].fill(0.0);
    }
    events_out.clear();
}

impl Engine {
    /// Process one block of `frames` samples.
    ///
    /// `inputs` and `outputs` hold the system capture and playback channels.
    /// Called from the driver thread; never blocks and never frees a plugin.
    pub fn process(
        &self,
        inputs: &[Vec<f32>],
        outputs: &mut [Vec<f32>],
        events_in: &[EngineEvent],
        events_out: &mut EventBuffer,
        frames: u32,
    ) {
        let _pending = RunPendingOnDrop(self);
        let started = Instant::now();
        let frames_usize = frames as usize;

        if self.runner.is_stopped() {
            silence(outputs, events_out, frames_usize);
            return;
        }
        let Some(mut scratch) = self.scratch.try_lock() else {
            silence(outputs, events_out, frames_usize);
            return;
        };
        if frames_usize > scratch.frames() {
            tracing::warn!(
                "Block of {} frames exceeds the buffer size of {}",
                frames,
                scratch.frames()
            );
            silence(outputs, events_out, frames_usize);
            return;
        }

        let time = match self.transport.try_lock() {
            Some(transport) => transport.time_info(),
            None => TimeInfo::default(),
        };

        match self.process_mode() {
            ProcessMode::Patchbay => {
                let routing = self.routing.load();
                self.process_patchbay(
                    &mut scratch,
                    &routing,
                    inputs,
                    outputs,
                    events_in,
                    events_out,
                    &time,
                    frames,
                );
            }
            _ => self.process_rack(&mut scratch, inputs, outputs, events_in, events_out, &time, frames),
        }
        drop(scratch);

        if let Some(mut transport) = self.transport.try_lock() {
            transport.advance(frames);
        }

        let sample_rate = self.sample_rate();
        if sample_rate > 0.0 && frames > 0 {
            let budget = f64::from(frames) / sample_rate;
            let load = started.elapsed().as_secs_f64() / budget;
            self.dsp_load.set(load as f32);
            if load > 1.0 {
                self.xruns.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_rack(
        &self,
        scratch: &mut ProcessScratch,
        inputs: &[Vec<f32>],
        outputs: &mut [Vec<f32>],
        events_in: &[EngineEvent],
        events_out: &mut EventBuffer,
        time: &TimeInfo,
        frames: u32,
    ) {
        let n = frames as usize;
        let ProcessScratch {
            rack_in,
            rack_out,
            plugin_in,
            events_in: chain_in,
            events_out: chain_out,
            ..
        } = scratch;

        for (c, buffer) in rack_in.iter_mut().enumerate() {
            buffer[..n].fill(0.0);
            if let Some(input) = inputs.get(c) {
                let end = n.min(input.len());
                buffer[..end].copy_from_slice(&input[..end]);
            }
        }
        chain_in.clear();
        for event in events_in {
            chain_in.push(event.clone());
        }

        for id in 0..self.registry.count() {
            let Some(slot) = self.registry.slot(id) else {
                continue;
            };
            let plugin = &slot.plugin;
            if !plugin.is_enabled() {
                continue;
            }

            let (audio_ins, audio_outs, has_event_out) = {
                let Some(ports) = plugin.common().ports.try_read() else {
                    continue;
                };
                (ports.audio_in.len(), ports.audio_out.len(), !ports.event_out.is_empty())
            };

            // inputs beyond the stereo pair are silent
            ensure_buffers(plugin_in, audio_ins, n);
            for (c, buffer) in plugin_in.iter_mut().take(audio_ins).enumerate() {
                if let Some(source) = rack_in.get(c) {
                    buffer[..n].copy_from_slice(&source[..n]);
                }
            }
            ensure_buffers(rack_out, audio_outs.max(ENGINE_AUDIO_CHANNELS), n);
            chain_out.clear();

            {
                let mut ctx = ProcessContext {
                    audio_in: &plugin_in[..audio_ins],
                    audio_out: &mut rack_out[..audio_outs],
                    cv_in: &[],
                    cv_out: &mut [],
                    events_in: chain_in.events(),
                    events_out: chain_out,
                    time,
                    frames,
                };
                plugin.process(&mut ctx);
            }

            if audio_outs == 1 {
                let (left, right) = rack_out.split_at_mut(1);
                right[0][..n].copy_from_slice(&left[0][..n]);
            }
            if audio_ins == 0 {
                for (out, prior) in rack_out.iter_mut().zip(rack_in.iter()) {
                    mix_into(&mut out[..n], &prior[..n]);
                }
            }

            slot.peaks
                .update(&rack_in[..], &rack_out[..ENGINE_AUDIO_CHANNELS], n);

            if audio_outs > 0 || audio_ins == 0 {
                for (dest, source) in rack_in.iter_mut().zip(rack_out.iter()) {
                    dest[..n].copy_from_slice(&source[..n]);
                }
            }
            if has_event_out {
                std::mem::swap(chain_in, chain_out);
            }
        }

        for (c, output) in outputs.iter_mut().enumerate() {
            let end = n.min(output.len());
            match rack_in.get(c) {
                Some(source) => output[..end].copy_from_slice(&source[..end]),
                None => output[..end].fill(0.0),
            }
        }
        events_out.clear();
        for event in chain_in.events() {
            events_out.push(event.clone());
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_patchbay(
        &self,
        scratch: &mut ProcessScratch,
        routing: &Routing,
        inputs: &[Vec<f32>],
        outputs: &mut [Vec<f32>],
        events_in: &[EngineEvent],
        events_out: &mut EventBuffer,
        time: &TimeInfo,
        frames: u32,
    ) {
        let n = frames as usize;
        let count = (self.registry.count() as usize).min(routing.plugin_audio.len());
        let ProcessScratch {
            plugin_in,
            events_in: merged,
            plugin_out,
            plugin_events,
            ..
        } = scratch;

        if plugin_out.len() < count {
            plugin_out.resize_with(count, Vec::new);
        }
        if plugin_events.len() < count {
            plugin_events.resize_with(count, EventBuffer::new);
        }

        for id in 0..count {
            let Some(slot) = self.registry.slot(id as u32) else {
                continue;
            };
            let (audio_ins, audio_outs) = match slot.plugin.common().ports.try_read() {
                Some(ports) => (ports.audio_in.len(), ports.audio_out.len()),
                None => (0, 0),
            };
            ensure_buffers(&mut plugin_out[id], audio_outs, n);

            if !slot.plugin.is_enabled() {
                plugin_events[id].clear();
                slot.peaks.reset();
                continue;
            }

            ensure_buffers(plugin_in, audio_ins, n);
            let port_sources = &routing.plugin_audio[id];
            for (port, buffer) in plugin_in.iter_mut().take(audio_ins).enumerate() {
                let Some(sources) = port_sources.get(port) else {
                    continue;
                };
                for source in sources {
                    sum_source(buffer, source, inputs, plugin_out, n);
                }
            }

            merged.clear();
            if let Some(sources) = routing.plugin_events.get(id) {
                merge_events(merged, sources, events_in, plugin_events);
            }

            let own_out = &mut plugin_out[id];
            let own_events = &mut plugin_events[id];
            own_events.clear();
            {
                let mut ctx = ProcessContext {
                    audio_in: &plugin_in[..audio_ins],
                    audio_out: &mut own_out[..audio_outs],
                    cv_in: &[],
                    cv_out: &mut [],
                    events_in: merged.events(),
                    events_out: own_events,
                    time,
                    frames,
                };
                slot.plugin.process(&mut ctx);
            }
            slot.peaks
                .update(&plugin_in[..audio_ins], &own_out[..audio_outs], n);
        }

        for (channel, output) in outputs.iter_mut().enumerate() {
            let end = n.min(output.len());
            output[..end].fill(0.0);
            if let Some(sources) = routing.playback.get(channel) {
                for source in sources {
                    sum_source(&mut output[..end], source, inputs, plugin_out, end);
                }
            }
        }

        events_out.clear();
        merge_events(events_out, &routing.midi_out, events_in, plugin_events);
    }
}

fn sum_source(
    dest: &mut [f32],
    source: &AudioSource,
    inputs: &[Vec<f32>],
    plugin_out: &[Vec<Vec<f32>>],
    frames: usize,
) {
    let buffer = match *source {
        AudioSource::Capture(c) => inputs.get(c),
        AudioSource::Plugin { plugin, port } => plugin_out.get(plugin).and_then(|ports| ports.get(port)),
    };
    if let Some(buffer) = buffer {
        let end = frames.min(buffer.len()).min(dest.len());
        mix_into(&mut dest[..end], &buffer[..end]);
    }
}

fn merge_events(
    dest: &mut EventBuffer,
    sources: &[EventSource],
    events_in: &[EngineEvent],
    plugin_events: &[EventBuffer],
) {
    for source in sources {
        let events = match *source {
            EventSource::MidiIn => events_in,
            EventSource::Plugin(plugin) => match plugin_events.get(plugin) {
                Some(buffer) => buffer.events(),
                None => continue,
            },
        };
        for event in events {
            if !dest.push(event.clone()) {
                break;
            }
        }
    }
    if sources.len() > 1 {
        dest.sort();
    }
}
