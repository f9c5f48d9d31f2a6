//! Audio-thread side of the LV2 adapter.
//!
//! Nothing here blocks: the process lock is only tried, parameter and program
//! tables are read with `try_read`, and changes reach the host as post-RT events.

use super::atom::{forge_time_position, patch_set_body};
use super::plugin::{parameter_atom, Lv2Plugin, RtState, UnitPorts};
use super::urid::{URID_ATOM_OBJECT, URID_MIDI_EVENT};
use crate::hints::{ParameterHints, PluginHints, PluginOptions};
use crate::parameter::{Parameter, PARAMETER_BALANCE_LEFT, PARAMETER_BALANCE_RIGHT, PARAMETER_DRYWET, PARAMETER_VOLUME};
use crate::plugin::{guard_native, Plugin, PostRtEvent, ProcessContext};
use cadenza_core::events::{
    MAX_MIDI_CONTROL, MIDI_CONTROL_ALL_NOTES_OFF, MIDI_CONTROL_ALL_SOUND_OFF,
    MIDI_CONTROL_BALANCE, MIDI_CONTROL_BREATH_CONTROLLER, MIDI_CONTROL_CHANNEL_VOLUME,
    MIDI_STATUS_CHANNEL_PRESSURE, MIDI_STATUS_CONTROL_CHANGE, MIDI_STATUS_NOTE_OFF,
    MIDI_STATUS_NOTE_ON, MIDI_STATUS_PITCH_WHEEL_CONTROL, MIDI_STATUS_POLYPHONIC_AFTERTOUCH,
};
use cadenza_core::{AtomicFloat, ControlEventType, EngineControlEvent, EngineEventKind};
use smallvec::SmallVec;

/// Dry/wet, volume and balance values carried by the reserved controllers.
fn internal_control(param: u16, normalized: f32) -> SmallVec<[(i32, f32); 2]> {
    let mut changes = SmallVec::new();
    match param {
        MIDI_CONTROL_BREATH_CONTROLLER => changes.push((PARAMETER_DRYWET, normalized)),
        MIDI_CONTROL_CHANNEL_VOLUME => changes.push((PARAMETER_VOLUME, normalized * 127.0 / 100.0)),
        MIDI_CONTROL_BALANCE => {
            let value = normalized / 0.5 - 1.0;
            let (left, right) = if value < 0.0 {
                (-1.0, value * 2.0 + 1.0)
            } else if value > 0.0 {
                (value * 2.0 - 1.0, 1.0)
            } else {
                (-1.0, 1.0)
            };
            changes.push((PARAMETER_BALANCE_LEFT, left));
            changes.push((PARAMETER_BALANCE_RIGHT, right));
        }
        _ => {}
    }
    changes
}

impl Lv2Plugin {
    pub(super) fn process_block(&self, ctx: &mut ProcessContext<'_>) {
        if !self.common.is_active() {
            ctx.silence();
            return;
        }
        let Some(mut guard) = self.rt.try_lock() else {
            ctx.silence();
            return;
        };
        let rt = &mut *guard;
        let frames = ctx.frames;
        if rt.units.is_empty()
            || rt.buffers.len() != rt.units.len()
            || frames as usize > rt.scratch.len()
        {
            ctx.silence();
            return;
        }

        let controls = self.controls.load();
        for buffers in rt.buffers.iter_mut() {
            buffers.reset_atoms();
        }

        if self.common.take_needs_reset() {
            self.write_reset_events(rt);
            if let Some(mut latency) = self.common.latency.try_lock() {
                latency.clear();
            }
        }

        self.write_transport(rt, ctx, &controls);
        self.drain_event_ring(rt);

        let options = self.common.options();
        let sample_accurate = !options.contains(PluginOptions::FIXED_BUFFERS);
        let mut offset = 0u32;
        let events = ctx.events_in;

        for event in events {
            if event.time >= frames {
                continue;
            }
            let mut time = event.time;
            if time < offset {
                tracing::warn!(
                    "Timing error, event time {} < offset {} for '{}'",
                    time,
                    offset,
                    self.info.uri
                );
                time = offset;
            }
            if sample_accurate && time > offset {
                self.process_single(rt, ctx, &controls, time - offset, offset);
                offset = time;
            }
            let frame = time - offset;

            match &event.kind {
                EngineEventKind::Control(ctrl) => {
                    self.handle_control_event(rt, &controls, event.channel, ctrl, frame, options);
                }
                EngineEventKind::Midi(midi) => {
                    self.handle_midi_event(rt, event.channel, midi.port, &midi.data, frame, options);
                }
            }
        }

        if frames > offset {
            self.process_single(rt, ctx, &controls, frames - offset, offset);
        }
    }

    /// All notes off and all sound off on every channel, or note-offs on the control channel.
    fn write_reset_events(&self, rt: &mut RtState) {
        let Some(ctrl) = rt.layout.ctrl_in.filter(|&i| rt.layout.events_in[i].midi) else {
            return;
        };
        let port = rt.layout.events_in[ctrl].port;
        let Some(sequence) = rt.buffers[0].atom_in_mut(port) else {
            return;
        };
        if self.common.options().contains(PluginOptions::SEND_ALL_SOUND_OFF) {
            for channel in 0..16u8 {
                let status = MIDI_STATUS_CONTROL_CHANGE | channel;
                sequence.append(0, URID_MIDI_EVENT, &[status, MIDI_CONTROL_ALL_NOTES_OFF as u8, 0]);
                sequence.append(0, URID_MIDI_EVENT, &[status, MIDI_CONTROL_ALL_SOUND_OFF as u8, 0]);
            }
        } else if let Ok(channel) = u8::try_from(self.common.ctrl_channel()) {
            for note in 0..128u8 {
                sequence.append(0, URID_MIDI_EVENT, &[MIDI_STATUS_NOTE_OFF | channel, note, 0]);
            }
        }
    }

    /// Time-designated control ports every block, `time:Position` when the transport jumped.
    fn write_transport(&self, rt: &mut RtState, ctx: &ProcessContext<'_>, controls: &[AtomicFloat]) {
        let time = ctx.time;
        let sample_rate = self.common.sample_rate();
        for &(port, field) in &rt.layout.time_ports {
            if let (Some(value), Some(control)) = (field.value(time, sample_rate), controls.get(port as usize)) {
                control.set(value);
            }
        }

        let changed = rt.first_run || !rt.last_time.compare_ignoring_rolling_frames(time, ctx.frames);
        rt.last_time = *time;
        rt.first_run = false;
        if !changed || !rt.layout.events_in.iter().any(|p| p.time) {
            return;
        }

        let position = forge_time_position(time);
        for port in rt.layout.events_in.iter().filter(|p| p.time) {
            if let Some(sequence) = rt.buffers[0].atom_in_mut(port.port) {
                if !sequence.append_atom(0, &position) {
                    tracing::error!("No room for transport position in '{}'", self.info.uri);
                }
            }
        }
    }

    /// Atoms queued from the UI and main thread, written at frame 0.
    fn drain_event_ring(&self, rt: &mut RtState) {
        while let Some(port) = rt.events_in.read_u32() {
            let Some(size) = rt.events_in.read_u32() else {
                rt.events_in.clear();
                break;
            };
            let size = size as usize;
            if size > rt.message.capacity() {
                tracing::error!("Event input message too large ({} bytes), dropping queue", size);
                rt.events_in.clear();
                break;
            }
            rt.message.resize(size, 0);
            if !rt.events_in.read_bytes(&mut rt.message) {
                rt.events_in.clear();
                break;
            }
            let Some(sequence) = rt.buffers[0].atom_in_mut(port) else {
                continue;
            };
            if !sequence.append_atom(0, &rt.message) {
                tracing::error!("Event input buffer full, at least 1 message lost");
            }
        }
    }

    fn handle_control_event(
        &self,
        rt: &mut RtState,
        controls: &[AtomicFloat],
        channel: u8,
        ctrl: &EngineControlEvent,
        frame: u32,
        options: PluginOptions,
    ) {
        let is_ctrl_channel = i16::from(channel) == i16::from(self.common.ctrl_channel());

        match ctrl.kind {
            ControlEventType::Parameter => {
                if is_ctrl_channel {
                    self.apply_internal_control(ctrl);
                }

                if let Some(params) = self.common.parameters.try_read() {
                    for (k, param) in params.iter().enumerate() {
                        if param.data.midi_channel != channel
                            || param.data.mapped_control_index != ctrl.param as i16
                            || !param.is_input()
                            || !param.has_hint(ParameterHints::IS_AUTOMABLE)
                        {
                            continue;
                        }
                        let value = param.value_from_normalized(ctrl.normalized_value);
                        self.set_parameter_at(rt, controls, k as u32, param, value, frame);
                    }
                }

                if options.contains(PluginOptions::SEND_CONTROL_CHANGES) && ctrl.param < MAX_MIDI_CONTROL {
                    self.write_midi(rt, 0, &ctrl.to_midi_data(channel), frame);
                }
            }
            ControlEventType::MidiBank => {
                if is_ctrl_channel && options.contains(PluginOptions::MAP_PROGRAM_CHANGES) {
                    rt.next_bank = u32::from(ctrl.param);
                } else if options.contains(PluginOptions::SEND_PROGRAM_CHANGES) {
                    self.write_midi(rt, 0, &ctrl.to_midi_data(channel), frame);
                }
            }
            ControlEventType::MidiProgram => {
                if is_ctrl_channel && options.contains(PluginOptions::MAP_PROGRAM_CHANGES) {
                    let bank = rt.next_bank;
                    let program = u32::from(ctrl.param);
                    let found = self
                        .common
                        .midi_programs
                        .try_read()
                        .and_then(|programs| programs.find(bank, program));
                    if let Some(index) = found {
                        for unit in rt.units.iter_mut() {
                            guard_native("programs.select_program", || {
                                if let Some(programs) = unit.programs() {
                                    programs.select_program(bank, program);
                                }
                            });
                        }
                        self.set_midi_program_rt(index as u32);
                    }
                } else if options.contains(PluginOptions::SEND_PROGRAM_CHANGES) {
                    self.write_midi(rt, 0, &ctrl.to_midi_data(channel), frame);
                }
            }
            ControlEventType::AllSoundOff | ControlEventType::AllNotesOff => {
                if options.contains(PluginOptions::SEND_ALL_SOUND_OFF) {
                    self.write_midi(rt, 0, &ctrl.to_midi_data(channel), frame);
                }
            }
        }
    }

    fn apply_internal_control(&self, ctrl: &EngineControlEvent) {
        let hints = self.common.hints();
        let post = &self.common.post_proc;
        for (index, value) in internal_control(ctrl.param, ctrl.normalized_value) {
            let target = match index {
                PARAMETER_DRYWET if hints.contains(PluginHints::CAN_DRYWET) => &post.dry_wet,
                PARAMETER_VOLUME if hints.contains(PluginHints::CAN_VOLUME) => &post.volume,
                PARAMETER_BALANCE_LEFT if hints.contains(PluginHints::CAN_BALANCE) => &post.balance_left,
                PARAMETER_BALANCE_RIGHT if hints.contains(PluginHints::CAN_BALANCE) => &post.balance_right,
                _ => continue,
            };
            target.set(value);
            self.common.postpone_rt_event(PostRtEvent::ParameterChange {
                index,
                value,
                send_callback: true,
            });
        }
    }

    /// Set a parameter from the audio thread; LV2 parameters also get a `patch:Set`.
    fn set_parameter_at(
        &self,
        rt: &mut RtState,
        controls: &[AtomicFloat],
        index: u32,
        param: &Parameter,
        value: f32,
        frame: u32,
    ) {
        let value = param.ranges.fix_value(value);
        let Ok(slot) = usize::try_from(param.data.rindex) else {
            return;
        };
        if let Some(control) = controls.get(slot) {
            control.set(value);
        }

        if let Some(position) = slot.checked_sub(rt.layout.port_count) {
            if let (Some(lv2_param), Some(&property), Some(port)) = (
                self.info.parameters.get(position),
                rt.layout.parameter_urids.get(position),
                rt.layout.ctrl_in_port(),
            ) {
                let (value_type, body) = parameter_atom(lv2_param.kind, value);
                if let Some(object) = patch_set_body(property, value_type, &body) {
                    if let Some(sequence) = rt.buffers[0].atom_in_mut(port) {
                        sequence.append(i64::from(frame), URID_ATOM_OBJECT, &object);
                    }
                }
            }
        }

        self.common.postpone_rt_event(PostRtEvent::ParameterChange {
            index: index as i32,
            value,
            send_callback: true,
        });
    }

    fn handle_midi_event(
        &self,
        rt: &mut RtState,
        channel: u8,
        port: u8,
        data: &[u8],
        frame: u32,
        options: PluginOptions,
    ) {
        let Some(&first) = data.first() else {
            return;
        };
        let mut status = first;
        match status {
            MIDI_STATUS_CHANNEL_PRESSURE if !options.contains(PluginOptions::SEND_CHANNEL_PRESSURE) => return,
            MIDI_STATUS_CONTROL_CHANGE if !options.contains(PluginOptions::SEND_CONTROL_CHANGES) => return,
            MIDI_STATUS_POLYPHONIC_AFTERTOUCH if !options.contains(PluginOptions::SEND_NOTE_AFTERTOUCH) => return,
            MIDI_STATUS_PITCH_WHEEL_CONTROL if !options.contains(PluginOptions::SEND_PITCHBEND) => return,
            _ => {}
        }
        if status == MIDI_STATUS_NOTE_ON && data.get(2) == Some(&0) {
            status = MIDI_STATUS_NOTE_OFF;
        }

        let mut bytes: SmallVec<[u8; 4]> = SmallVec::from_slice(data);
        if status < 0xF0 {
            bytes[0] = status | (channel & 0x0F);
        }
        self.write_midi(rt, port, &bytes, frame);

        match (status, data.get(1), data.get(2)) {
            (MIDI_STATUS_NOTE_ON, Some(&note), Some(&velocity)) => {
                self.common.postpone_rt_event(PostRtEvent::NoteOn {
                    channel,
                    note,
                    velocity,
                });
            }
            (MIDI_STATUS_NOTE_OFF, Some(&note), _) => {
                self.common
                    .postpone_rt_event(PostRtEvent::NoteOff { channel, note });
            }
            _ => {}
        }
    }

    /// Write a MIDI message to the plugin's MIDI input for engine port `port`.
    fn write_midi(&self, rt: &mut RtState, port: u8, data: &[u8], frame: u32) {
        let layout = &rt.layout;
        let Some(&index) = layout
            .midi_in
            .get(usize::from(port))
            .or_else(|| layout.midi_in.first())
        else {
            return;
        };
        let port = layout.events_in[index].port;
        if let Some(sequence) = rt.buffers[0].atom_in_mut(port) {
            if !sequence.append(i64::from(frame), URID_MIDI_EVENT, data) {
                tracing::trace!("MIDI input buffer full for '{}'", self.info.uri);
            }
        }
    }

    /// Run every unit over `frames` samples starting at `offset` in the block.
    fn process_single(
        &self,
        rt: &mut RtState,
        ctx: &mut ProcessContext<'_>,
        controls: &[AtomicFloat],
        frames: u32,
        offset: u32,
    ) {
        let span = frames as usize;
        let start = offset as usize;

        for channel in 0..rt.layout.logical_ins() {
            let Some((unit, port)) = rt.layout.audio_slot(channel, true) else {
                continue;
            };
            let Some(dest) = rt.buffers[unit].audio.get_mut(port as usize) else {
                continue;
            };
            match ctx.audio_in.get(channel) {
                Some(input) if input.len() >= start + span => {
                    dest[..span].copy_from_slice(&input[start..start + span]);
                }
                _ => dest[..span].fill(0.0),
            }
        }
        for (i, &port) in rt.layout.cv_in.iter().enumerate() {
            for buffers in rt.buffers.iter_mut() {
                let Some(dest) = buffers.audio.get_mut(port as usize) else {
                    continue;
                };
                match ctx.cv_in.get(i) {
                    Some(input) if input.len() >= start + span => {
                        dest[..span].copy_from_slice(&input[start..start + span]);
                    }
                    _ => dest[..span].fill(0.0),
                }
            }
        }

        if rt.buffers.len() > 1 {
            let (first, rest) = rt.buffers.split_at_mut(1);
            for other in rest.iter_mut() {
                for ((source, target), &is_input) in first[0]
                    .atoms
                    .iter()
                    .zip(other.atoms.iter_mut())
                    .zip(&first[0].atom_inputs)
                {
                    if let (true, Some(source), Some(target)) = (is_input, source, target) {
                        if !target.copy_from(source) {
                            tracing::trace!("Event input does not fit the second unit");
                        }
                    }
                }
            }
        }

        for (unit, buffers) in rt.units.iter_mut().zip(rt.buffers.iter_mut()) {
            let ran = guard_native("run", || {
                unit.run(
                    &mut UnitPorts {
                        buffers: &mut *buffers,
                        controls,
                    },
                    frames,
                );
            });
            if ran.is_none() {
                for buffer in buffers.audio.iter_mut() {
                    let end = span.min(buffer.len());
                    buffer[..end].fill(0.0);
                }
            }
        }

        for &(index, slot, default) in &rt.layout.triggers {
            let Some(control) = controls.get(slot) else {
                continue;
            };
            if control.get() != default {
                control.set(default);
                self.common.postpone_rt_event(PostRtEvent::ParameterChange {
                    index: index as i32,
                    value: default,
                    send_callback: true,
                });
            }
        }

        let outputs = rt.layout.logical_outs();
        for channel in 0..outputs {
            let Some((unit, port)) = rt.layout.audio_slot(channel, false) else {
                continue;
            };
            let (Some(source), Some(wet)) = (
                rt.buffers[unit].audio.get(port as usize),
                rt.wet.get_mut(channel),
            ) else {
                continue;
            };
            wet[..span].copy_from_slice(&source[..span]);
        }
        self.common.post_process(
            ctx.audio_in,
            start,
            &mut rt.wet[..outputs],
            ctx.audio_out,
            span,
            &mut rt.scratch,
        );

        for (i, &port) in rt.layout.cv_out.iter().enumerate() {
            let (Some(source), Some(dest)) = (rt.buffers[0].audio.get(port as usize), ctx.cv_out.get_mut(i)) else {
                continue;
            };
            if dest.len() >= start + span {
                dest[start..start + span].copy_from_slice(&source[..span]);
            }
        }

        self.flush_outputs(rt, ctx, controls, offset, span);

        if let Some(responses) = rt.worker_responses.as_mut() {
            if self.common.is_offline() {
                if let Some(mut worker) = self.worker.try_lock() {
                    if let Some(worker) = worker.as_mut() {
                        worker.run_pending();
                    }
                }
            }
            if let Some(unit) = rt.units.first_mut() {
                responses.drain(|data| unit.work_response(data));
            }
        }
        for unit in rt.units.iter_mut() {
            guard_native("end_run", || unit.end_run());
        }

        for buffers in rt.buffers.iter_mut() {
            buffers.reset_atoms();
        }
    }

    /// Plugin MIDI output to engine ports, other atoms to the UI, mapped outputs as CC.
    fn flush_outputs(
        &self,
        rt: &mut RtState,
        ctx: &mut ProcessContext<'_>,
        controls: &[AtomicFloat],
        offset: u32,
        span: usize,
    ) {
        let to_ui = self.ui_active.load(std::sync::atomic::Ordering::Acquire);
        let last_frame = span.saturating_sub(1) as i64;

        for (i, port) in rt.layout.events_out.iter().enumerate() {
            let Some(Some(sequence)) = rt.buffers[0].atoms.get(port.port as usize) else {
                continue;
            };
            let engine_port = rt.layout.midi_out.iter().position(|&m| m == i);
            for event in sequence.iter() {
                if event.atom.atom_type == URID_MIDI_EVENT {
                    let (Some(engine_port), Some(&status)) = (engine_port, event.atom.body.first()) else {
                        continue;
                    };
                    let time = offset + event.frames.clamp(0, last_frame) as u32;
                    ctx.events_out.write_midi_event(
                        time,
                        status & 0x0F,
                        engine_port as u8,
                        event.atom.body,
                    );
                } else if to_ui {
                    write_ui_atom(&mut rt.ui_out, port.port, event.atom.atom_type, event.atom.body);
                }
            }
        }

        if rt.layout.outputs.is_empty() {
            return;
        }
        let Some(params) = self.common.parameters.try_read() else {
            return;
        };
        for &(index, slot) in &rt.layout.outputs {
            let (Some(param), Some(control)) = (params.get(index as usize), controls.get(slot)) else {
                continue;
            };
            let Ok(cc) = u16::try_from(param.data.mapped_control_index) else {
                continue;
            };
            if cc >= MAX_MIDI_CONTROL {
                continue;
            }
            ctx.events_out.write_control_event(
                offset,
                param.data.midi_channel,
                ControlEventType::Parameter,
                cc,
                param.ranges.normalized_value(control.get()),
            );
        }
    }
}

fn write_ui_atom(ring: &mut cadenza_core::RingWriter, port: u32, atom_type: u32, body: &[u8]) {
    let size = (body.len() + 8) as u32;
    let written = ring.write_u32(port)
        && ring.write_u32(size)
        && ring.write_u32(body.len() as u32)
        && ring.write_u32(atom_type)
        && ring.write_bytes(body)
        && ring.commit_write();
    if !written {
        ring.discard();
        tracing::trace!("UI output buffer full, atom dropped");
    }
}
