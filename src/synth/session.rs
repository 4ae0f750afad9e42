use super::smf::{Sequencer, SmfError, SmfEvent, SmfLayout};
use super::{FrameProducer, Rendered, SessionError, SessionSlot, StreamStatus};
use crate::source::{InputSource, SourceError};
use midly::live::LiveEvent;
use midly::MidiMessage;
use rustysynth::Synthesizer;
use std::collections::VecDeque;
use std::time::Duration;

/// Master volume a new synthesizer starts with.
const FULL_SCALE_VOLUME: f32 = 0.5;

/// Decoded file content scheduled in output frames.
struct MediaStream {
    source: InputSource,
    layout: SmfLayout,
    sequencer: Sequencer,
    /// Next event and the frame it is due at.
    pending: Option<(u64, SmfEvent)>,
    /// Frame at which the current pass started.
    pass_start: u64,
    duration: Duration,
    /// Passes left after this one; -1 repeats forever.
    loops_remaining: i32,
}

impl MediaStream {
    fn open(mut source: InputSource) -> Result<Self, SessionError> {
        let layout = SmfLayout::parse(&mut source).map_err(|e| match e {
            SmfError::Source(e) => SessionError::Source(e),
            SmfError::Malformed(reason) => SessionError::Unparsable(reason),
        })?;

        let mut scan = Sequencer::new(&layout);
        while scan.next_event(&mut source)?.is_some() {}
        let duration = Duration::from_secs_f64(scan.elapsed());

        Ok(Self {
            sequencer: Sequencer::new(&layout),
            source,
            layout,
            pending: None,
            pass_start: 0,
            duration,
            loops_remaining: 0,
        })
    }

    fn next_due(&mut self, sample_rate: u32) -> Result<Option<(u64, SmfEvent)>, SourceError> {
        if self.pending.is_none() {
            if let Some((seconds, event)) = self.sequencer.next_event(&mut self.source)? {
                let frame = self.pass_start + (seconds * sample_rate as f64).round() as u64;
                self.pending = Some((frame, event));
            }
        }
        Ok(self.pending)
    }

    /// Starts another pass if the loop count allows it.
    ///
    /// A pass that rendered no frames is never repeated, since the next one
    /// would not advance either.
    fn rewind(&mut self, position: u64) -> bool {
        if self.loops_remaining == 0 || position == self.pass_start {
            return false;
        }
        if self.loops_remaining > 0 {
            self.loops_remaining -= 1;
        }
        self.sequencer = Sequencer::new(&self.layout);
        self.pending = None;
        self.pass_start = position;
        true
    }
}

/// Messages written by the caller, applied at the next render.
#[derive(Default)]
struct ControlStream {
    queue: VecDeque<(u8, MidiMessage)>,
}

/// One loaded piece of content and the synthesizer playing it.
///
/// A session has a media stream (content from a file or buffer), a control
/// stream (events written while it plays), or both. The control stream is
/// opened by the first [`write_event`](FrameProducer::write_event).
pub struct Session {
    synth: Synthesizer,
    media: Option<MediaStream>,
    control: Option<ControlStream>,
    sample_rate: u32,
    /// Frames rendered since the session opened.
    position: u64,
    _slot: SessionSlot,
}

impl Session {
    pub(super) fn open(
        synth: Synthesizer,
        source: Option<InputSource>,
        sample_rate: u32,
        slot: SessionSlot,
    ) -> Result<Self, SessionError> {
        let media = source.map(MediaStream::open).transpose()?;
        if let Some(media) = &media {
            tracing::debug!(
                tracks = media.layout.track_count(),
                duration_ms = media.duration.as_millis() as u64,
                "opened media stream"
            );
        }
        Ok(Self {
            synth,
            media,
            control: None,
            sample_rate,
            position: 0,
            _slot: slot,
        })
    }

    /// Returns true if the session plays file or buffer content.
    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }
}

impl FrameProducer for Session {
    fn render(&mut self, left: &mut [f32], right: &mut [f32]) -> Rendered {
        let frames = left.len().min(right.len());

        if let Some(control) = self.control.as_mut() {
            for (channel, message) in control.queue.drain(..) {
                send_message(&mut self.synth, channel, message);
            }
        }

        let mut done = 0;
        while done < frames {
            let Some(media) = self.media.as_mut() else {
                self.synth.render(&mut left[done..frames], &mut right[done..frames]);
                self.position += (frames - done) as u64;
                done = frames;
                break;
            };

            match media.next_due(self.sample_rate) {
                Ok(Some((frame, event))) if frame <= self.position => {
                    media.pending = None;
                    dispatch(&mut self.synth, &event);
                }
                Ok(Some((frame, _))) => {
                    let chunk = (frame - self.position).min((frames - done) as u64) as usize;
                    self.synth
                        .render(&mut left[done..done + chunk], &mut right[done..done + chunk]);
                    done += chunk;
                    self.position += chunk as u64;
                }
                Ok(None) => {
                    if media.rewind(self.position) {
                        self.synth.note_off_all(false);
                        continue;
                    }
                    return Rendered {
                        frames: done,
                        status: StreamStatus::EndOfStream,
                    };
                }
                Err(e) => {
                    return Rendered {
                        frames: done,
                        status: StreamStatus::Underrun(e),
                    }
                }
            }
        }

        Rendered {
            frames,
            status: StreamStatus::Active,
        }
    }

    fn write_event(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        let event =
            LiveEvent::parse(bytes).map_err(|e| SessionError::InvalidEvent(e.to_string()))?;
        match event {
            LiveEvent::Midi { channel, message } => {
                self.control
                    .get_or_insert_with(ControlStream::default)
                    .queue
                    .push_back((channel.as_int(), message));
                Ok(())
            }
            _ => Err(SessionError::InvalidEvent(
                "only channel messages can be written".into(),
            )),
        }
    }

    fn duration(&self) -> Option<Duration> {
        self.media.as_ref().map(|m| m.duration)
    }

    fn position(&self) -> Duration {
        let frames = match &self.media {
            Some(media) => self.position - media.pass_start,
            None => self.position,
        };
        Duration::from_secs_f64(frames as f64 / self.sample_rate as f64)
    }

    fn set_volume(&mut self, level: u8) {
        let level = level.min(100) as f32 / 100.0;
        self.synth.set_master_volume(level * FULL_SCALE_VOLUME);
    }

    fn set_loop_count(&mut self, count: i32) -> Result<(), SessionError> {
        if count == 0 || count < -1 {
            return Err(SessionError::InvalidArgument(format!(
                "loop count must be -1 or positive, got {}",
                count
            )));
        }
        if let Some(media) = self.media.as_mut() {
            media.loops_remaining = if count == -1 { -1 } else { count - 1 };
        }
        Ok(())
    }
}

fn dispatch(synth: &mut Synthesizer, event: &SmfEvent) {
    let Some(bytes) = event.channel_bytes() else {
        return;
    };
    if let Ok(LiveEvent::Midi { channel, message }) = LiveEvent::parse(bytes) {
        send_message(synth, channel.as_int(), message);
    }
}

fn send_message(synth: &mut Synthesizer, channel: u8, message: MidiMessage) {
    let channel = channel as i32;
    let (command, data1, data2) = match message {
        MidiMessage::NoteOff { key, vel } => (0x80, key.as_int() as i32, vel.as_int() as i32),
        MidiMessage::NoteOn { key, vel } => (0x90, key.as_int() as i32, vel.as_int() as i32),
        MidiMessage::Aftertouch { key, vel } => (0xA0, key.as_int() as i32, vel.as_int() as i32),
        MidiMessage::Controller { controller, value } => {
            (0xB0, controller.as_int() as i32, value.as_int() as i32)
        }
        MidiMessage::ProgramChange { program } => (0xC0, program.as_int() as i32, 0),
        MidiMessage::ChannelAftertouch { vel } => (0xD0, vel.as_int() as i32, 0),
        MidiMessage::PitchBend { bend } => {
            let raw = bend.0.as_int() as i32;
            (0xE0, raw & 0x7F, raw >> 7)
        }
    };
    synth.process_midi_message(channel, command, data1, data2);
}
