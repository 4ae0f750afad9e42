//! Device output through rodio.
//!
//! rodio pulls samples through an iterator, so the render callback is wrapped
//! in a [`Source`] that calls it one buffer at a time and hands the samples
//! out individually.

use super::transport::{
    AudioTransport, CallbackAction, RenderCallback, StreamFormat, TransportError,
};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::time::Duration;

/// Audio source that pulls interleaved samples from a render callback.
struct CallbackSource {
    callback: Box<dyn RenderCallback>,
    format: StreamFormat,
    /// Interleaved samples of the last callback.
    buffer: Vec<f32>,
    /// Valid samples in the buffer.
    len: usize,
    /// Next sample to hand out.
    pos: usize,
    /// Set once the callback asked to stop.
    finished: bool,
}

impl CallbackSource {
    fn new(callback: Box<dyn RenderCallback>, format: StreamFormat) -> Self {
        let samples = format.frames_per_callback.max(1) * format.channels.max(1) as usize;
        Self {
            callback,
            format,
            buffer: vec![0.0; samples],
            len: 0,
            pos: 0,
            finished: false,
        }
    }
}

impl Iterator for CallbackSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.pos >= self.len {
            if self.finished {
                return None;
            }
            let result = self.callback.on_audio_ready(&mut self.buffer);
            self.pos = 0;
            self.len = match result.action {
                CallbackAction::Continue => self.buffer.len(),
                CallbackAction::Stop => {
                    // Play what was produced, then end the source.
                    self.finished = true;
                    (result.produced * self.format.channels.max(1) as usize).min(self.buffer.len())
                }
            };
            if self.len == 0 {
                return None;
            }
        }

        let sample = self.buffer[self.pos];
        self.pos += 1;
        Some(sample)
    }
}

impl Source for CallbackSource {
    fn current_frame_len(&self) -> Option<usize> {
        None // Continuous stream
    }

    fn channels(&self) -> u16 {
        self.format.channels
    }

    fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Plays through the default output device.
#[derive(Default)]
pub struct RodioTransport {
    /// Audio output stream (must be kept alive while playing).
    stream: Option<(OutputStream, OutputStreamHandle)>,
    sink: Option<Sink>,
}

impl RodioTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioTransport for RodioTransport {
    fn open(
        &mut self,
        format: StreamFormat,
        callback: Box<dyn RenderCallback>,
    ) -> Result<(), TransportError> {
        if self.sink.is_some() {
            return Err(TransportError::AlreadyOpen);
        }
        let (stream, handle) = OutputStream::try_default()?;
        let sink = Sink::try_new(&handle)?;
        sink.pause();
        sink.append(CallbackSource::new(callback, format));

        tracing::debug!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            "opened rodio output"
        );
        self.stream = Some((stream, handle));
        self.sink = Some(sink);
        Ok(())
    }

    fn start(&mut self) -> Result<(), TransportError> {
        let sink = self.sink.as_ref().ok_or(TransportError::NotOpen)?;
        sink.play();
        Ok(())
    }

    fn pause(&mut self) -> Result<(), TransportError> {
        let sink = self.sink.as_ref().ok_or(TransportError::NotOpen)?;
        sink.pause();
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let Some(sink) = self.sink.take() else {
            return Ok(());
        };
        sink.stop();
        drop(sink);
        // Dropping the stream shuts down the device thread.
        self.stream = None;
        tracing::debug!("closed rodio output");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::transport::CallbackResult;

    /// Counts down buffers of a constant value, then stops.
    struct Countdown {
        buffers: usize,
    }

    impl RenderCallback for Countdown {
        fn on_audio_ready(&mut self, output: &mut [f32]) -> CallbackResult {
            output.fill(0.5);
            if self.buffers == 0 {
                let half = output.len() / 4;
                output[half * 2..].fill(0.0);
                return CallbackResult {
                    produced: half,
                    action: CallbackAction::Stop,
                };
            }
            self.buffers -= 1;
            CallbackResult {
                produced: output.len() / 2,
                action: CallbackAction::Continue,
            }
        }
    }

    #[test]
    fn test_source_plays_produced_frames_then_ends() {
        let format = StreamFormat {
            sample_rate: 44100,
            channels: 2,
            frames_per_callback: 8,
        };
        let source = CallbackSource::new(Box::new(Countdown { buffers: 2 }), format);
        let samples: Vec<f32> = source.collect();
        // Two full buffers of 16 samples, then 4 frames of the last one.
        assert_eq!(samples.len(), 16 * 2 + 8);
        assert!(samples.iter().all(|&s| s == 0.5));
    }
}
