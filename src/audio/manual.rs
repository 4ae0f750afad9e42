//! A transport driven by its caller.
//!
//! Nothing plays on its own: whoever holds a [`ManualTransportHandle`] pulls
//! buffers, from any thread. Used for offline rendering and to stand in for a
//! device in tests.

use super::transport::{
    AudioTransport, CallbackAction, CallbackResult, RenderCallback, StreamFormat, TransportError,
};
use std::sync::{Arc, Mutex, MutexGuard};

/// How often each transport operation was invoked.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransportCalls {
    pub open: usize,
    pub start: usize,
    pub pause: usize,
    pub close: usize,
}

#[derive(Default)]
struct Slot {
    callback: Option<Box<dyn RenderCallback>>,
    format: Option<StreamFormat>,
    running: bool,
    calls: TransportCalls,
    reject_next_start: Option<String>,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Transport whose callbacks run when a handle pulls them.
#[derive(Default)]
pub struct ManualTransport {
    slot: Arc<Mutex<Slot>>,
}

/// Pulls buffers from a [`ManualTransport`].
#[derive(Clone)]
pub struct ManualTransportHandle {
    slot: Arc<Mutex<Slot>>,
}

impl ManualTransport {
    /// Creates a transport and the handle that drives it.
    pub fn new() -> (Self, ManualTransportHandle) {
        let transport = Self::default();
        let handle = ManualTransportHandle {
            slot: Arc::clone(&transport.slot),
        };
        (transport, handle)
    }
}

impl ManualTransportHandle {
    /// Invokes the callback once into `output`.
    ///
    /// Returns `None` without calling anything if the transport is not
    /// running. A `Stop` result stops the transport, as a device would.
    pub fn pull_into(&self, output: &mut [f32]) -> Option<CallbackResult> {
        let mut slot = lock(&self.slot);
        if !slot.running {
            return None;
        }
        let callback = slot.callback.as_mut()?;
        let result = callback.on_audio_ready(output);
        if result.action == CallbackAction::Stop {
            slot.running = false;
        }
        Some(result)
    }

    /// Invokes the callback for `frames` frames into a new buffer.
    pub fn pull(&self, frames: usize) -> Option<(Vec<f32>, CallbackResult)> {
        let channels = self.format()?.channels as usize;
        let mut output = vec![0.0; frames * channels];
        let result = self.pull_into(&mut output)?;
        Some((output, result))
    }

    /// Format given at open, if open.
    pub fn format(&self) -> Option<StreamFormat> {
        lock(&self.slot).format
    }

    pub fn is_running(&self) -> bool {
        lock(&self.slot).running
    }

    /// Returns true while a callback is registered.
    pub fn is_open(&self) -> bool {
        lock(&self.slot).callback.is_some()
    }

    pub fn calls(&self) -> TransportCalls {
        lock(&self.slot).calls
    }

    /// Makes the next `start` fail with [`TransportError::Rejected`].
    pub fn reject_next_start(&self, reason: impl Into<String>) {
        lock(&self.slot).reject_next_start = Some(reason.into());
    }
}

impl AudioTransport for ManualTransport {
    fn open(
        &mut self,
        format: StreamFormat,
        callback: Box<dyn RenderCallback>,
    ) -> Result<(), TransportError> {
        let mut slot = lock(&self.slot);
        slot.calls.open += 1;
        if slot.callback.is_some() {
            return Err(TransportError::AlreadyOpen);
        }
        slot.callback = Some(callback);
        slot.format = Some(format);
        slot.running = false;
        Ok(())
    }

    fn start(&mut self) -> Result<(), TransportError> {
        let mut slot = lock(&self.slot);
        slot.calls.start += 1;
        if let Some(reason) = slot.reject_next_start.take() {
            return Err(TransportError::Rejected(reason));
        }
        if slot.callback.is_none() {
            return Err(TransportError::NotOpen);
        }
        slot.running = true;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), TransportError> {
        let mut slot = lock(&self.slot);
        slot.calls.pause += 1;
        if slot.callback.is_none() {
            return Err(TransportError::NotOpen);
        }
        slot.running = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        // Taking the lock waits out a pull in progress.
        let mut slot = lock(&self.slot);
        slot.calls.close += 1;
        slot.running = false;
        slot.format = None;
        let callback = slot.callback.take();
        drop(slot);
        drop(callback);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ones;

    impl RenderCallback for Ones {
        fn on_audio_ready(&mut self, output: &mut [f32]) -> CallbackResult {
            output.fill(1.0);
            CallbackResult {
                produced: output.len(),
                action: CallbackAction::Continue,
            }
        }
    }

    fn mono(frames: usize) -> StreamFormat {
        StreamFormat {
            sample_rate: 44100,
            channels: 1,
            frames_per_callback: frames,
        }
    }

    #[test]
    fn test_pull_only_while_running() {
        let (mut transport, handle) = ManualTransport::new();
        assert!(handle.pull(4).is_none());

        transport.open(mono(4), Box::new(Ones)).unwrap();
        assert!(handle.pull(4).is_none());

        transport.start().unwrap();
        let (output, result) = handle.pull(4).unwrap();
        assert_eq!(output, vec![1.0; 4]);
        assert_eq!(result.produced, 4);

        transport.pause().unwrap();
        assert!(handle.pull(4).is_none());

        transport.close().unwrap();
        assert!(!handle.is_open());
        assert!(transport.start().is_err());
        assert_eq!(
            handle.calls(),
            TransportCalls {
                open: 1,
                start: 2,
                pause: 1,
                close: 1
            }
        );
    }

    #[test]
    fn test_rejected_start() {
        let (mut transport, handle) = ManualTransport::new();
        transport.open(mono(4), Box::new(Ones)).unwrap();
        handle.reject_next_start("device busy");
        assert!(matches!(
            transport.start(),
            Err(TransportError::Rejected(reason)) if reason == "device busy"
        ));
        assert!(transport.start().is_ok());
    }
}
