//! Synthesis sessions.
//!
//! A [`SynthEngine`] is the library-level synthesizer instance: it holds the
//! shared sound bank, the synthesizer settings and a fixed pool of session
//! slots. Each [`Session`] it opens owns one input source, one decode state
//! and one `rustysynth` synthesizer, and produces stereo frames on demand.

mod session;
pub mod smf;

pub use session::Session;

use crate::config::PlayerConfig;
use crate::source::{Locator, SourceError};
use rustysynth::{SoundFont, Synthesizer, SynthesizerSettings};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Errors that can occur while opening or driving a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("content is not playable: {0}")]
    Unparsable(String),

    #[error("all {max} session slots are in use")]
    NoFreeSlots { max: usize },

    #[error("synthesizer error: {0}")]
    Synthesizer(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Outcome of one render call.
#[derive(Debug)]
pub enum StreamStatus {
    /// More frames will follow.
    Active,
    /// The media stream is exhausted.
    EndOfStream,
    /// A read failed before the request was filled. The next call retries.
    Underrun(SourceError),
}

/// Frames produced by one render call and why it stopped.
#[derive(Debug)]
pub struct Rendered {
    pub frames: usize,
    pub status: StreamStatus,
}

/// A source of stereo frames the player can drive.
///
/// [`Session`] is the real implementation; the trait is the seam the player
/// renders through.
pub trait FrameProducer: Send {
    /// Renders up to `left.len()` frames into the two channel buffers.
    ///
    /// Frames past the returned count are unspecified.
    fn render(&mut self, left: &mut [f32], right: &mut [f32]) -> Rendered;

    /// Queues one channel message for the next render call.
    fn write_event(&mut self, bytes: &[u8]) -> Result<(), SessionError>;

    /// Playable length, if the session has media.
    fn duration(&self) -> Option<Duration>;

    /// Media time of the current pass.
    fn position(&self) -> Duration;

    /// Sets the output level, 0 to 100.
    fn set_volume(&mut self, level: u8);

    /// Sets how many times the media plays; -1 repeats forever.
    fn set_loop_count(&mut self, count: i32) -> Result<(), SessionError>;
}

struct SlotPool {
    max: usize,
    active: AtomicUsize,
}

/// A claimed session slot, returned to the pool on drop.
pub(crate) struct SessionSlot {
    pool: Arc<SlotPool>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The library-level synthesizer instance sessions are opened against.
pub struct SynthEngine {
    sound_bank: Arc<SoundFont>,
    sample_rate: u32,
    maximum_polyphony: usize,
    enable_reverb_and_chorus: bool,
    slurp_threshold: u64,
    slots: Arc<SlotPool>,
}

impl SynthEngine {
    /// Creates an engine around an already loaded sound bank.
    ///
    /// # Arguments
    ///
    /// * `sound_bank` - Bank shared by every session, usually from
    ///   [`SoundBankRegistry`](crate::soundbank::SoundBankRegistry)
    /// * `config` - Output rate, polyphony and session limits
    pub fn new(sound_bank: Arc<SoundFont>, config: &PlayerConfig) -> Self {
        Self {
            sound_bank,
            sample_rate: config.sample_rate,
            maximum_polyphony: config.maximum_polyphony,
            enable_reverb_and_chorus: config.enable_reverb_and_chorus,
            slurp_threshold: config.slurp_threshold,
            slots: Arc::new(SlotPool {
                max: config.max_sessions,
                active: AtomicUsize::new(0),
            }),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of sessions currently open.
    pub fn active_sessions(&self) -> usize {
        self.slots.active.load(Ordering::Acquire)
    }

    /// Opens a session for the content named by `locator`.
    ///
    /// The source is opened, its layout parsed, and the whole stream scanned
    /// once to resolve the duration.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - All session slots are taken
    /// - The source cannot be opened or read
    /// - The content is not a playable MIDI file
    /// - The synthesizer rejects its settings
    pub fn open_session(&self, locator: Locator) -> Result<Session, SessionError> {
        let slot = self.acquire_slot()?;
        let source = locator.open(self.slurp_threshold)?;

        let mut settings = SynthesizerSettings::new(self.sample_rate as i32);
        settings.maximum_polyphony = self.maximum_polyphony;
        settings.enable_reverb_and_chorus = self.enable_reverb_and_chorus;
        let synth = Synthesizer::new(&self.sound_bank, &settings)
            .map_err(|e| SessionError::Synthesizer(format!("{:?}", e)))?;

        Session::open(synth, source, self.sample_rate, slot)
    }

    fn acquire_slot(&self) -> Result<SessionSlot, SessionError> {
        let mut active = self.slots.active.load(Ordering::Acquire);
        loop {
            if active >= self.slots.max {
                return Err(SessionError::NoFreeSlots {
                    max: self.slots.max,
                });
            }
            match self.slots.active.compare_exchange_weak(
                active,
                active + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(SessionSlot {
                        pool: Arc::clone(&self.slots),
                    })
                }
                Err(current) => active = current,
            }
        }
    }
}
