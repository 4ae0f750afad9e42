//! The audio transport seam.
//!
//! A transport owns an output stream and calls a [`RenderCallback`] on its own
//! thread whenever it needs more frames. The player registers its callback
//! through [`AudioTransport::open`] and drives the stream with the other
//! methods.

/// Shape of the stream a transport plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Frames requested per callback, where the transport lets us choose.
    pub frames_per_callback: usize,
}

/// Whether the transport should keep calling back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// What a callback reports for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackResult {
    /// Frames of real content written before any silence padding.
    pub produced: usize,
    pub action: CallbackAction,
}

/// Fills the transport's output buffer. Called on the audio thread.
pub trait RenderCallback: Send {
    /// Writes `output.len() / channels` interleaved frames into `output`.
    ///
    /// Every sample of `output` is written, padding with silence where there
    /// is no content. Must return in time proportional to the buffer size.
    fn on_audio_ready(&mut self, output: &mut [f32]) -> CallbackResult;
}

/// Errors reported by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open audio output: {0}")]
    Stream(#[from] rodio::StreamError),

    #[error("failed to start audio playback: {0}")]
    Play(#[from] rodio::PlayError),

    #[error("transport is not open")]
    NotOpen,

    #[error("transport is already open")]
    AlreadyOpen,

    #[error("transport rejected the request: {0}")]
    Rejected(String),
}

/// A callback-driven audio output.
pub trait AudioTransport {
    /// Creates the stream and registers `callback`. The stream starts paused.
    fn open(
        &mut self,
        format: StreamFormat,
        callback: Box<dyn RenderCallback>,
    ) -> Result<(), TransportError>;

    /// Starts or resumes callbacks.
    fn start(&mut self) -> Result<(), TransportError>;

    /// Suspends callbacks; the stream stays open.
    fn pause(&mut self) -> Result<(), TransportError>;

    /// Tears the stream down. Once this returns no callback is running and
    /// none will start.
    fn close(&mut self) -> Result<(), TransportError>;
}
