//! The playback engine.
//!
//! A [`Player`] owns one synthesis session and one audio transport. Caller
//! methods run on the control thread and move the player through its states;
//! the transport thread renders through a [`RenderCallback`] bridge. Both sides
//! meet in a single mutex-guarded [`Inner`], which holds the state, the
//! session and the scratch buffers the callback renders into.
//!
//! `close()` always closes the transport before it releases the session, and
//! the callback only touches the session while the state says it is playing,
//! so no callback ever sees a released session.

use crate::audio::{
    AudioTransport, CallbackAction, CallbackResult, RenderCallback, StreamFormat, TransportError,
};
use crate::config::PlayerConfig;
use crate::source::Locator;
use crate::synth::{FrameProducer, SessionError, StreamStatus, SynthEngine};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    /// Created; no callback registered yet.
    Idle,
    /// Callback registered, waiting for the first rendered frames.
    Prefetching,
    Playing,
    /// Transport suspended; position retained.
    Paused,
    /// Reached the end of the media.
    Completed,
    /// Gave up after repeated read failures.
    Failed,
    Closing,
    Closed,
}

/// Notifications sent to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    Started,
    Paused,
    EndOfMedia,
    Error(String),
    Deallocated,
    Closed,
}

/// Errors returned by player operations.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: PlayerState,
    },

    #[error("cannot {operation} after deallocate")]
    Deallocated { operation: &'static str },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// State shared with the render callback.
struct Inner {
    state: PlayerState,
    session: Option<Box<dyn FrameProducer>>,
    left: Vec<f32>,
    right: Vec<f32>,
    /// Consecutive renders that hit a read failure.
    read_failures: u32,
    max_read_failures: u32,
    listeners: Vec<Sender<PlayerEvent>>,
}

impl Inner {
    fn notify(&mut self, event: PlayerEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Renders one callback's worth of frames into `output`.
    fn render_into(&mut self, output: &mut [f32], channels: usize, player_id: Uuid) -> CallbackResult {
        let frames = output.len() / channels;

        if !matches!(self.state, PlayerState::Prefetching | PlayerState::Playing) {
            output.fill(0.0);
            let action = match self.state {
                PlayerState::Paused if self.session.is_some() => CallbackAction::Continue,
                _ => CallbackAction::Stop,
            };
            return CallbackResult {
                produced: 0,
                action,
            };
        }

        let Some(session) = self.session.as_mut() else {
            output.fill(0.0);
            return CallbackResult {
                produced: 0,
                action: CallbackAction::Stop,
            };
        };

        // Only grows if the transport asks for more than it was primed with.
        if self.left.len() < frames {
            self.left.resize(frames, 0.0);
            self.right.resize(frames, 0.0);
        }
        let rendered = session.render(&mut self.left[..frames], &mut self.right[..frames]);
        let produced = rendered.frames.min(frames);
        interleave(
            &self.left[..produced],
            &self.right[..produced],
            output,
            channels,
        );
        output[produced * channels..].fill(0.0);

        match rendered.status {
            StreamStatus::Active => {
                self.read_failures = 0;
                if self.state == PlayerState::Prefetching && produced > 0 {
                    self.state = PlayerState::Playing;
                    self.notify(PlayerEvent::Started);
                }
                CallbackResult {
                    produced,
                    action: CallbackAction::Continue,
                }
            }
            StreamStatus::EndOfStream => {
                debug!(player = %player_id, produced, "end of media");
                self.state = PlayerState::Completed;
                self.notify(PlayerEvent::EndOfMedia);
                CallbackResult {
                    produced,
                    action: CallbackAction::Stop,
                }
            }
            StreamStatus::Underrun(e) => {
                self.read_failures += 1;
                warn!(
                    player = %player_id,
                    failures = self.read_failures,
                    produced,
                    error = %e,
                    "render underrun"
                );
                if self.read_failures >= self.max_read_failures {
                    self.state = PlayerState::Failed;
                    self.notify(PlayerEvent::Error(e.to_string()));
                    return CallbackResult {
                        produced,
                        action: CallbackAction::Stop,
                    };
                }
                if self.state == PlayerState::Prefetching && produced > 0 {
                    self.state = PlayerState::Playing;
                    self.notify(PlayerEvent::Started);
                }
                CallbackResult {
                    produced,
                    action: CallbackAction::Continue,
                }
            }
        }
    }
}

/// Writes planar stereo into an interleaved buffer of `channels` channels.
fn interleave(left: &[f32], right: &[f32], output: &mut [f32], channels: usize) {
    for (i, frame) in output.chunks_exact_mut(channels).take(left.len()).enumerate() {
        match frame {
            [mono] => *mono = (left[i] + right[i]) * 0.5,
            [l, r, rest @ ..] => {
                *l = left[i];
                *r = right[i];
                rest.fill(0.0);
            }
            [] => {}
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The callback handed to the transport.
struct CallbackBridge {
    shared: Arc<Shared>,
    channels: usize,
    player_id: Uuid,
}

impl RenderCallback for CallbackBridge {
    fn on_audio_ready(&mut self, output: &mut [f32]) -> CallbackResult {
        self.shared
            .lock()
            .render_into(output, self.channels, self.player_id)
    }
}

/// Plays one session through one transport.
pub struct Player {
    id: Uuid,
    shared: Arc<Shared>,
    transport: Box<dyn AudioTransport>,
    format: StreamFormat,
    transport_open: bool,
    deallocated: bool,
}

impl Player {
    /// Creates a player around an open session.
    ///
    /// # Arguments
    ///
    /// * `session` - The frame source; owned by the player from now on
    /// * `transport` - Output the player registers its callback with
    /// * `config` - Stream format and read-failure limit
    pub fn new(
        session: Box<dyn FrameProducer>,
        transport: Box<dyn AudioTransport>,
        config: &PlayerConfig,
    ) -> Self {
        let id = Uuid::new_v4();
        let format = StreamFormat {
            sample_rate: config.sample_rate,
            channels: config.channels.max(1),
            frames_per_callback: config.frames_per_callback,
        };
        debug!(player = %id, ?format, "created player");
        Self {
            id,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: PlayerState::Idle,
                    session: Some(session),
                    left: Vec::new(),
                    right: Vec::new(),
                    read_failures: 0,
                    max_read_failures: config.max_read_failures.max(1),
                    listeners: Vec::new(),
                }),
            }),
            transport,
            format,
            transport_open: false,
            deallocated: false,
        }
    }

    /// Opens a session for `locator` and creates a player for it.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::Session`] if the content cannot be opened. No
    /// audio has been produced when this fails.
    pub fn create(
        engine: &SynthEngine,
        locator: Locator,
        transport: Box<dyn AudioTransport>,
        config: &PlayerConfig,
    ) -> Result<Self, PlayerError> {
        let session = engine.open_session(locator)?;
        Ok(Self::new(Box::new(session), transport, config))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> PlayerState {
        self.shared.lock().state
    }

    pub fn is_deallocated(&self) -> bool {
        self.deallocated
    }

    /// Returns a receiver for this player's events.
    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        let (tx, rx) = mpsc::channel();
        self.shared.lock().listeners.push(tx);
        rx
    }

    /// Playable length of the media, if any.
    pub fn duration(&self) -> Option<Duration> {
        self.shared.lock().session.as_ref().and_then(|s| s.duration())
    }

    /// Current media time; zero once the session is released.
    pub fn position(&self) -> Duration {
        self.shared
            .lock()
            .session
            .as_ref()
            .map(|s| s.position())
            .unwrap_or_default()
    }

    /// Puts `previous` back if the state is still `current`.
    ///
    /// The callback may have finished playback in the meantime, and a
    /// terminal state is never overwritten.
    fn revert(&self, current: PlayerState, previous: PlayerState) {
        let mut inner = self.shared.lock();
        if inner.state == current {
            inner.state = previous;
        }
    }

    fn ensure_allocated(&self, operation: &'static str) -> Result<(), PlayerError> {
        if self.deallocated {
            return Err(PlayerError::Deallocated { operation });
        }
        Ok(())
    }

    /// Starts playback, or resumes it when paused.
    ///
    /// From `Idle` this registers the render callback with the transport,
    /// primes the scratch buffers and starts the stream. Calling it while
    /// already prefetching or playing does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::Transport`] unchanged if the transport fails,
    /// and [`PlayerError::InvalidState`] once playback has ended or the
    /// player is closed.
    pub fn prefetch(&mut self) -> Result<(), PlayerError> {
        self.ensure_allocated("prefetch")?;
        let mut inner = self.shared.lock();
        let state = inner.state;
        match state {
            PlayerState::Idle => {
                let frames = self.format.frames_per_callback;
                inner.left = vec![0.0; frames];
                inner.right = vec![0.0; frames];
                inner.state = PlayerState::Prefetching;
                drop(inner);

                if !self.transport_open {
                    let bridge = CallbackBridge {
                        shared: Arc::clone(&self.shared),
                        channels: self.format.channels as usize,
                        player_id: self.id,
                    };
                    if let Err(e) = self.transport.open(self.format, Box::new(bridge)) {
                        self.revert(PlayerState::Prefetching, PlayerState::Idle);
                        return Err(e.into());
                    }
                    self.transport_open = true;
                }
                if let Err(e) = self.transport.start() {
                    self.revert(PlayerState::Prefetching, PlayerState::Idle);
                    return Err(e.into());
                }
                info!(player = %self.id, "prefetching");
                Ok(())
            }
            PlayerState::Paused => {
                inner.state = PlayerState::Playing;
                drop(inner);

                if let Err(e) = self.transport.start() {
                    self.revert(PlayerState::Playing, PlayerState::Paused);
                    return Err(e.into());
                }
                self.shared.lock().notify(PlayerEvent::Started);
                info!(player = %self.id, "resumed");
                Ok(())
            }
            PlayerState::Prefetching | PlayerState::Playing => Ok(()),
            _ => Err(PlayerError::InvalidState {
                operation: "prefetch",
                state,
            }),
        }
    }

    /// Suspends playback, keeping the position.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::InvalidState`] without touching the transport
    /// unless the player is prefetching, playing or paused.
    pub fn pause(&mut self) -> Result<(), PlayerError> {
        self.ensure_allocated("pause")?;
        let mut inner = self.shared.lock();
        let state = inner.state;
        match state {
            PlayerState::Prefetching | PlayerState::Playing => {
                inner.state = PlayerState::Paused;
                drop(inner);

                if let Err(e) = self.transport.pause() {
                    self.revert(PlayerState::Paused, state);
                    return Err(e.into());
                }
                self.shared.lock().notify(PlayerEvent::Paused);
                info!(player = %self.id, "paused");
                Ok(())
            }
            PlayerState::Paused => Ok(()),
            _ => Err(PlayerError::InvalidState {
                operation: "pause",
                state,
            }),
        }
    }

    /// Queues one MIDI channel message for the next render.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::Session`] if the bytes are not a complete
    /// channel message, or a state error once the player is closing.
    pub fn write_event(&mut self, bytes: &[u8]) -> Result<(), PlayerError> {
        self.ensure_allocated("write event")?;
        let mut inner = self.shared.lock();
        if matches!(inner.state, PlayerState::Closing | PlayerState::Closed) {
            return Err(PlayerError::InvalidState {
                operation: "write event",
                state: inner.state,
            });
        }
        match inner.session.as_mut() {
            Some(session) => Ok(session.write_event(bytes)?),
            None => Err(PlayerError::InvalidState {
                operation: "write event",
                state: inner.state,
            }),
        }
    }

    /// Sets the output level, 0 to 100.
    pub fn set_volume(&mut self, level: u8) -> Result<(), PlayerError> {
        self.ensure_allocated("set volume")?;
        if let Some(session) = self.shared.lock().session.as_mut() {
            session.set_volume(level);
        }
        Ok(())
    }

    /// Sets how many times the media plays; -1 repeats forever.
    pub fn set_loop_count(&mut self, count: i32) -> Result<(), PlayerError> {
        self.ensure_allocated("set loop count")?;
        match self.shared.lock().session.as_mut() {
            Some(session) => Ok(session.set_loop_count(count)?),
            None => Ok(()),
        }
    }

    /// Stops playback and releases the session and the transport.
    ///
    /// Safe to call in any state and more than once. The transport is closed
    /// first, so no callback is running when the session is dropped.
    pub fn close(&mut self) {
        {
            let mut inner = self.shared.lock();
            if inner.state == PlayerState::Closed {
                return;
            }
            inner.state = PlayerState::Closing;
        }

        if self.transport_open {
            if let Err(e) = self.transport.close() {
                warn!(player = %self.id, error = %e, "failed to close transport");
            }
            self.transport_open = false;
        }

        let session = {
            let mut inner = self.shared.lock();
            inner.state = PlayerState::Closed;
            inner.notify(PlayerEvent::Closed);
            inner.listeners.clear();
            inner.session.take()
        };
        drop(session);
        info!(player = %self.id, "closed");
    }

    /// Releases the session without closing the transport.
    ///
    /// The stream is paused and the session dropped under the lock, so a
    /// callback that still runs finds no session and stops. Afterwards only
    /// [`close`](Self::close) is accepted.
    pub fn deallocate(&mut self) {
        if self.deallocated {
            return;
        }
        self.deallocated = true;

        let state = self.state();
        if self.transport_open && matches!(state, PlayerState::Prefetching | PlayerState::Playing) {
            if let Err(e) = self.transport.pause() {
                warn!(player = %self.id, error = %e, "failed to pause transport");
            }
        }

        let session = {
            let mut inner = self.shared.lock();
            if matches!(inner.state, PlayerState::Prefetching | PlayerState::Playing) {
                inner.state = PlayerState::Paused;
            }
            inner.notify(PlayerEvent::Deallocated);
            inner.session.take()
        };
        drop(session);
        info!(player = %self.id, "deallocated");
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ManualTransport;
    use crate::source::SourceError;
    use crate::synth::Rendered;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    /// What a scripted render call should do.
    #[derive(Clone, Copy)]
    enum Step {
        /// Fill the request with a constant.
        Full,
        /// Produce this many frames, then report end of stream.
        EndAfter(usize),
        /// Produce this many frames, then report a read failure.
        FailAfter(usize),
    }

    #[derive(Default)]
    struct Probe {
        renders: AtomicUsize,
        drops: AtomicUsize,
        released: AtomicBool,
        /// A render call is in progress.
        in_render: AtomicBool,
        /// Set by a test just before it calls `close`.
        closing: AtomicBool,
        /// Render calls still running when `closing` was set.
        overlaps: AtomicUsize,
    }

    /// A frame producer that follows a script and records its use.
    struct Scripted {
        steps: Vec<Step>,
        fallback: Step,
        probe: Arc<Probe>,
        /// Time each render call takes.
        delay: Duration,
    }

    impl Scripted {
        fn new(steps: Vec<Step>, fallback: Step) -> (Self, Arc<Probe>) {
            let probe = Arc::new(Probe::default());
            let producer = Self {
                steps: steps.into_iter().rev().collect(),
                fallback,
                probe: Arc::clone(&probe),
                delay: Duration::ZERO,
            };
            (producer, probe)
        }
    }

    impl FrameProducer for Scripted {
        fn render(&mut self, left: &mut [f32], right: &mut [f32]) -> Rendered {
            assert!(
                !self.probe.released.load(Ordering::SeqCst),
                "rendered after release"
            );
            self.probe.renders.fetch_add(1, Ordering::SeqCst);
            self.probe.in_render.store(true, Ordering::SeqCst);
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            if self.probe.closing.load(Ordering::SeqCst) {
                self.probe.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            assert!(
                !self.probe.released.load(Ordering::SeqCst),
                "released during render"
            );
            let step = self.steps.pop().unwrap_or(self.fallback);
            let (frames, status) = match step {
                Step::Full => (left.len(), StreamStatus::Active),
                Step::EndAfter(n) => (n.min(left.len()), StreamStatus::EndOfStream),
                Step::FailAfter(n) => (
                    n.min(left.len()),
                    StreamStatus::Underrun(SourceError::Io(std::io::Error::other("disk"))),
                ),
            };
            left[..frames].fill(0.25);
            right[..frames].fill(0.75);
            self.probe.in_render.store(false, Ordering::SeqCst);
            Rendered { frames, status }
        }

        fn write_event(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
            if bytes.first().is_some_and(|b| b & 0x80 != 0) {
                Ok(())
            } else {
                Err(SessionError::InvalidEvent("no status byte".into()))
            }
        }

        fn duration(&self) -> Option<Duration> {
            Some(Duration::from_secs(1))
        }

        fn position(&self) -> Duration {
            Duration::ZERO
        }

        fn set_volume(&mut self, _level: u8) {}

        fn set_loop_count(&mut self, _count: i32) -> Result<(), SessionError> {
            Ok(())
        }
    }

    impl Drop for Scripted {
        fn drop(&mut self) {
            self.probe.released.store(true, Ordering::SeqCst);
            self.probe.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> PlayerConfig {
        PlayerConfig {
            frames_per_callback: 1024,
            max_read_failures: 3,
            ..PlayerConfig::default()
        }
    }

    fn player(
        steps: Vec<Step>,
        fallback: Step,
    ) -> (Player, crate::audio::ManualTransportHandle, Arc<Probe>) {
        let (producer, probe) = Scripted::new(steps, fallback);
        let (transport, handle) = ManualTransport::new();
        let player = Player::new(Box::new(producer), Box::new(transport), &config());
        (player, handle, probe)
    }

    #[test]
    fn test_prefetch_then_first_render_plays() {
        let (mut player, handle, _) = player(vec![], Step::Full);
        let events = player.subscribe();
        assert_eq!(player.state(), PlayerState::Idle);

        player.prefetch().unwrap();
        assert_eq!(player.state(), PlayerState::Prefetching);
        assert_eq!(handle.format().unwrap().frames_per_callback, 1024);

        let (output, result) = handle.pull(1024).unwrap();
        assert_eq!(result.produced, 1024);
        assert_eq!(result.action, CallbackAction::Continue);
        assert_eq!(&output[..2], &[0.25, 0.75]);
        assert_eq!(player.state(), PlayerState::Playing);
        assert_eq!(events.try_recv(), Ok(PlayerEvent::Started));
    }

    #[test]
    fn test_short_render_pads_silence_and_stops_once() {
        let (mut player, handle, probe) = player(vec![Step::EndAfter(600)], Step::Full);
        let events = player.subscribe();
        player.prefetch().unwrap();

        let (output, result) = handle.pull(1024).unwrap();
        assert_eq!(result.produced, 600);
        assert_eq!(result.action, CallbackAction::Stop);
        assert!(output[..1200].iter().all(|&s| s != 0.0));
        assert!(output[1200..].iter().all(|&s| s == 0.0));
        assert_eq!(output.len() - 1200, 424 * 2);

        assert_eq!(player.state(), PlayerState::Completed);
        assert_eq!(events.try_recv(), Ok(PlayerEvent::EndOfMedia));

        // The transport stopped; nothing else renders.
        assert!(handle.pull(1024).is_none());
        assert_eq!(probe.renders.load(Ordering::SeqCst), 1);
        assert!(matches!(
            player.prefetch(),
            Err(PlayerError::InvalidState {
                state: PlayerState::Completed,
                ..
            })
        ));
    }

    #[test]
    fn test_pause_after_completion_keeps_terminal_state() {
        let (mut player, handle, _) = player(vec![Step::EndAfter(600)], Step::Full);
        player.prefetch().unwrap();
        handle.pull(1024).unwrap();
        assert_eq!(player.state(), PlayerState::Completed);

        assert!(matches!(
            player.pause(),
            Err(PlayerError::InvalidState {
                operation: "pause",
                state: PlayerState::Completed
            })
        ));
        assert_eq!(handle.calls().pause, 0);
        assert_eq!(player.state(), PlayerState::Completed);
        assert!(player.prefetch().is_err());
        assert_eq!(handle.calls().start, 1);
    }

    #[test]
    fn test_failed_resume_stays_paused() {
        let (mut player, handle, _) = player(vec![], Step::Full);
        player.prefetch().unwrap();
        handle.pull(1024).unwrap();
        player.pause().unwrap();

        handle.reject_next_start("device lost");
        assert!(matches!(
            player.prefetch(),
            Err(PlayerError::Transport(TransportError::Rejected(_)))
        ));
        assert_eq!(player.state(), PlayerState::Paused);
        assert!(handle.pull(1024).is_none());
    }

    #[test]
    fn test_pause_when_idle_is_state_error() {
        let (mut player, handle, _) = player(vec![], Step::Full);
        assert!(matches!(
            player.pause(),
            Err(PlayerError::InvalidState {
                operation: "pause",
                state: PlayerState::Idle
            })
        ));
        assert_eq!(handle.calls().pause, 0);
        assert_eq!(handle.calls().open, 0);
    }

    #[test]
    fn test_pause_and_resume() {
        let (mut player, handle, probe) = player(vec![], Step::Full);
        player.prefetch().unwrap();
        handle.pull(1024).unwrap();

        player.pause().unwrap();
        assert_eq!(player.state(), PlayerState::Paused);
        assert!(handle.pull(1024).is_none());
        assert_eq!(probe.renders.load(Ordering::SeqCst), 1);

        player.prefetch().unwrap();
        assert_eq!(player.state(), PlayerState::Playing);
        assert!(handle.pull(1024).is_some());
        assert_eq!(handle.calls().open, 1);
        assert_eq!(handle.calls().start, 2);
    }

    #[test]
    fn test_transport_error_surfaces_unchanged() {
        let (mut player, handle, _) = player(vec![], Step::Full);
        handle.reject_next_start("no device");
        assert!(matches!(
            player.prefetch(),
            Err(PlayerError::Transport(TransportError::Rejected(reason))) if reason == "no device"
        ));
        assert_eq!(player.state(), PlayerState::Idle);
        assert_eq!(handle.calls().start, 1);

        // The caller decides whether to retry.
        player.prefetch().unwrap();
        assert_eq!(player.state(), PlayerState::Prefetching);
    }

    #[test]
    fn test_underruns_are_padded_then_bounded() {
        let steps = vec![Step::FailAfter(100), Step::Full, Step::FailAfter(0)];
        let (mut player, handle, _) = player(steps, Step::FailAfter(0));
        let events = player.subscribe();
        player.prefetch().unwrap();

        let (output, result) = handle.pull(1024).unwrap();
        assert_eq!(result.produced, 100);
        assert_eq!(result.action, CallbackAction::Continue);
        assert!(output[200..].iter().all(|&s| s == 0.0));
        assert_eq!(player.state(), PlayerState::Playing);

        // A good render resets the count; three failures in a row end it.
        assert_eq!(handle.pull(1024).unwrap().1.action, CallbackAction::Continue);
        assert_eq!(handle.pull(1024).unwrap().1.action, CallbackAction::Continue);
        assert_eq!(handle.pull(1024).unwrap().1.action, CallbackAction::Continue);
        assert_eq!(handle.pull(1024).unwrap().1.action, CallbackAction::Stop);
        assert_eq!(player.state(), PlayerState::Failed);

        let received: Vec<_> = events.try_iter().collect();
        assert!(matches!(received.last(), Some(PlayerEvent::Error(_))));
        assert!(!received.contains(&PlayerEvent::EndOfMedia));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut player, handle, probe) = player(vec![], Step::Full);
        player.prefetch().unwrap();
        handle.pull(1024).unwrap();

        player.close();
        assert_eq!(player.state(), PlayerState::Closed);
        assert!(!handle.is_open());
        assert_eq!(probe.drops.load(Ordering::SeqCst), 1);

        player.close();
        drop(player);
        assert_eq!(probe.drops.load(Ordering::SeqCst), 1);
        assert_eq!(handle.calls().close, 1);
    }

    #[test]
    fn test_close_from_idle_skips_transport() {
        let (mut player, handle, probe) = player(vec![], Step::Full);
        player.close();
        assert_eq!(handle.calls().close, 0);
        assert_eq!(probe.drops.load(Ordering::SeqCst), 1);
        assert!(matches!(
            player.write_event(&[0x90, 60, 100]),
            Err(PlayerError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_close_races_callback() {
        let mut overlaps = 0;
        for _ in 0..20 {
            let (mut producer, probe) = Scripted::new(vec![], Step::Full);
            producer.delay = Duration::from_millis(2);
            let (transport, handle) = ManualTransport::new();
            let mut player = Player::new(Box::new(producer), Box::new(transport), &config());
            player.prefetch().unwrap();

            let audio = {
                let handle = handle.clone();
                thread::spawn(move || {
                    let mut output = vec![0.0f32; 256];
                    while handle.pull_into(&mut output).is_some() {
                        thread::yield_now();
                    }
                })
            };

            // Close only once a callback is running on the audio thread.
            while !probe.in_render.load(Ordering::SeqCst) {
                thread::yield_now();
            }
            probe.closing.store(true, Ordering::SeqCst);
            player.close();

            assert!(!probe.in_render.load(Ordering::SeqCst));
            let renders_at_close = probe.renders.load(Ordering::SeqCst);
            audio.join().unwrap();

            assert!(probe.released.load(Ordering::SeqCst));
            assert_eq!(probe.renders.load(Ordering::SeqCst), renders_at_close);
            assert!(handle.pull(128).is_none());
            overlaps += probe.overlaps.load(Ordering::SeqCst);
        }
        // close() had to wait out at least one render in flight.
        assert!(overlaps > 0);
    }

    #[test]
    fn test_deallocate_releases_session_only() {
        let (mut player, handle, probe) = player(vec![], Step::Full);
        player.prefetch().unwrap();
        handle.pull(1024).unwrap();

        player.deallocate();
        assert!(player.is_deallocated());
        assert_eq!(probe.drops.load(Ordering::SeqCst), 1);
        assert!(handle.is_open());
        assert_eq!(handle.calls().close, 0);

        assert!(matches!(
            player.prefetch(),
            Err(PlayerError::Deallocated { .. })
        ));
        assert!(matches!(player.pause(), Err(PlayerError::Deallocated { .. })));

        player.deallocate();
        player.close();
        assert_eq!(handle.calls().close, 1);
        assert_eq!(probe.drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_event_reaches_session() {
        let (mut player, _, _) = player(vec![], Step::Full);
        player.write_event(&[0x90, 60, 100]).unwrap();
        assert!(matches!(
            player.write_event(&[0x3C]),
            Err(PlayerError::Session(SessionError::InvalidEvent(_)))
        ));
    }

    #[test]
    fn test_mono_output_averages_channels() {
        let (producer, _) = Scripted::new(vec![], Step::Full);
        let (transport, handle) = ManualTransport::new();
        let config = PlayerConfig {
            channels: 1,
            ..config()
        };
        let mut player = Player::new(Box::new(producer), Box::new(transport), &config);
        player.prefetch().unwrap();

        let (output, result) = handle.pull(64).unwrap();
        assert_eq!(output.len(), 64);
        assert_eq!(result.produced, 64);
        assert!(output.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_plays_real_session() {
        use crate::synth::smf::tests::{note_track, smf};
        use crate::synth::tests::test_engine;

        let config = config();
        let engine = test_engine(&config);
        let (transport, handle) = ManualTransport::new();
        let mut player = Player::create(
            &engine,
            Locator::Memory(smf(0, 480, &[note_track(69, 240)])),
            Box::new(transport),
            &config,
        )
        .unwrap();
        assert_eq!(player.duration(), Some(Duration::from_millis(250)));

        player.prefetch().unwrap();
        let mut produced = 0;
        loop {
            let (_, result) = handle.pull(1024).unwrap();
            produced += result.produced;
            if result.action == CallbackAction::Stop {
                break;
            }
        }
        assert_eq!(produced, 11025);
        assert_eq!(player.state(), PlayerState::Completed);

        player.close();
        assert_eq!(engine.active_sessions(), 0);
    }
}
