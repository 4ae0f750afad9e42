//! midiplay - A real-time MIDI player.
//!
//! This library streams Standard MIDI Files, or events written live, through
//! a SoundFont synthesizer into a callback-driven audio output.

pub mod audio;
pub mod blit;
pub mod config;
pub mod player;
pub mod soundbank;
pub mod source;
pub mod synth;

// Re-export commonly used types
pub use audio::{export_to_wav, AudioTransport, ManualTransport, RodioTransport};
pub use blit::{BlitContext, BlitError, LockableImage, PixelReader, RgbaImage};
pub use config::{ConfigError, PlayerConfig};
pub use player::{Player, PlayerError, PlayerEvent, PlayerState};
pub use soundbank::{SoundBankError, SoundBankRegistry};
pub use source::{InputSource, Locator, SourceError, INTERACTIVE_LOCATOR};
pub use synth::{FrameProducer, SessionError, SynthEngine};
