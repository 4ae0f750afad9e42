//! Audio output.
//!
//! This module connects rendered frames to the outside world:
//! - The transport seam the player drives ([`AudioTransport`])
//! - Device playback via rodio
//! - A caller-driven transport for offline use and tests
//! - WAV export functionality

pub mod export;
pub mod manual;
pub mod rodio_out;
pub mod transport;

pub use export::export_to_wav;
pub use manual::{ManualTransport, ManualTransportHandle, TransportCalls};
pub use rodio_out::RodioTransport;
pub use transport::{
    AudioTransport, CallbackAction, CallbackResult, RenderCallback, StreamFormat, TransportError,
};
