//! Playback engine internals: the media-engine boundary, volume easing, and
//! the controller state machine.

pub mod controller;
pub mod engine;
pub mod volume;

pub use controller::PlaybackController;
pub use engine::{AlwaysWifi, EngineEvents, MediaEngine, MediaEngineFactory, NetworkMonitor};
