//! Media engine boundary.
//!
//! The component that actually opens a URI and produces audio is an external
//! collaborator; this crate only sequences when its operations happen. An
//! engine instance is created per track, exclusively owned by the playback
//! controller, and never reused after release. Its callbacks carry the
//! generation of the instance so late events from a released engine are
//! discarded on arrival.

use tokio::sync::broadcast::Sender;

use crate::protocol::{EngineMessage, Message};

/// One decode/render backend instance bound to a single source URI.
///
/// Dropping the box releases the backend; implementations clean up in `Drop`.
pub trait MediaEngine: Send {
    /// Begins asynchronous preparation; `prepared` fires on the event handle
    /// when the source is ready.
    fn prepare(&mut self) -> crate::Result<()>;
    fn start(&mut self);
    fn pause(&mut self);
    fn stop(&mut self);
    fn seek_to(&mut self, position_ms: u64);
    fn set_volume(&mut self, volume: f32);
    /// Native single-track looping; when enabled, the backend replays without
    /// reporting completion.
    fn set_looping(&mut self, looping: bool);
    fn position_ms(&self) -> u64;
    fn duration_ms(&self) -> u64;
    fn audio_session_id(&self) -> i32;
}

/// Creates engine instances for the controller.
pub trait MediaEngineFactory: Send {
    fn create(&self, source_uri: &str, events: EngineEvents) -> crate::Result<Box<dyn MediaEngine>>;
}

/// Handle an engine uses to report its callbacks. Cloneable and callable from
/// any thread; delivery is marshaled through the bus onto the controller
/// thread.
#[derive(Clone)]
pub struct EngineEvents {
    bus: Sender<Message>,
    generation: u64,
}

impl EngineEvents {
    pub(crate) fn new(bus: Sender<Message>, generation: u64) -> Self {
        Self { bus, generation }
    }

    fn post(&self, message: EngineMessage) {
        let _ = self.bus.send(Message::Engine(message));
    }

    pub fn prepared(&self, audio_session_id: i32) {
        self.post(EngineMessage::Prepared {
            generation: self.generation,
            audio_session_id,
        });
    }

    pub fn completed(&self) {
        self.post(EngineMessage::Completed {
            generation: self.generation,
        });
    }

    pub fn seek_complete(&self, position_ms: u64) {
        self.post(EngineMessage::SeekComplete {
            generation: self.generation,
            position_ms,
        });
    }

    pub fn stalled(&self, stalled: bool) {
        self.post(EngineMessage::Stalled {
            generation: self.generation,
            stalled,
        });
    }

    pub fn buffering_update(&self, percent: u8) {
        self.post(EngineMessage::BufferingUpdate {
            generation: self.generation,
            percent,
        });
    }

    pub fn error(&self, code: i32) {
        self.post(EngineMessage::Error {
            generation: self.generation,
            code,
        });
    }
}

/// Network availability detection is a platform collaborator.
pub trait NetworkMonitor: Send {
    fn is_wifi(&self) -> bool;
}

/// Monitor for deployments where the wifi-only policy can never trigger
/// (local files, wired devices).
pub struct AlwaysWifi;

impl NetworkMonitor for AlwaysWifi {
    fn is_wifi(&self) -> bool {
        true
    }
}
