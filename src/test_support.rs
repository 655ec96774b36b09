//! Shared fakes for exercising the playback stack without a real backend.

use std::sync::{Arc, Mutex};

use crate::playback::engine::{EngineEvents, MediaEngine, MediaEngineFactory, NetworkMonitor};
use crate::track::TrackDescriptor;

/// Thread-safe call recorder shared between a factory and its engines.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, call: &str) -> bool {
        self.calls().iter().any(|c| c == call)
    }

    pub fn count_of(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }
}

pub struct FakeEngine {
    log: CallLog,
    duration_ms: u64,
    position_ms: u64,
}

impl MediaEngine for FakeEngine {
    fn prepare(&mut self) -> crate::Result<()> {
        self.log.push("prepare");
        Ok(())
    }

    fn start(&mut self) {
        self.log.push("start");
    }

    fn pause(&mut self) {
        self.log.push("engine_pause");
    }

    fn stop(&mut self) {
        self.log.push("engine_stop");
    }

    fn seek_to(&mut self, position_ms: u64) {
        self.log.push(format!("seek_to:{position_ms}"));
    }

    fn set_volume(&mut self, volume: f32) {
        self.log.push(format!("set_volume:{volume}"));
    }

    fn set_looping(&mut self, looping: bool) {
        self.log.push(format!("set_looping:{looping}"));
    }

    fn position_ms(&self) -> u64 {
        self.position_ms
    }

    fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    fn audio_session_id(&self) -> i32 {
        7
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.log.push("released");
    }
}

/// Factory producing [`FakeEngine`]s; keeps every handed-out [`EngineEvents`]
/// so tests can fire engine callbacks with the live generation.
pub struct FakeFactory {
    log: CallLog,
    events: Arc<Mutex<Vec<EngineEvents>>>,
    pub duration_ms: u64,
    pub fail: bool,
}

impl FakeFactory {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            events: Arc::new(Mutex::new(Vec::new())),
            duration_ms: 200_000,
            fail: false,
        }
    }

    /// Shared view of every handed-out event handle.
    pub fn events_handle(&self) -> Arc<Mutex<Vec<EngineEvents>>> {
        self.events.clone()
    }
}

impl MediaEngineFactory for FakeFactory {
    fn create(&self, source_uri: &str, events: EngineEvents) -> crate::Result<Box<dyn MediaEngine>> {
        if self.fail {
            return Err(crate::Error::EngineCreate(source_uri.to_string()));
        }
        self.log.push(format!("create:{source_uri}"));
        self.events.lock().unwrap().push(events);
        Ok(Box::new(FakeEngine {
            log: self.log.clone(),
            duration_ms: self.duration_ms,
            position_ms: 0,
        }))
    }
}

pub struct NoWifi;

impl NetworkMonitor for NoWifi {
    fn is_wifi(&self) -> bool {
        false
    }
}

/// Numbered test track with a stable identity.
pub fn numbered_track(n: usize) -> TrackDescriptor {
    TrackDescriptor::builder()
        .music_id(format!("m-{n}"))
        .title(format!("Track {n}"))
        .source_uri(format!("file:///tmp/{n}.mp3"))
        .identity(format!("id-{n}"))
        .duration_ms(200_000)
        .build()
}
