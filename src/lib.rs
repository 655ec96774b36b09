//! spindle: playback engine for a queue-based media player.
//!
//! Owns playback state transitions, the ordered track queue and its mutation
//! protocol, and durable cross-restart persistence of both. The decode/render
//! backend, UI, catalog and platform audio services are collaborators behind
//! the traits in [`playback::engine`].
//!
//! Components talk over a broadcast event bus: the coordinator consumes
//! commands and marshaled completions on a single thread, stores and fetchers
//! do their I/O on workers and only ever post messages back.

pub mod coordinator;
pub mod error;
pub mod listener;
pub mod playback;
pub mod protocol;
pub mod queue;
pub mod queue_store;
pub mod radio;
pub mod runtime;
pub mod state;
pub mod storage;
pub mod track;

#[cfg(test)]
mod test_support;

pub use coordinator::QueueCoordinator;
pub use error::{Error, Result};
pub use listener::{ListenerRegistry, Subscription};
pub use playback::{
    AlwaysWifi, EngineEvents, MediaEngine, MediaEngineFactory, NetworkMonitor, PlaybackController,
};
pub use protocol::{
    ControlMessage, EngineMessage, Message, PlayMode, PlaybackError, PlaybackState, PlayerEvent,
    QueueMessage, RadioMessage, SleepTimerAction, TimerMessage,
};
pub use queue::{Queue, MAX_SIZE};
pub use queue_store::{QueueStore, QueueStoreEvent};
pub use radio::{RadioCoordinator, RadioProvider, StationContext};
pub use runtime::{PlayerHandle, PlayerRuntime};
pub use state::{PersistedState, SleepTimerRecord, StateRecorder};
pub use storage::KvStore;
pub use track::{TrackDescriptor, TrackDescriptorBuilder};
