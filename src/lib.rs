pub mod backoff;
pub mod config;
pub mod delta;
pub mod detector;
pub mod device;
pub mod engine;
pub mod error;
pub mod history;
pub mod protocol;
pub mod queue;
pub mod resolver;
pub mod sealed;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod transport;
pub mod watcher;

pub use backoff::BackoffPolicy;
pub use config::SyncSettings;
pub use detector::{classify, SyncVerdict};
pub use device::{DeviceIdentity, DeviceRecord, DeviceRegistry};
pub use engine::{EngineHandle, SyncEngine, SyncOutcome, SyncStats};
pub use error::{ErrorClass, SyncError, SyncResult};
pub use history::{ChangeType, HistoryEntry, HistoryLog};
pub use protocol::{ManualChoice, SyncEvent};
pub use resolver::ResolutionStrategy;
pub use sealed::{PayloadSealer, SealKey};
pub use snapshot::{ConfigSnapshot, DeviceId};
pub use state::{SyncDirection, SyncReport, SyncState, TriggerKind};
pub use store::{FileStore, LocalStore, MemoryStore};
pub use transport::{InMemoryStore, InMemoryTransport, SyncTransport};
pub use watcher::ConfigWatcher;
