pub mod config;
pub mod installer;
pub mod integrity;
pub mod manifest;
pub mod models;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod transport;
pub mod updater;
pub mod version;

mod worker;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::manifest::{ManifestService, ManifestSnapshot};
    pub use crate::models::{
        DownloadTask, EngineEvent, FailureKind, GameManifestEntry, InstallRecord, TaskKind,
        TaskStatus, UpdateState,
    };
    pub use crate::scheduler::{DownloadScheduler, SchedulerError};
    pub use crate::state::StateStore;
    pub use crate::transport::TransportClient;
    pub use crate::updater::{CheckOutcome, UpdateOrchestrator};
}
