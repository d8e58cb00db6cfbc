//! Shared application state.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;

use crate::artifact::{ArtifactStore, LocalArtifactStore};
use crate::clock::Clock;
use crate::ledger::Ledger;
use crate::lifecycle::LifecycleEngine;
use crate::notifier::Notifier;
use crate::presence::InMemoryPresence;
use crate::push::PushSender;
use crate::server::config::Config;
use crate::sweeper::Sweeper;

pub struct AppState {
    pub engine: Arc<LifecycleEngine>,
    pub sweeper: Arc<Sweeper>,
    pub uploads: Arc<LocalArtifactStore>,
    pub max_audio_bytes: usize,
    pub started_at: Instant,
    pub ws_connections: AtomicUsize,
    next_connection_id: AtomicU64,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Open the ledger and upload directory under `config.data_dir` and wire
    /// the engine, notifier and sweeper together.
    pub fn open(
        config: &Config,
        clock: Arc<dyn Clock>,
        push: Arc<dyn PushSender>,
    ) -> anyhow::Result<SharedState> {
        let ledger = Arc::new(
            Ledger::open(&config.db_path())
                .with_context(|| format!("open ledger at {}", config.db_path().display()))?,
        );
        let uploads = Arc::new(
            LocalArtifactStore::open(&config.uploads_dir(), &config.public_url).with_context(
                || format!("open uploads at {}", config.uploads_dir().display()),
            )?,
        );
        let artifacts: Arc<dyn ArtifactStore> = uploads.clone();

        let notifier = Arc::new(Notifier::new(
            Arc::clone(&ledger),
            Arc::new(InMemoryPresence::new()),
            push,
        ));
        let engine = Arc::new(LifecycleEngine::new(
            Arc::clone(&ledger),
            Arc::clone(&artifacts),
            Arc::clone(&notifier),
            Arc::clone(&clock),
            config.max_audio_bytes,
        ));
        let sweeper = Arc::new(Sweeper::new(
            ledger,
            artifacts,
            notifier,
            clock,
            config.sweeper(),
        ));

        Ok(Arc::new(AppState {
            engine,
            sweeper,
            uploads,
            max_audio_bytes: config.max_audio_bytes,
            started_at: Instant::now(),
            ws_connections: AtomicUsize::new(0),
            next_connection_id: AtomicU64::new(0),
        }))
    }

    pub fn next_connection_id(&self) -> String {
        format!("conn-{}", self.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }
}
