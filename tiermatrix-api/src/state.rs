use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tiermatrix_catalog::HierarchyConfig;
use tiermatrix_core::TierStore;
use tiermatrix_session::{DebouncedPriceEditor, EditSession, Reconciler, ReconcilerConfig};
use tiermatrix_shared::MatrixFlushedEvent;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub reconciler: ReconcilerConfig,
    pub debounce: Duration,
    pub hierarchy: HierarchyConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            reconciler: ReconcilerConfig::default(),
            debounce: Duration::from_millis(800),
            hierarchy: HierarchyConfig::default(),
        }
    }
}

/// An open edit session and the price editor bound to it.
#[derive(Clone)]
pub struct SessionHandle {
    pub session: Arc<Mutex<EditSession>>,
    pub editor: DebouncedPriceEditor,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TierStore>,
    pub sessions: Arc<RwLock<HashMap<Uuid, SessionHandle>>>,
    pub settings: EngineSettings,
    pub flush_tx: broadcast::Sender<MatrixFlushedEvent>,
}

impl AppState {
    pub fn new(store: Arc<dyn TierStore>, settings: EngineSettings) -> Self {
        let (flush_tx, _) = broadcast::channel(100);
        Self {
            store,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            settings,
            flush_tx,
        }
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.store.clone(), self.settings.reconciler.clone())
    }

    pub async fn register(&self, session: EditSession) -> (Uuid, SessionHandle) {
        let session = Arc::new(Mutex::new(session));
        let editor = DebouncedPriceEditor::new(session.clone(), self.store.clone(), self.settings.debounce);
        let handle = SessionHandle { session, editor };
        let id = Uuid::new_v4();
        self.sessions.write().await.insert(id, handle.clone());
        (id, handle)
    }

    pub async fn session(&self, id: Uuid) -> Result<SessionHandle, AppError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFoundError(format!("Session not found: {}", id)))
    }

    pub async fn close(&self, id: Uuid) -> Result<(), AppError> {
        self.sessions
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFoundError(format!("Session not found: {}", id)))
    }
}
