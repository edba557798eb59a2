use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tiermatrix_core::TierStore;
use tiermatrix_shared::{CellKey, PriceEditEvent, PriceEditOutcome, TierDraft, TierPatch, VariantId};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::session::EditSession;
use crate::SessionResult;

struct PendingCell {
    /// Explicit price of the cell before the burst started.
    original: Option<i64>,
    generation: u64,
    handle: JoinHandle<()>,
}

/// Per-cell debounced price persistence for saved variants.
///
/// Every keystroke updates the working copy at once and restarts the cell's
/// quiet period; when it expires the latest value is written with a single
/// store call. A failed write puts back the value from before the burst.
/// Until then the cell is held in the session, so a flush never writes it.
#[derive(Clone)]
pub struct DebouncedPriceEditor {
    session: Arc<Mutex<EditSession>>,
    store: Arc<dyn TierStore>,
    quiet_period: Duration,
    pending: Arc<Mutex<HashMap<CellKey, PendingCell>>>,
    events: broadcast::Sender<PriceEditEvent>,
}

impl DebouncedPriceEditor {
    pub fn new(session: Arc<Mutex<EditSession>>, store: Arc<dyn TierStore>, quiet_period: Duration) -> Self {
        let (events, _) = broadcast::channel(100);
        Self {
            session,
            store,
            quiet_period,
            pending: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PriceEditEvent> {
        self.events.subscribe()
    }

    pub async fn pending_cells(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Applies one keystroke's worth of price edit.
    ///
    /// Cells of unsaved variants go to the session changelog instead and are
    /// written by the next flush.
    pub async fn edit(&self, key: CellKey, price_cents: i64) -> SessionResult<()> {
        if let VariantId::Local(_) = key.variant_id {
            let mut session = self.session.lock().await;
            return session.set_price(key.variant_id, key.min_quantity, price_cents);
        }

        let previous = self
            .session
            .lock()
            .await
            .apply_price_optimistic(key, price_cents)?;

        let mut pending = self.pending.lock().await;
        let (original, generation) = match pending.remove(&key) {
            Some(cell) => {
                cell.handle.abort();
                (cell.original, cell.generation + 1)
            }
            None => (previous, 0),
        };

        let editor = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(editor.quiet_period).await;
            editor.commit(key, generation).await;
        });
        pending.insert(key, PendingCell { original, generation, handle });
        Ok(())
    }

    async fn commit(&self, key: CellKey, generation: u64) {
        let original = {
            let mut pending = self.pending.lock().await;
            match pending.get(&key) {
                Some(cell) if cell.generation == generation => {}
                _ => return,
            }
            match pending.remove(&key) {
                Some(cell) => cell.original,
                None => return,
            }
        };

        let Some(variant_id) = key.variant_id.persisted() else {
            return;
        };
        let (service_id, tier_id, price_cents) = {
            let mut session = self.session.lock().await;
            let price = session
                .working()
                .get(&key.variant_id)
                .and_then(|v| v.tier_at(key.min_quantity))
                .map(|t| t.price_cents);
            let Some(price) = price else {
                // variant or boundary went away during the quiet period
                session.release_cell(key);
                return;
            };
            (session.service_id(), session.persisted_tier(key), price)
        };

        let result = match tier_id {
            Some(tier_id) => {
                self.store
                    .update_tier(service_id, variant_id, tier_id, &TierPatch::price(price_cents))
                    .await
            }
            None => {
                let draft = TierDraft {
                    min_quantity: key.min_quantity,
                    price_cents,
                    is_active: true,
                };
                self.store.create_tier(service_id, variant_id, &draft).await
            }
        };

        let (outcome, error) = match result {
            Ok(tier) => {
                self.session.lock().await.confirm_cell(key, tier);
                self.store.invalidate_cache(service_id).await;
                info!("Saved price {} for cell {} @ {}", price_cents, key.variant_id, key.min_quantity);
                (PriceEditOutcome::Saved, None)
            }
            Err(e) => {
                self.session.lock().await.rollback_cell(key, original);
                warn!(
                    "Failed to save price for cell {} @ {}, rolled back: {}",
                    key.variant_id, key.min_quantity, e
                );
                (PriceEditOutcome::RolledBack, Some(e.to_string()))
            }
        };

        let event = PriceEditEvent {
            service_id,
            variant_id: key.variant_id,
            min_quantity: key.min_quantity,
            price_cents,
            outcome,
            error,
            timestamp: Utc::now().timestamp(),
        };
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}
