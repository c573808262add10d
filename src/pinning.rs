use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{LedgerError, LedgerResult};
use crate::models::UploadKey;
use crate::refund::quote_refund;
use crate::store::{LedgerStore, LedgerTx};
use crate::uploads::load_upload;
use crate::usage::load_usage;

/// key: pin-removal-state -> Requested -> Validated -> RefundComputed -> Committed | Aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PinRemovalState {
    Requested,
    Validated,
    RefundComputed,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct PinRemovalReceipt {
    pub key: UploadKey,
    pub refund: f64,
    pub refundable_hours: f64,
    pub released_bytes: u64,
    pub state: PinRemovalState,
}

struct PinRemoval {
    key: UploadKey,
    state: PinRemovalState,
}

impl PinRemoval {
    fn advance(&mut self, next: PinRemovalState) {
        debug!(key = %self.key, from = ?self.state, to = ?next, "pin removal transition");
        self.state = next;
    }
}

/// key: pin-removal -> delete upload, refund, release usage atomically
#[derive(Clone)]
pub struct PinRemovalService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl PinRemovalService {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Removes the upload, refunds unconsumed retention and releases its bytes. Either all
    /// three happen or none do.
    pub async fn remove_pin(
        &self,
        account: &str,
        identifier: &str,
        network: &str,
    ) -> LedgerResult<PinRemovalReceipt> {
        let mut removal = PinRemoval {
            key: UploadKey::new(account, identifier, network),
            state: PinRemovalState::Requested,
        };

        let mut tx = self.store.begin().await?;
        match self.run(tx.as_mut(), &mut removal).await {
            Ok(mut receipt) => {
                tx.commit().await?;
                removal.advance(PinRemovalState::Committed);
                receipt.state = removal.state;
                info!(
                    account,
                    identifier,
                    network,
                    refund = receipt.refund,
                    released_bytes = receipt.released_bytes,
                    "pin removed"
                );
                Ok(receipt)
            }
            Err(err) => {
                drop(tx);
                let reached = removal.state;
                removal.advance(PinRemovalState::Aborted);
                warn!(
                    account,
                    identifier,
                    network,
                    reached = ?reached,
                    error = err.kind(),
                    "pin removal aborted"
                );
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        tx: &mut dyn LedgerTx,
        removal: &mut PinRemoval,
    ) -> LedgerResult<PinRemovalReceipt> {
        let now = self.clock.now();
        let mut account = tx.account(&removal.key.account).await?;
        let mut usage = load_usage(tx, &removal.key.account).await?;
        let upload = load_upload(tx, &removal.key).await?;
        removal.advance(PinRemovalState::Validated);

        let quote = quote_refund(&upload, usage.tier, now)?;
        removal.advance(PinRemovalState::RefundComputed);

        if !tx.delete_upload(&removal.key).await? {
            return Err(LedgerError::not_found("upload", removal.key.to_string()));
        }
        if quote.amount > 0.0 {
            let account = account
                .as_mut()
                .ok_or_else(|| LedgerError::not_found("account", removal.key.account.as_str()))?;
            account.deposit(quote.amount)?;
            account.updated_at = now;
            tx.update_account(account).await?;
        }
        usage.release_bytes(upload.size_bytes)?;
        usage.updated_at = now;
        tx.update_usage(&usage).await?;

        Ok(PinRemovalReceipt {
            key: removal.key.clone(),
            refund: quote.amount,
            refundable_hours: quote.refundable_hours,
            released_bytes: upload.size_bytes,
            state: removal.state,
        })
    }
}
