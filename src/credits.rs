use std::sync::Arc;

use tracing::info;

use crate::clock::Clock;
use crate::error::{LedgerError, LedgerResult};
use crate::models::Account;
use crate::store::{LedgerStore, LedgerTx};

impl Account {
    pub fn deposit(&mut self, amount: f64) -> LedgerResult<()> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(LedgerError::InvalidState(format!(
                "credit deposits must be finite and non-negative, got {amount}"
            )));
        }
        let next = self.credits + amount;
        if !next.is_finite() {
            return Err(LedgerError::Overflow(format!(
                "credit balance for `{}` overflows",
                self.name
            )));
        }
        self.credits = next;
        Ok(())
    }

    pub fn withdraw(&mut self, amount: f64) -> LedgerResult<()> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(LedgerError::InvalidState(format!(
                "credit withdrawals must be finite and non-negative, got {amount}"
            )));
        }
        if self.credits < amount {
            return Err(LedgerError::InsufficientBalance {
                account: self.name.clone(),
                requested: amount,
                available: self.credits,
            });
        }
        self.credits -= amount;
        Ok(())
    }
}

/// key: credit-ledger -> spendable balance per account
#[derive(Clone)]
pub struct CreditService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl CreditService {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn create_account(&self, name: &str) -> LedgerResult<Account> {
        let account = Account::new(name, self.clock.now());
        let mut tx = self.store.begin().await?;
        if !tx.insert_account(&account).await? {
            return Err(LedgerError::already_exists("account", name));
        }
        tx.commit().await?;
        info!(account = name, "account created");
        Ok(account)
    }

    pub async fn find_account(&self, name: &str) -> LedgerResult<Account> {
        let mut tx = self.store.begin().await?;
        load_account(tx.as_mut(), name).await
    }

    pub async fn close_account(&self, name: &str) -> LedgerResult<()> {
        let mut tx = self.store.begin().await?;
        if !tx.delete_account(name).await? {
            return Err(LedgerError::not_found("account", name));
        }
        tx.commit().await?;
        info!(account = name, "account closed");
        Ok(())
    }

    pub async fn get_credits(&self, name: &str) -> LedgerResult<f64> {
        Ok(self.find_account(name).await?.credits)
    }

    pub async fn add_credits(&self, name: &str, amount: f64) -> LedgerResult<Account> {
        let mut tx = self.store.begin().await?;
        let account = add_credits_in(tx.as_mut(), name, amount, self.clock.as_ref()).await?;
        tx.commit().await?;
        info!(account = name, amount, balance = account.credits, "credits added");
        Ok(account)
    }

    pub async fn remove_credits(&self, name: &str, amount: f64) -> LedgerResult<Account> {
        let mut tx = self.store.begin().await?;
        let account = remove_credits_in(tx.as_mut(), name, amount, self.clock.as_ref()).await?;
        tx.commit().await?;
        info!(account = name, amount, balance = account.credits, "credits removed");
        Ok(account)
    }
}

pub(crate) async fn load_account(tx: &mut dyn LedgerTx, name: &str) -> LedgerResult<Account> {
    tx.account(name)
        .await?
        .ok_or_else(|| LedgerError::not_found("account", name))
}

async fn add_credits_in(
    tx: &mut dyn LedgerTx,
    name: &str,
    amount: f64,
    clock: &dyn Clock,
) -> LedgerResult<Account> {
    let mut account = load_account(tx, name).await?;
    account.deposit(amount)?;
    account.updated_at = clock.now();
    tx.update_account(&account).await?;
    Ok(account)
}

async fn remove_credits_in(
    tx: &mut dyn LedgerTx,
    name: &str,
    amount: f64,
    clock: &dyn Clock,
) -> LedgerResult<Account> {
    let mut account = load_account(tx, name).await?;
    account.withdraw(amount)?;
    account.updated_at = clock.now();
    tx.update_account(&account).await?;
    Ok(account)
}
