use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{LedgerStore, LedgerTx};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{Account, Organization, UploadKey, UploadRecord, UsageLedger};

const UPLOAD_COLUMNS: &str = "id, account, identifier, kind, network, hold_time_months, \
    size_bytes, garbage_collect_deadline, file_name, file_name_lower, extension, encrypted, \
    directory, created_at, last_updated_at";

const USAGE_COLUMNS: &str = "account, tier, current_used_bytes, monthly_quota_bytes, \
    broadcast_messages_sent, naming_records_published, keys_created, claimed_external_name, \
    started_storage_trial, created_at, updated_at";

const UNIQUE_VIOLATION: &str = "23505";

/// key: postgres-store -> row-locked transactional backend
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> LedgerResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }
}

struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn usage(&mut self, account: &str) -> LedgerResult<Option<UsageLedger>> {
        let row = sqlx::query_as::<_, UsageRow>(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_ledgers WHERE account = $1 FOR UPDATE"
        ))
        .bind(account)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(UsageLedger::try_from).transpose()
    }

    async fn insert_usage(&mut self, usage: &UsageLedger) -> LedgerResult<bool> {
        let row = sqlx::query(
            r#"
            INSERT INTO usage_ledgers (
                account,
                tier,
                current_used_bytes,
                monthly_quota_bytes,
                broadcast_messages_sent,
                naming_records_published,
                keys_created,
                claimed_external_name,
                started_storage_trial,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (account) DO NOTHING
            RETURNING account
            "#,
        )
        .bind(&usage.account)
        .bind(usage.tier.as_str())
        .bind(to_i64(usage.current_used_bytes, "current_used_bytes")?)
        .bind(to_i64(usage.monthly_quota_bytes, "monthly_quota_bytes")?)
        .bind(to_i64(usage.broadcast_messages_sent, "broadcast_messages_sent")?)
        .bind(to_i64(usage.naming_records_published, "naming_records_published")?)
        .bind(to_i64(usage.keys_created, "keys_created")?)
        .bind(usage.claimed_external_name)
        .bind(usage.started_storage_trial)
        .bind(usage.created_at)
        .bind(usage.updated_at)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.is_some())
    }

    async fn update_usage(&mut self, usage: &UsageLedger) -> LedgerResult<()> {
        sqlx::query(
            r#"
            UPDATE usage_ledgers
            SET
                tier = $2,
                current_used_bytes = $3,
                monthly_quota_bytes = $4,
                broadcast_messages_sent = $5,
                naming_records_published = $6,
                keys_created = $7,
                claimed_external_name = $8,
                started_storage_trial = $9,
                updated_at = $10
            WHERE account = $1
            "#,
        )
        .bind(&usage.account)
        .bind(usage.tier.as_str())
        .bind(to_i64(usage.current_used_bytes, "current_used_bytes")?)
        .bind(to_i64(usage.monthly_quota_bytes, "monthly_quota_bytes")?)
        .bind(to_i64(usage.broadcast_messages_sent, "broadcast_messages_sent")?)
        .bind(to_i64(usage.naming_records_published, "naming_records_published")?)
        .bind(to_i64(usage.keys_created, "keys_created")?)
        .bind(usage.claimed_external_name)
        .bind(usage.started_storage_trial)
        .bind(usage.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn usage_accounts(&mut self) -> LedgerResult<Vec<String>> {
        let accounts =
            sqlx::query_scalar::<_, String>("SELECT account FROM usage_ledgers ORDER BY account")
                .fetch_all(&mut *self.tx)
                .await?;
        Ok(accounts)
    }

    async fn account(&mut self, name: &str) -> LedgerResult<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT name, credits, organization, created_at, updated_at FROM ledger_accounts WHERE name = $1 FOR UPDATE",
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Account::from))
    }

    async fn insert_account(&mut self, account: &Account) -> LedgerResult<bool> {
        let row = sqlx::query(
            r#"
            INSERT INTO ledger_accounts (name, credits, organization, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO NOTHING
            RETURNING name
            "#,
        )
        .bind(&account.name)
        .bind(account.credits)
        .bind(&account.organization)
        .bind(account.created_at)
        .bind(account.updated_at)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.is_some())
    }

    async fn update_account(&mut self, account: &Account) -> LedgerResult<()> {
        sqlx::query(
            "UPDATE ledger_accounts SET credits = $2, organization = $3, updated_at = $4 WHERE name = $1",
        )
        .bind(&account.name)
        .bind(account.credits)
        .bind(&account.organization)
        .bind(account.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_account(&mut self, name: &str) -> LedgerResult<bool> {
        let result = sqlx::query("DELETE FROM ledger_accounts WHERE name = $1")
            .bind(name)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upload(&mut self, key: &UploadKey) -> LedgerResult<Option<UploadRecord>> {
        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE account = $1 AND identifier = $2 AND network = $3 FOR UPDATE"
        ))
        .bind(&key.account)
        .bind(&key.identifier)
        .bind(&key.network)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(UploadRecord::try_from).transpose()
    }

    async fn insert_upload(&mut self, upload: &UploadRecord) -> LedgerResult<bool> {
        let row = sqlx::query(
            r#"
            INSERT INTO uploads (
                id,
                account,
                identifier,
                kind,
                network,
                hold_time_months,
                size_bytes,
                garbage_collect_deadline,
                file_name,
                file_name_lower,
                extension,
                encrypted,
                directory,
                created_at,
                last_updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (account, identifier, network) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(upload.id)
        .bind(&upload.account)
        .bind(&upload.identifier)
        .bind(upload.kind.as_str())
        .bind(&upload.network)
        .bind(to_i32(upload.hold_time_months)?)
        .bind(to_i64(upload.size_bytes, "size_bytes")?)
        .bind(upload.garbage_collect_deadline)
        .bind(&upload.file_name)
        .bind(&upload.file_name_lower)
        .bind(&upload.extension)
        .bind(upload.encrypted)
        .bind(upload.directory)
        .bind(upload.created_at)
        .bind(upload.last_updated_at)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.is_some())
    }

    async fn update_upload(
        &mut self,
        upload: &UploadRecord,
        expected_deadline: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE uploads
            SET
                hold_time_months = $4,
                garbage_collect_deadline = $5,
                last_updated_at = $6
            WHERE account = $1
              AND identifier = $2
              AND network = $3
              AND garbage_collect_deadline = $7
            "#,
        )
        .bind(&upload.account)
        .bind(&upload.identifier)
        .bind(&upload.network)
        .bind(to_i32(upload.hold_time_months)?)
        .bind(upload.garbage_collect_deadline)
        .bind(upload.last_updated_at)
        .bind(expected_deadline)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_upload(&mut self, key: &UploadKey) -> LedgerResult<bool> {
        let result = sqlx::query(
            "DELETE FROM uploads WHERE account = $1 AND identifier = $2 AND network = $3",
        )
        .bind(&key.account)
        .bind(&key.identifier)
        .bind(&key.network)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn uploads_by_network(&mut self, network: &str) -> LedgerResult<Vec<UploadRecord>> {
        let rows = sqlx::query_as::<_, UploadRow>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE network = $1 ORDER BY created_at, id"
        ))
        .bind(network)
        .fetch_all(&mut *self.tx)
        .await?;
        collect_uploads(rows)
    }

    async fn uploads_by_identifier(
        &mut self,
        identifier: &str,
    ) -> LedgerResult<Vec<UploadRecord>> {
        let rows = sqlx::query_as::<_, UploadRow>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE identifier = $1 ORDER BY created_at, id"
        ))
        .bind(identifier)
        .fetch_all(&mut *self.tx)
        .await?;
        collect_uploads(rows)
    }

    async fn uploads_for_account(&mut self, account: &str) -> LedgerResult<Vec<UploadRecord>> {
        let rows = sqlx::query_as::<_, UploadRow>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE account = $1 ORDER BY created_at, id"
        ))
        .bind(account)
        .fetch_all(&mut *self.tx)
        .await?;
        collect_uploads(rows)
    }

    async fn uploads_for_account_between(
        &mut self,
        account: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> LedgerResult<Vec<UploadRecord>> {
        let rows = sqlx::query_as::<_, UploadRow>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads \
             WHERE account = $1 AND COALESCE(last_updated_at, created_at) BETWEEN $2 AND $3 \
             ORDER BY created_at, id"
        ))
        .bind(account)
        .bind(from)
        .bind(to)
        .fetch_all(&mut *self.tx)
        .await?;
        collect_uploads(rows)
    }

    async fn uploads_expiring_before(
        &mut self,
        instant: DateTime<Utc>,
    ) -> LedgerResult<Vec<UploadRecord>> {
        let rows = sqlx::query_as::<_, UploadRow>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE garbage_collect_deadline < $1 ORDER BY created_at, id"
        ))
        .bind(instant)
        .fetch_all(&mut *self.tx)
        .await?;
        collect_uploads(rows)
    }

    async fn all_uploads(&mut self) -> LedgerResult<Vec<UploadRecord>> {
        let rows = sqlx::query_as::<_, UploadRow>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads ORDER BY created_at, id"
        ))
        .fetch_all(&mut *self.tx)
        .await?;
        collect_uploads(rows)
    }

    async fn organization(&mut self, name: &str) -> LedgerResult<Option<Organization>> {
        let row = sqlx::query_as::<_, OrganizationRow>(
            "SELECT name, owner, amount_owed, registered_members, created_at, updated_at FROM ledger_organizations WHERE name = $1 FOR UPDATE",
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Organization::from))
    }

    async fn organization_owned_by(&mut self, owner: &str) -> LedgerResult<Option<Organization>> {
        let row = sqlx::query_as::<_, OrganizationRow>(
            "SELECT name, owner, amount_owed, registered_members, created_at, updated_at FROM ledger_organizations WHERE owner = $1",
        )
        .bind(owner)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Organization::from))
    }

    async fn insert_organization(&mut self, organization: &Organization) -> LedgerResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO ledger_organizations (
                name,
                owner,
                amount_owed,
                registered_members,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO NOTHING
            RETURNING name
            "#,
        )
        .bind(&organization.name)
        .bind(&organization.owner)
        .bind(organization.amount_owed)
        .bind(&organization.registered_members)
        .bind(organization.created_at)
        .bind(organization.updated_at)
        .fetch_optional(&mut *self.tx)
        .await;

        match inserted {
            Ok(row) => Ok(row.is_some()),
            // name conflicts are absorbed above, so a unique violation is the owner
            Err(sqlx::Error::Database(err)) if err.code().as_deref() == Some(UNIQUE_VIOLATION) => Err(
                LedgerError::already_exists("organization owner", organization.owner.as_str()),
            ),
            Err(err) => Err(err.into()),
        }
    }

    async fn update_organization(&mut self, organization: &Organization) -> LedgerResult<()> {
        sqlx::query(
            r#"
            UPDATE ledger_organizations
            SET amount_owed = $2, registered_members = $3, updated_at = $4
            WHERE name = $1
            "#,
        )
        .bind(&organization.name)
        .bind(organization.amount_owed)
        .bind(&organization.registered_members)
        .bind(organization.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

fn to_i64(value: u64, field: &str) -> LedgerResult<i64> {
    i64::try_from(value).map_err(|_| LedgerError::Overflow(format!("{field} exceeds BIGINT")))
}

fn to_u64(value: i64, field: &str) -> LedgerResult<u64> {
    u64::try_from(value).map_err(|_| LedgerError::InvalidState(format!("negative {field} stored")))
}

fn to_i32(hold_time_months: u32) -> LedgerResult<i32> {
    i32::try_from(hold_time_months)
        .map_err(|_| LedgerError::Overflow("hold_time_months exceeds INTEGER".to_string()))
}

fn collect_uploads(rows: Vec<UploadRow>) -> LedgerResult<Vec<UploadRecord>> {
    rows.into_iter().map(UploadRecord::try_from).collect()
}

#[derive(FromRow)]
struct UsageRow {
    account: String,
    tier: String,
    current_used_bytes: i64,
    monthly_quota_bytes: i64,
    broadcast_messages_sent: i64,
    naming_records_published: i64,
    keys_created: i64,
    claimed_external_name: bool,
    started_storage_trial: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UsageRow> for UsageLedger {
    type Error = LedgerError;

    fn try_from(row: UsageRow) -> Result<Self, Self::Error> {
        Ok(UsageLedger {
            account: row.account,
            tier: row.tier.parse()?,
            current_used_bytes: to_u64(row.current_used_bytes, "current_used_bytes")?,
            monthly_quota_bytes: to_u64(row.monthly_quota_bytes, "monthly_quota_bytes")?,
            broadcast_messages_sent: to_u64(row.broadcast_messages_sent, "broadcast_messages_sent")?,
            naming_records_published: to_u64(
                row.naming_records_published,
                "naming_records_published",
            )?,
            keys_created: to_u64(row.keys_created, "keys_created")?,
            claimed_external_name: row.claimed_external_name,
            started_storage_trial: row.started_storage_trial,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct AccountRow {
    name: String,
    credits: f64,
    organization: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            name: row.name,
            credits: row.credits,
            organization: row.organization,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct UploadRow {
    id: Uuid,
    account: String,
    identifier: String,
    kind: String,
    network: String,
    hold_time_months: i32,
    size_bytes: i64,
    garbage_collect_deadline: DateTime<Utc>,
    file_name: Option<String>,
    file_name_lower: Option<String>,
    extension: Option<String>,
    encrypted: bool,
    directory: bool,
    created_at: DateTime<Utc>,
    last_updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<UploadRow> for UploadRecord {
    type Error = LedgerError;

    fn try_from(row: UploadRow) -> Result<Self, Self::Error> {
        Ok(UploadRecord {
            id: row.id,
            account: row.account,
            identifier: row.identifier,
            kind: row.kind.parse()?,
            network: row.network,
            hold_time_months: u32::try_from(row.hold_time_months).map_err(|_| {
                LedgerError::InvalidState("negative hold_time_months stored".to_string())
            })?,
            size_bytes: to_u64(row.size_bytes, "size_bytes")?,
            garbage_collect_deadline: row.garbage_collect_deadline,
            file_name: row.file_name,
            file_name_lower: row.file_name_lower,
            extension: row.extension,
            encrypted: row.encrypted,
            directory: row.directory,
            created_at: row.created_at,
            last_updated_at: row.last_updated_at,
        })
    }
}

#[derive(FromRow)]
struct OrganizationRow {
    name: String,
    owner: String,
    amount_owed: f64,
    registered_members: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<OrganizationRow> for Organization {
    fn from(row: OrganizationRow) -> Self {
        Organization {
            name: row.name,
            owner: row.owner,
            amount_owed: row.amount_owed,
            registered_members: row.registered_members,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
