//! Storage seam for the daemon.
//!
//! Handlers talk to a [`BookRepo`]; `PgRepo` is the production backing and
//! `MemoryRepo` keeps the same row semantics in process for tests and for
//! running without a database.

use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use otr_portfolio::{
    AccessContext, AccessRole, Journal, LedgerEntry, LongPosition, Micros, PortfolioBook,
    PortfolioSnapshot, RowId, ShortOptionLot,
};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait BookRepo: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn load_book(&self, owner: Uuid) -> Result<PortfolioBook>;

    /// Persist a journal atomically.
    async fn commit(&self, journal: &Journal) -> Result<()>;

    async fn snapshots(&self, owner: Uuid) -> Result<Vec<PortfolioSnapshot>>;

    async fn upsert_snapshot(
        &self,
        owner: Uuid,
        date: NaiveDate,
        total_equity: Micros,
        exchange_rate: f64,
    ) -> Result<PortfolioSnapshot>;

    async fn resolve_access(&self, owner: Uuid, actor: Uuid) -> Result<AccessContext>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgRepo {
    pool: PgPool,
}

impl PgRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookRepo for PgRepo {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn load_book(&self, owner: Uuid) -> Result<PortfolioBook> {
        otr_db::load_book(&self.pool, owner).await
    }

    async fn commit(&self, journal: &Journal) -> Result<()> {
        otr_db::commit_journal(&self.pool, journal).await.map(|_| ())
    }

    async fn snapshots(&self, owner: Uuid) -> Result<Vec<PortfolioSnapshot>> {
        otr_db::list_snapshots(&self.pool, owner).await
    }

    async fn upsert_snapshot(
        &self,
        owner: Uuid,
        date: NaiveDate,
        total_equity: Micros,
        exchange_rate: f64,
    ) -> Result<PortfolioSnapshot> {
        otr_db::upsert_snapshot(&self.pool, owner, date, total_equity, exchange_rate).await
    }

    async fn resolve_access(&self, owner: Uuid, actor: Uuid) -> Result<AccessContext> {
        otr_db::resolve_access(&self.pool, owner, actor).await
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct OwnerRows {
    ledger: BTreeMap<RowId, LedgerEntry>,
    longs: BTreeMap<RowId, LongPosition>,
    shorts: BTreeMap<RowId, ShortOptionLot>,
    snapshots: BTreeMap<NaiveDate, PortfolioSnapshot>,
}

#[derive(Default)]
pub struct MemoryRepo {
    owners: RwLock<HashMap<Uuid, OwnerRows>>,
    grants: RwLock<HashMap<(Uuid, Uuid), AccessRole>>,
    next_snapshot_id: RwLock<i64>,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn grant(&self, owner: Uuid, grantee: Uuid, role: AccessRole) -> Result<()> {
        if owner == grantee || role == AccessRole::Owner {
            bail!("grant: only editor or viewer can be granted to another user");
        }
        self.grants.write().await.insert((owner, grantee), role);
        Ok(())
    }
}

#[async_trait]
impl BookRepo for MemoryRepo {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn load_book(&self, owner: Uuid) -> Result<PortfolioBook> {
        let owners = self.owners.read().await;
        let Some(rows) = owners.get(&owner) else {
            return Ok(PortfolioBook::new(owner));
        };
        PortfolioBook::from_parts(
            owner,
            rows.ledger.values().cloned().collect(),
            rows.longs.values().cloned().collect(),
            rows.shorts.values().cloned().collect(),
        )
        .map_err(|e| anyhow!("stored book for owner={owner} is inconsistent: {e}"))
    }

    async fn commit(&self, journal: &Journal) -> Result<()> {
        let mut owners = self.owners.write().await;
        let rows = owners.entry(journal.owner_id).or_default();
        for id in &journal.ledger_deletes {
            rows.ledger.remove(id);
        }
        for p in &journal.long_upserts {
            rows.longs.insert(p.id, p.clone());
        }
        for id in &journal.short_deletes {
            rows.shorts.remove(id);
        }
        for l in &journal.short_upserts {
            rows.shorts.insert(l.id, l.clone());
        }
        for e in &journal.ledger_inserts {
            if rows.ledger.insert(e.id, e.clone()).is_some() {
                bail!("duplicate ledger id {} for owner={}", e.id, journal.owner_id);
            }
        }
        Ok(())
    }

    async fn snapshots(&self, owner: Uuid) -> Result<Vec<PortfolioSnapshot>> {
        Ok(self
            .owners
            .read()
            .await
            .get(&owner)
            .map(|r| r.snapshots.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_snapshot(
        &self,
        owner: Uuid,
        date: NaiveDate,
        total_equity: Micros,
        exchange_rate: f64,
    ) -> Result<PortfolioSnapshot> {
        if !(exchange_rate.is_finite() && exchange_rate > 0.0) {
            bail!("upsert_snapshot: exchange_rate must be positive, got {exchange_rate}");
        }
        let mut owners = self.owners.write().await;
        let rows = owners.entry(owner).or_default();
        let id = match rows.snapshots.get(&date) {
            Some(existing) => existing.id,
            None => {
                let mut next = self.next_snapshot_id.write().await;
                *next += 1;
                *next
            }
        };
        let snap = PortfolioSnapshot {
            id,
            owner_id: owner,
            snapshot_date: date,
            total_equity,
            exchange_rate,
        };
        rows.snapshots.insert(date, snap.clone());
        Ok(snap)
    }

    async fn resolve_access(&self, owner: Uuid, actor: Uuid) -> Result<AccessContext> {
        if owner == actor {
            return Ok(AccessContext::owner(owner));
        }
        match self.grants.read().await.get(&(owner, actor)) {
            Some(role) => Ok(AccessContext::delegated(owner, actor, *role)),
            None => Err(anyhow!("ACCESS_DENIED actor={actor} has no grant on owner={owner}")),
        }
    }
}
