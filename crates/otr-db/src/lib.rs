use anyhow::{anyhow, bail, Context, Result};
use otr_portfolio::{AccessContext, AccessRole};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

mod book;
mod snapshots;

pub use book::{commit_journal, load_book, CommitStats};
pub use snapshots::{list_snapshots, upsert_snapshot};

pub const ENV_DB_URL: &str = "OTR_DATABASE_URL";

/// Connect to Postgres using OTR_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_ledger_table: bool,
}

/// Connectivity + schema presence.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='ledger_entries'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_ledger_table: exists,
    })
}

// ---------------------------------------------------------------------------
// Account delegation
// ---------------------------------------------------------------------------

/// Give `grantee` editor or viewer access to `owner`'s portfolio. Re-granting
/// replaces the role.
pub async fn grant_access(pool: &PgPool, owner: Uuid, grantee: Uuid, role: AccessRole) -> Result<()> {
    if owner == grantee {
        bail!("grant_access: owner cannot be granted access to their own portfolio");
    }
    if role == AccessRole::Owner {
        bail!("grant_access: only editor or viewer can be granted");
    }
    sqlx::query(
        r#"
        insert into account_access (owner_id, grantee_id, role)
        values ($1, $2, $3)
        on conflict (owner_id, grantee_id) do update set role = excluded.role
        "#,
    )
    .bind(owner)
    .bind(grantee)
    .bind(role.as_str())
    .execute(pool)
    .await
    .context("grant_access failed")?;
    Ok(())
}

pub async fn revoke_access(pool: &PgPool, owner: Uuid, grantee: Uuid) -> Result<bool> {
    let res = sqlx::query("delete from account_access where owner_id = $1 and grantee_id = $2")
        .bind(owner)
        .bind(grantee)
        .execute(pool)
        .await
        .context("revoke_access failed")?;
    Ok(res.rows_affected() > 0)
}

/// Portfolios `actor` may open other than their own, with the granted role.
pub async fn accessible_owners(pool: &PgPool, actor: Uuid) -> Result<Vec<(Uuid, AccessRole)>> {
    let rows: Vec<(Uuid, String)> = sqlx::query_as(
        r#"
        select owner_id, role
        from account_access
        where grantee_id = $1
        order by granted_at_utc, owner_id
        "#,
    )
    .bind(actor)
    .fetch_all(pool)
    .await
    .context("accessible_owners failed")?;

    rows.into_iter()
        .map(|(owner, role)| Ok((owner, parse_role(&role)?)))
        .collect()
}

/// Build the access context for `actor` acting on `owner`'s portfolio.
/// Errors when a non-owner has no grant.
pub async fn resolve_access(pool: &PgPool, owner: Uuid, actor: Uuid) -> Result<AccessContext> {
    if owner == actor {
        return Ok(AccessContext::owner(owner));
    }
    let row: Option<(String,)> = sqlx::query_as(
        "select role from account_access where owner_id = $1 and grantee_id = $2",
    )
    .bind(owner)
    .bind(actor)
    .fetch_optional(pool)
    .await
    .context("resolve_access failed")?;

    match row {
        Some((role,)) => Ok(AccessContext::delegated(owner, actor, parse_role(&role)?)),
        None => Err(anyhow!("ACCESS_DENIED actor={actor} has no grant on owner={owner}")),
    }
}

fn parse_role(s: &str) -> Result<AccessRole> {
    AccessRole::parse(s).ok_or_else(|| anyhow!("invalid account_access.role '{s}'"))
}
