/// Migrating twice on a clean DB must be idempotent.
///
/// DB-backed test, skipped if OTR_DATABASE_URL is not set.
#[tokio::test]
async fn migrate_idempotent_on_clean_db() -> anyhow::Result<()> {
    let url = match std::env::var(otr_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: OTR_DATABASE_URL not set");
            return Ok(());
        }
    };

    let pool = otr_db::connect(&url).await?;
    otr_db::migrate(&pool).await?;
    otr_db::migrate(&pool).await?;

    let st = otr_db::status(&pool).await?;
    assert!(st.ok);
    assert!(st.has_ledger_table);
    Ok(())
}
