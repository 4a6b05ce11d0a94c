use std::fs;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use uuid::Uuid;

fn write_csv(name: &str, body: &str) -> anyhow::Result<std::path::PathBuf> {
    let dir = std::env::temp_dir().join(format!("otr-cli-{}", Uuid::new_v4()));
    fs::create_dir_all(&dir)?;
    let path = dir.join(name);
    fs::write(&path, body)?;
    Ok(path)
}

/// `otr import --dry-run` applies the file to an empty book without a database.
#[test]
fn dry_run_import_reports_applied_rows() -> anyhow::Result<()> {
    let csv = write_csv(
        "trades.csv",
        "Date,Category,Action,Symbol,Qty,Price,Strike,Expiration,Option Type,Fees\n\
         2024-01-01,Cash,Deposit,,,10000,,,,\n\
         2024-01-02,Stock,Buy,AAPL,100,150,,,,1\n\
         2024-01-03,Short Option,STO,AAPL,1,2.50,160,2024-02-16,Call,0.65\n\
         2024-02-16,Short Option,Expired,AAPL,1,,160,2024-02-16,Call,\n",
    )?;

    let mut cmd = Command::cargo_bin("otr-cli")?;
    cmd.env_remove("OTR_DATABASE_URL")
        .args(["import", "--owner", &Uuid::new_v4().to_string(), "--file"])
        .arg(&csv)
        .arg("--dry-run");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("dry_run=true"))
        .stdout(predicate::str::contains("import_applied=4"))
        .stdout(predicate::str::contains("errors=0"))
        .stdout(predicate::str::contains("short_lots=0"));
    Ok(())
}

/// Bad rows are listed by line and do not stop the rest of the file.
#[test]
fn dry_run_import_lists_row_errors() -> anyhow::Result<()> {
    let csv = write_csv(
        "bad.csv",
        "date,category,action,symbol,qty,price\n\
         2024-01-02,Stock,Buy,MSFT,10,300\n\
         2024-13-45,Stock,Buy,MSFT,10,300\n\
         2024-01-05,Stock,Buy,MSFT,0,300\n",
    )?;

    let mut cmd = Command::cargo_bin("otr-cli")?;
    cmd.env_remove("OTR_DATABASE_URL")
        .args(["import", "--owner", &Uuid::new_v4().to_string(), "--file"])
        .arg(&csv)
        .arg("--dry-run");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("import_applied=1"))
        .stdout(predicate::str::contains("errors=2"))
        .stdout(predicate::str::contains("error row=3"))
        .stdout(predicate::str::contains("error row=4"));
    Ok(())
}

#[test]
fn import_rejects_a_malformed_owner() -> anyhow::Result<()> {
    let mut cmd = Command::cargo_bin("otr-cli")?;
    cmd.args(["import", "--owner", "not-a-uuid", "--file", "x.csv", "--dry-run"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("invalid owner uuid"));
    Ok(())
}
