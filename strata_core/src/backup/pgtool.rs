//! Drivers for `pg_dump` / `pg_restore` with explicit stdio plumbing.

use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::{Error, Result};

/// Lines of stderr preserved for restore warnings.
const WARNING_LINES: usize = 10;

/// Dump a database in custom format, capturing stdout fully.
pub async fn dump_database(conn_url: &str) -> Result<Vec<u8>> {
    let output = Command::new("pg_dump")
        .arg("-d")
        .arg(conn_url)
        .arg("--no-owner")
        .arg("--no-acl")
        .arg("-Fc")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::Internal(format!("spawn pg_dump: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Internal(format!(
            "pg_dump exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    if output.stdout.is_empty() {
        return Err(Error::Internal("pg_dump produced no output".to_string()));
    }
    Ok(output.stdout)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub warnings: Vec<String>,
}

/// Restore a custom-format dump, feeding it via stdin.
///
/// Exit code 0 is success; exit code 1 is success-with-warnings (pg_restore
/// reports ignorable errors this way under `--clean --if-exists`); anything
/// else is a failure carrying stderr.
pub async fn restore_database(conn_url: &str, dump: &[u8]) -> Result<RestoreOutcome> {
    let mut child = Command::new("pg_restore")
        .arg("-d")
        .arg(conn_url)
        .arg("--clean")
        .arg("--if-exists")
        .arg("--no-owner")
        .arg("--no-acl")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Internal(format!("spawn pg_restore: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Internal("pg_restore stdin unavailable".to_string()))?;
    stdin
        .write_all(dump)
        .await
        .map_err(|e| Error::Internal(format!("write pg_restore stdin: {e}")))?;
    drop(stdin);

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| Error::Internal(format!("wait pg_restore: {e}")))?;
    let stderr = String::from_utf8_lossy(&output.stderr);

    match output.status.code() {
        Some(0) => Ok(RestoreOutcome::default()),
        Some(1) => Ok(RestoreOutcome {
            warnings: stderr
                .lines()
                .take(WARNING_LINES)
                .map(|l| l.to_string())
                .collect(),
        }),
        _ => Err(Error::Internal(format!(
            "pg_restore exited with {}: {}",
            output.status,
            stderr.trim()
        ))),
    }
}
