//! Issuing SQL to fleet servers.
//!
//! The fleet never speaks a wire protocol itself. Queries go through a [SqlClient]; the shipped
//! one drives the engine's command-line client in batch mode.

use std::{fmt, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use fleet_utils::exit::ExitCode;
use thiserror::Error;

use crate::{engine::LOCALHOST, instance::ServerInfo};

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("{server} has no ports; it was never started")]
    NotStarted { server: String },

    #[error("could not run the SQL client for {server}: {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("query on {server} did not finish within {timeout:?}")]
    Timeout { server: String, timeout: Duration },

    #[error("query on {server} failed with code {code}: {stderr}")]
    Failed {
        server: String,
        code: ExitCode,
        stderr: String,
    },

    #[error("malformed result from {server}: {reason}")]
    Malformed { server: String, reason: String },
}

/// Rows returned by a query. Every value is the client's textual rendering of the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// The value of column `name` in row `row`.
    pub fn get(&self, row: usize, name: &str) -> Option<&str> {
        let column = self.column_index(name)?;
        self.rows.get(row)?.get(column).map(String::as_str)
    }

    /// Parses the tab-separated output of a batch-mode client, whose first line names the
    /// columns.
    pub fn parse_batch(output: &str) -> Result<Self, String> {
        let mut lines = output.lines();
        let columns: Vec<String> = match lines.next() {
            Some(header) => header.split('\t').map(str::to_owned).collect(),
            None => return Ok(Self::default()),
        };

        let mut rows = vec![];
        for (n, line) in lines.enumerate() {
            let row: Vec<String> = line.split('\t').map(unescape).collect();
            if row.len() != columns.len() {
                return Err(format!(
                    "row {} has {} values, expected {}",
                    n + 1,
                    row.len(),
                    columns.len()
                ));
            }
            rows.push(row);
        }
        Ok(Self { columns, rows })
    }
}

/// Reverses the escaping batch mode applies to tabs, newlines and backslashes in values.
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

impl fmt::Display for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.columns.join("\t"))?;
        for row in &self.rows {
            writeln!(f, "{}", row.join("\t"))?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait SqlClient: Send + Sync {
    async fn query(&self, server: &ServerInfo, sql: &str) -> Result<ResultSet, SqlError>;
}

/// Queries servers through the `mysql` command-line client.
#[derive(Debug, Clone)]
pub struct MysqlCliClient {
    binary: PathBuf,
    timeout: Duration,
}

impl Default for MysqlCliClient {
    fn default() -> Self {
        Self::new("mysql", Duration::from_secs(60))
    }
}

impl MysqlCliClient {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn command(&self, port: u16, sql: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args([
            "--no-defaults",
            "--user=root",
            "--batch",
            "--connect-timeout=5",
        ])
        .arg(format!("--host={LOCALHOST}"))
        .arg(format!("--port={port}"))
        .arg("--protocol=tcp")
        .arg(format!("--execute={sql}"))
        .stdin(Stdio::null())
        .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl SqlClient for MysqlCliClient {
    async fn query(&self, server: &ServerInfo, sql: &str) -> Result<ResultSet, SqlError> {
        let name = || server.name.clone();
        let ports = server.ports.ok_or_else(|| SqlError::NotStarted { server: name() })?;

        tracing::trace!(server=%server.name, sql, "query");
        let output = tokio::time::timeout(self.timeout, self.command(ports.first(), sql).output())
            .await
            .map_err(|_| SqlError::Timeout {
                server: name(),
                timeout: self.timeout,
            })?
            .map_err(|source| SqlError::Spawn {
                server: name(),
                source,
            })?;

        if !output.status.success() {
            return Err(SqlError::Failed {
                server: name(),
                code: output.status.into(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        ResultSet::parse_batch(&stdout).map_err(|reason| SqlError::Malformed {
            server: name(),
            reason,
        })
    }
}

#[cfg(test)]
mod test {
    use super::ResultSet;

    #[test]
    fn parse_batch_output() {
        let rs = ResultSet::parse_batch(
            "File\tPosition\tBinlog_Do_DB\nmysql-bin.000003\t1547\t\n",
        )
        .unwrap();
        assert_eq!(rs.columns, vec!["File", "Position", "Binlog_Do_DB"]);
        assert_eq!(rs.get(0, "position"), Some("1547"));
        assert_eq!(rs.get(0, "Binlog_Do_DB"), Some(""));
        assert_eq!(rs.get(1, "File"), None);
        assert_eq!(rs.get(0, "Missing"), None);
    }

    #[test]
    fn parse_escaped_values() {
        let rs = ResultSet::parse_batch("a\tb\nx\\ty\tline\\nbreak\n").unwrap();
        assert_eq!(rs.rows, vec![vec!["x\ty", "line\nbreak"]]);
    }

    #[test]
    fn parse_empty_and_ragged_output() {
        assert!(ResultSet::parse_batch("").unwrap().is_empty());
        assert!(ResultSet::parse_batch("a\tb\nonly-one\n").is_err());
    }
}
