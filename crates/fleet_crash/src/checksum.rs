//! Table checksums, for verifying that replicas hold the same data as their master.

use std::{collections::BTreeMap, fmt};

use fleet_server::{instance::ServerInfo, sql::SqlClient};

use crate::error::CrashError;

const LIST_TABLES: &str = "SELECT table_schema, table_name FROM information_schema.tables \
     WHERE table_type = 'BASE TABLE' \
     AND table_schema NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys') \
     ORDER BY table_schema, table_name";

/// Checksums of every user table of a server, keyed by `schema.table`.
pub type TableChecksums = BTreeMap<String, String>;

pub async fn checksum_tables(
    sql: &dyn SqlClient,
    server: &ServerInfo,
) -> Result<TableChecksums, CrashError> {
    let tables = sql.query(server, LIST_TABLES).await?;
    if tables.is_empty() {
        return Ok(TableChecksums::new());
    }

    let list = tables
        .rows
        .iter()
        .filter_map(|row| match row.as_slice() {
            [schema, name, ..] => Some(format!("`{schema}`.`{name}`")),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(", ");
    let checksums = sql.query(server, &format!("CHECKSUM TABLE {list}")).await?;

    let (Some(table), Some(checksum)) = (
        checksums.column_index("Table"),
        checksums.column_index("Checksum"),
    ) else {
        return Err(CrashError::UnexpectedResult {
            server: server.name.clone(),
            reason: "CHECKSUM TABLE returned no Table or Checksum column".to_owned(),
        });
    };

    checksums
        .rows
        .iter()
        .map(|row| match (row.get(table), row.get(checksum)) {
            (Some(table), Some(checksum)) => Ok((table.clone(), checksum.clone())),
            _ => Err(CrashError::UnexpectedResult {
                server: server.name.clone(),
                reason: format!(
                    "CHECKSUM TABLE row has {} values, expected {}",
                    row.len(),
                    checksums.columns.len()
                ),
            }),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDiff {
    pub table: String,
    pub master: String,
    pub replica: String,
}

/// Every table whose checksum differs between a master and one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumDiff {
    pub master: String,
    pub replica: String,
    pub tables: Vec<TableDiff>,
}

impl fmt::Display for ChecksumDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} tables differ between {} and {}:",
            self.tables.len(),
            self.master,
            self.replica
        )?;
        for TableDiff {
            table,
            master,
            replica,
        } in &self.tables
        {
            writeln!(f, "  {table}: {master} != {replica}")?;
        }
        Ok(())
    }
}

/// Compares the tables present on both servers.
pub fn compare(
    master: (&str, &TableChecksums),
    replica: (&str, &TableChecksums),
) -> Result<(), ChecksumDiff> {
    let (master_name, master_sums) = master;
    let (replica_name, replica_sums) = replica;

    let mut tables = vec![];
    for (table, master_sum) in master_sums {
        match replica_sums.get(table) {
            Some(replica_sum) if replica_sum != master_sum => tables.push(TableDiff {
                table: table.clone(),
                master: master_sum.clone(),
                replica: replica_sum.clone(),
            }),
            Some(_) => {}
            None => tracing::warn!(%table, replica = replica_name, "table missing on replica"),
        }
    }
    for table in replica_sums.keys().filter(|t| !master_sums.contains_key(*t)) {
        tracing::warn!(%table, master = master_name, "table missing on master");
    }

    if tables.is_empty() {
        Ok(())
    } else {
        Err(ChecksumDiff {
            master: master_name.to_owned(),
            replica: replica_name.to_owned(),
            tables,
        })
    }
}
