//! Driving replication through SQL.

use std::time::Duration;

use fleet_server::{
    engine::LOCALHOST,
    instance::ServerInfo,
    sql::{ResultSet, SqlClient},
};
use fleet_utils::poll::{wait_for_condition, CondCheckError, PollError};

use crate::error::CrashError;

/// A position in a master's binary log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogCoordinates {
    pub file: String,
    pub position: u64,
}

impl BinlogCoordinates {
    /// Parses the `<file>\t<position>` line a backup records next to the data.
    pub fn parse_backup_info(line: &str) -> Option<Self> {
        let mut fields = line.trim().split('\t');
        let file = fields.next()?.to_owned();
        let position = fields.next()?.trim().parse().ok()?;
        (!file.is_empty()).then_some(Self { file, position })
    }
}

/// Replication state reported by a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub io_running: bool,
    pub sql_running: bool,
    /// Master log file of the last event the replica applied.
    pub applied_file: String,
    pub applied_position: u64,
    pub last_error: Option<(String, String)>,
}

impl ReplicaStatus {
    pub fn has_caught_up_with(&self, master: &BinlogCoordinates) -> bool {
        self.io_running
            && self.sql_running
            && self.applied_file == master.file
            && self.applied_position >= master.position
    }
}

fn field<'a>(rs: &'a ResultSet, server: &ServerInfo, name: &str) -> Result<&'a str, CrashError> {
    rs.get(0, name).ok_or_else(|| CrashError::UnexpectedResult {
        server: server.name.clone(),
        reason: format!("no {name} in result"),
    })
}

fn position(value: &str, server: &ServerInfo) -> Result<u64, CrashError> {
    value.parse().map_err(|_| CrashError::UnexpectedResult {
        server: server.name.clone(),
        reason: format!("{value:?} is not a binary log position"),
    })
}

pub async fn master_position(
    sql: &dyn SqlClient,
    master: &ServerInfo,
) -> Result<BinlogCoordinates, CrashError> {
    let rs = sql.query(master, "SHOW MASTER STATUS").await?;
    Ok(BinlogCoordinates {
        file: field(&rs, master, "File")?.to_owned(),
        position: position(field(&rs, master, "Position")?, master)?,
    })
}

pub async fn replica_status(
    sql: &dyn SqlClient,
    replica: &ServerInfo,
) -> Result<ReplicaStatus, CrashError> {
    let rs = sql.query(replica, "SHOW SLAVE STATUS").await?;
    let errno = field(&rs, replica, "Last_SQL_Errno")?;
    let last_error = match errno {
        "" | "0" => None,
        errno => Some((
            errno.to_owned(),
            field(&rs, replica, "Last_SQL_Error")?.to_owned(),
        )),
    };
    Ok(ReplicaStatus {
        io_running: field(&rs, replica, "Slave_IO_Running")? == "Yes",
        sql_running: field(&rs, replica, "Slave_SQL_Running")? == "Yes",
        applied_file: field(&rs, replica, "Relay_Master_Log_File")?.to_owned(),
        applied_position: position(field(&rs, replica, "Exec_Master_Log_Pos")?, replica)?,
        last_error,
    })
}

/// Points `replica` at `master`, starting from `from` if given.
pub async fn set_master(
    sql: &dyn SqlClient,
    replica: &ServerInfo,
    master_port: u16,
    from: Option<&BinlogCoordinates>,
) -> Result<(), CrashError> {
    let mut statement = format!(
        "CHANGE MASTER TO MASTER_HOST='{LOCALHOST}', MASTER_USER='root', MASTER_PASSWORD='', MASTER_PORT={master_port}"
    );
    if let Some(BinlogCoordinates { file, position }) = from {
        statement.push_str(&format!(
            ", MASTER_LOG_FILE='{file}', MASTER_LOG_POS={position}"
        ));
    }
    sql.query(replica, &statement).await?;
    tracing::debug!(replica=%replica.name, master_port, ?from, "set master");
    Ok(())
}

pub async fn start_stream(sql: &dyn SqlClient, replica: &ServerInfo) -> Result<(), CrashError> {
    sql.query(replica, "START SLAVE").await?;
    Ok(())
}

/// Stops and starts the replication stream of `replica`, so it reconnects to a restarted master.
pub async fn restart_stream(sql: &dyn SqlClient, replica: &ServerInfo) -> Result<(), CrashError> {
    sql.query(replica, "STOP SLAVE").await?;
    sql.query(replica, "START SLAVE").await?;
    tracing::debug!(replica=%replica.name, "restarted replication stream");
    Ok(())
}

/// Waits until `replica` has applied everything `master` has logged.
pub async fn wait_caught_up(
    sql: &dyn SqlClient,
    master: &ServerInfo,
    replica: &ServerInfo,
    interval: Duration,
    timeout: Duration,
) -> Result<(), CrashError> {
    let target = master_position(sql, master).await?;

    let target = &target;
    let result = wait_for_condition(
        || async move {
            let status = replica_status(sql, replica)
                .await
                .map_err(CondCheckError::Failed)?;
            if let Some((errno, message)) = &status.last_error {
                return Err(CondCheckError::Failed(CrashError::ReplicationBroken {
                    replica: replica.name.clone(),
                    errno: errno.clone(),
                    message: message.clone(),
                }));
            }
            if status.has_caught_up_with(target) {
                Ok(())
            } else {
                tracing::trace!(replica=%replica.name, ?status, ?target, "replica lagging");
                Err(CondCheckError::NotYet)
            }
        },
        interval,
        timeout,
    )
    .await;

    match result {
        Ok(()) => {
            tracing::debug!(replica=%replica.name, ?target, "replica caught up");
            Ok(())
        }
        Err(PollError::TimedOut(waited)) => Err(CrashError::ReplicationSyncTimeout {
            replica: replica.name.clone(),
            waited,
        }),
        Err(PollError::Permanent(error)) => Err(error),
    }
}
