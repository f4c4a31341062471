use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use fleet_server::{
    instance::ServerInfo,
    sql::{ResultSet, SqlClient, SqlError},
};
use fleet_utils::exit::ExitCode;
use parking_lot::{Mutex, MutexGuard};

/// In-memory model of a replicated cluster, keyed by server name.
#[derive(Debug)]
pub struct FakeSqlState {
    /// Every statement run, with the name of the server it ran on.
    pub executed: Vec<(String, String)>,
    /// Table checksums per server, keyed by `schema.table`.
    pub tables: BTreeMap<String, BTreeMap<String, String>>,
    /// Binary log coordinates every master reports.
    pub master_position: (String, u64),
    /// How many more replica status polls report a lagging replica.
    pub lagging_polls: usize,
    /// Replicas whose replication stream is running.
    pub streaming: BTreeSet<String>,
    /// Statements starting with any of these prefixes fail.
    pub failing: Vec<String>,
}

impl Default for FakeSqlState {
    fn default() -> Self {
        Self {
            executed: vec![],
            tables: BTreeMap::new(),
            master_position: ("mysql-bin.000001".to_owned(), 154),
            lagging_polls: 0,
            streaming: BTreeSet::new(),
            failing: vec![],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeSqlClient {
    state: Arc<Mutex<FakeSqlState>>,
}

fn result(columns: &[&str], rows: Vec<Vec<String>>) -> ResultSet {
    ResultSet::new(columns.iter().map(|c| c.to_string()).collect(), rows)
}

fn unquote_table(table: &str) -> String {
    table.trim().replace('`', "")
}

impl FakeSqlClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeSqlState> {
        self.state.lock()
    }

    pub fn set_table(&self, server: &str, table: &str, checksum: &str) {
        self.state
            .lock()
            .tables
            .entry(server.to_owned())
            .or_default()
            .insert(table.to_owned(), checksum.to_owned());
    }

    /// Statements run on `server`, in order.
    pub fn executed_on(&self, server: &str) -> Vec<String> {
        self.state
            .lock()
            .executed
            .iter()
            .filter(|(s, _)| s == server)
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    fn respond(state: &mut FakeSqlState, server: &str, sql: &str) -> Option<ResultSet> {
        let upper = sql.trim().to_ascii_uppercase();

        if upper.starts_with("SHOW MASTER STATUS") {
            let (file, pos) = &state.master_position;
            return Some(result(
                &["File", "Position", "Binlog_Do_DB", "Binlog_Ignore_DB"],
                vec![vec![file.clone(), pos.to_string(), String::new(), String::new()]],
            ));
        }

        if upper.starts_with("SHOW SLAVE STATUS") {
            let (file, pos) = state.master_position.clone();
            let streaming = state.streaming.contains(server);
            let exec_pos = if streaming && state.lagging_polls > 0 {
                state.lagging_polls -= 1;
                pos.saturating_sub(1)
            } else {
                pos
            };
            let running = if streaming { "Yes" } else { "No" };
            return Some(result(
                &[
                    "Slave_IO_Running",
                    "Slave_SQL_Running",
                    "Relay_Master_Log_File",
                    "Exec_Master_Log_Pos",
                    "Last_SQL_Errno",
                    "Last_SQL_Error",
                ],
                vec![vec![
                    running.to_owned(),
                    running.to_owned(),
                    file,
                    exec_pos.to_string(),
                    "0".to_owned(),
                    String::new(),
                ]],
            ));
        }

        if upper.starts_with("START SLAVE") {
            state.streaming.insert(server.to_owned());
            return Some(ResultSet::default());
        }
        if upper.starts_with("STOP SLAVE") {
            state.streaming.remove(server);
            return Some(ResultSet::default());
        }
        if upper.starts_with("CHANGE MASTER") {
            return Some(ResultSet::default());
        }

        if upper.starts_with("SELECT TABLE_SCHEMA, TABLE_NAME") {
            let rows = state
                .tables
                .get(server)
                .into_iter()
                .flat_map(|tables| tables.keys())
                .filter_map(|table| table.split_once('.'))
                .map(|(schema, name)| vec![schema.to_owned(), name.to_owned()])
                .collect();
            return Some(result(&["table_schema", "table_name"], rows));
        }

        if upper.starts_with("CHECKSUM TABLE") {
            let list = &sql.trim()["CHECKSUM TABLE".len()..];
            let tables = state.tables.get(server);
            let rows = list
                .split(',')
                .map(unquote_table)
                .map(|table| {
                    let checksum = tables
                        .and_then(|t| t.get(&table))
                        .cloned()
                        .unwrap_or_else(|| "NULL".to_owned());
                    vec![table, checksum]
                })
                .collect();
            return Some(result(&["Table", "Checksum"], rows));
        }

        None
    }
}

#[async_trait]
impl SqlClient for FakeSqlClient {
    async fn query(&self, server: &ServerInfo, sql: &str) -> Result<ResultSet, SqlError> {
        let mut state = self.state.lock();
        state.executed.push((server.name.clone(), sql.to_owned()));

        let fails = state
            .failing
            .iter()
            .any(|prefix| sql.trim().to_ascii_uppercase().starts_with(&prefix.to_ascii_uppercase()));
        let response = if fails {
            None
        } else {
            Self::respond(&mut state, &server.name, sql)
        };

        response.ok_or_else(|| SqlError::Failed {
            server: server.name.clone(),
            code: ExitCode::FAILURE,
            stderr: format!("ERROR 1064 (42000): cannot run {sql:?}"),
        })
    }
}
