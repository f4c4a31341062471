//! Seeding replicas from a hot backup of their master.
//!
//! A backup moves through three steps that must run in order: it is taken from a live master,
//! prepared (the backup's own crash recovery), then copied into a replica's data directory. Each
//! step consumes the previous one's result, so the order cannot be violated.

use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
    time::Duration,
};

use fleet_server::{
    command::{CommandLine, CommandOutput},
    engine::LOCALHOST,
};
use fleet_utils::{error::ResultLocation, here};
use serde_derive::Deserialize;

use crate::{error::CrashError, replication::BinlogCoordinates};

/// File a backup records the master's binary log coordinates in.
pub const BINLOG_INFO: &str = "xtrabackup_binlog_info";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupTool {
    pub innobackupex: PathBuf,
    pub xtrabackup: PathBuf,
    #[serde(default = "default_memory")]
    pub prepare_memory: String,
    #[serde(default = "default_timeout", with = "seconds")]
    pub timeout: Duration,
}

fn default_memory() -> String {
    "500M".to_owned()
}

fn default_timeout() -> Duration {
    Duration::from_secs(3600)
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[derive(Debug)]
pub struct Taken;
#[derive(Debug)]
pub struct Prepared;

/// A backup on disk, in step `S`.
#[derive(Debug)]
pub struct Backup<S> {
    dir: PathBuf,
    log: PathBuf,
    _step: PhantomData<S>,
}

impl<S> Backup<S> {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn advance<T>(self) -> Backup<T> {
        Backup {
            dir: self.dir,
            log: self.log,
            _step: PhantomData,
        }
    }
}

impl BackupTool {
    pub fn new(innobackupex: impl Into<PathBuf>, xtrabackup: impl Into<PathBuf>) -> Self {
        Self {
            innobackupex: innobackupex.into(),
            xtrabackup: xtrabackup.into(),
            prepare_memory: default_memory(),
            timeout: default_timeout(),
        }
    }

    fn invocation(&self) -> CommandLine {
        CommandLine::new(&self.innobackupex)
            .arg(format!("--ibbackup={}", self.xtrabackup.display()))
            .arg("--no-timestamp")
    }

    async fn run(&self, step: &'static str, cmd: CommandLine, log: &Path) -> Result<(), CrashError> {
        tracing::info!(step, cmd=%cmd, "running backup tool");
        let code = cmd
            .run(CommandOutput::AppendTo(log), self.timeout)
            .await
            .located(here!())?;
        if !code.is_success() {
            return Err(CrashError::Backup {
                step,
                code,
                log: log.to_owned(),
            });
        }
        Ok(())
    }

    /// Takes a backup of the master listening on `port` into `dir`, which must not exist yet.
    pub async fn take(
        &self,
        port: u16,
        dir: impl Into<PathBuf>,
        log: impl Into<PathBuf>,
    ) -> Result<Backup<Taken>, CrashError> {
        let dir = dir.into();
        let log = log.into();
        let cmd = self
            .invocation()
            .args(["--user=root", "--slave-info"])
            .arg(format!("--host={LOCALHOST}"))
            .arg(format!("--port={port}"))
            .arg(dir.display().to_string());
        self.run("backup", cmd, &log).await?;
        Ok(Backup {
            dir,
            log,
            _step: PhantomData,
        })
    }

    pub async fn prepare(&self, backup: Backup<Taken>) -> Result<Backup<Prepared>, CrashError> {
        let cmd = self
            .invocation()
            .arg("--apply-log")
            .arg(format!("--use-memory={}", self.prepare_memory))
            .arg(backup.dir.display().to_string());
        self.run("prepare", cmd, &backup.log).await?;
        Ok(backup.advance())
    }

    /// Copies a prepared backup into `datadir`, which must be empty, and returns the master
    /// coordinates the backup was taken at.
    pub async fn restore(
        &self,
        backup: &Backup<Prepared>,
        datadir: &Path,
    ) -> Result<BinlogCoordinates, CrashError> {
        let cmd = self
            .invocation()
            .arg("--copy-back")
            .arg(format!("--datadir={}", datadir.display()))
            .arg(backup.dir.display().to_string());
        self.run("restore", cmd, &backup.log).await?;

        let info_path = backup.dir.join(BINLOG_INFO);
        let info = tokio::fs::read_to_string(&info_path)
            .await
            .located(here!())?;
        BinlogCoordinates::parse_backup_info(&info).ok_or_else(|| CrashError::UnexpectedResult {
            server: backup.dir.display().to_string(),
            reason: format!("{} holds no binary log coordinates: {info:?}", BINLOG_INFO),
        })
    }
}

#[cfg(test)]
mod test {
    use std::{fs, os::unix::fs::PermissionsExt, path::Path};

    use indoc::formatdoc;

    use super::BackupTool;
    use crate::{error::CrashError, replication::BinlogCoordinates};

    /// A stand-in for the backup tool that logs its arguments, and on backup writes the
    /// coordinates file into the target directory.
    fn fake_tool(dir: &Path, fail_on: Option<&str>) -> BackupTool {
        let script = dir.join("innobackupex");
        let fail = fail_on.unwrap_or("never");
        fs::write(
            &script,
            formatdoc! {r#"
                #!/bin/sh
                echo "innobackupex $*"
                for last; do :; done
                case "$*" in
                  *{fail}*) echo "step failed" >&2; exit 2 ;;
                  *--apply-log*|*--copy-back*) ;;
                  *) mkdir -p "$last" && printf 'mysql-bin.000004\t907\n' > "$last/xtrabackup_binlog_info" ;;
                esac
            "#},
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        BackupTool::new(script, "/usr/bin/xtrabackup")
    }

    #[tokio::test]
    async fn steps_run_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = fake_tool(tmp.path(), None);
        let log = tmp.path().join("backup.log");

        let taken = tool.take(9306, tmp.path().join("bk"), &log).await.unwrap();
        let prepared = tool.prepare(taken).await.unwrap();
        let coords = tool
            .restore(&prepared, &tmp.path().join("replica-data"))
            .await
            .unwrap();

        assert_eq!(
            coords,
            BinlogCoordinates {
                file: "mysql-bin.000004".to_owned(),
                position: 907
            }
        );
        let log = fs::read_to_string(log).unwrap();
        let steps: Vec<_> = log.lines().collect();
        assert_eq!(steps.len(), 3);
        assert!(steps[0].contains("--slave-info") && steps[0].contains("--port=9306"));
        assert!(steps[1].contains("--apply-log") && steps[1].contains("--use-memory=500M"));
        assert!(steps[2].contains("--copy-back") && steps[2].contains("replica-data"));
        assert!(steps.iter().all(|s| s.contains("--ibbackup=/usr/bin/xtrabackup")));
    }

    #[tokio::test]
    async fn failing_step_names_itself() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = fake_tool(tmp.path(), Some("--apply-log"));
        let log = tmp.path().join("backup.log");

        let taken = tool.take(9306, tmp.path().join("bk"), &log).await.unwrap();
        let err = tool.prepare(taken).await.unwrap_err();
        assert!(
            matches!(&err, CrashError::Backup { step: "prepare", code, .. } if code.get() == 2),
            "{err:?}"
        );
        assert!(fs::read_to_string(log).unwrap().contains("step failed"));
    }
}
