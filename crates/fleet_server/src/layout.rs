use std::{
    io,
    path::{Path, PathBuf},
};

/// File-system layout of one server instance, rooted at `<workdir>/<owner>/<server>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLayout {
    pub root: PathBuf,
    pub datadir: PathBuf,
    pub tmpdir: PathBuf,
    pub logdir: PathBuf,
    pub rundir: PathBuf,
    pub snapshot: PathBuf,
    pub pid_file: PathBuf,
    pub socket_file: PathBuf,
    pub error_log: PathBuf,
}

impl ServerLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let var = root.join("var");
        let rundir = var.join("run");
        let logdir = var.join("log");
        Self {
            datadir: var.join("datadir"),
            tmpdir: var.join("tmp"),
            snapshot: root.join("snapshot"),
            pid_file: rundir.join("server.pid"),
            socket_file: rundir.join("server.sock"),
            error_log: logdir.join("error.log"),
            logdir,
            rundir,
            root,
        }
    }

    pub fn for_server(workdir: &Path, owner: &str, server: &str) -> Self {
        Self::new(workdir.join(owner).join(server))
    }

    /// Creates every directory of the layout except the snapshot.
    pub fn create_dirs(&self) -> io::Result<()> {
        for dir in [&self.datadir, &self.tmpdir, &self.logdir, &self.rundir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
