use std::{
    fmt, io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use fleet_utils::exit::ExitCode;

/// A fully-specified invocation of an external program.
///
/// Kept separate from [tokio::process::Command] so that invocations can be inspected, logged,
/// and wrapped (e.g. under valgrind) before anything is spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            env: vec![],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Runs this command as the last arguments of `wrapper`, which inherits our environment.
    pub fn wrapped_in(self, wrapper: CommandLine) -> Self {
        let Self { program, args, env } = self;
        let mut wrapped = wrapper;
        wrapped.args.push(program.display().to_string());
        wrapped.args.extend(args);
        wrapped.env.extend(env);
        wrapped
    }

    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
        cmd
    }
}

/// Where the output of a [run][CommandLine::run] goes.
#[derive(Debug, Clone, Copy)]
pub enum CommandOutput<'a> {
    Discard,
    /// Both stdout and stderr are appended to the file.
    AppendTo(&'a Path),
}

impl CommandLine {
    /// Runs the command to completion, killing it if it does not exit within `timeout`.
    pub async fn run(&self, output: CommandOutput<'_>, timeout: Duration) -> io::Result<ExitCode> {
        let mut cmd = self.to_command();
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        match output {
            CommandOutput::Discard => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
            CommandOutput::AppendTo(path) => {
                let (stdout, stderr) = append_stdio(path)?;
                cmd.stdout(stdout).stderr(stderr);
            }
        }

        let mut child = cmd.spawn()?;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => Ok(status?.into()),
            Err(_) => {
                let _ = child.kill().await;
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{} did not exit within {timeout:?}", self.program.display()),
                ))
            }
        }
    }
}

/// Opens `path` for appending, as both the stdout and stderr of a child process.
pub fn append_stdio(path: &Path) -> io::Result<(Stdio, Stdio)> {
    let out = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let err = out.try_clone()?;
    Ok((out.into(), err.into()))
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.env {
            write!(f, "{key}={value} ")?;
        }
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{CommandLine, CommandOutput};

    #[test]
    fn display_renders_env_program_and_args() {
        let cmd = CommandLine::new("/usr/sbin/mysqld")
            .env("LD_PRELOAD", "/lib/libeatmydata.so")
            .arg("--no-defaults")
            .args(["--port=9306", "--server-id=1"]);

        assert_eq!(
            cmd.to_string(),
            "LD_PRELOAD=/lib/libeatmydata.so /usr/sbin/mysqld --no-defaults --port=9306 --server-id=1"
        );
    }

    #[test]
    fn wrapping_appends_program_after_wrapper_args() {
        let cmd = CommandLine::new("mysqld").arg("--port=1").env("A", "1");
        let wrapped = cmd.wrapped_in(CommandLine::new("valgrind").arg("--tool=memcheck"));

        assert_eq!(wrapped.program.to_str(), Some("valgrind"));
        assert_eq!(wrapped.args, vec!["--tool=memcheck", "mysqld", "--port=1"]);
        assert_eq!(wrapped.env, vec![("A".to_owned(), "1".to_owned())]);
    }

    #[tokio::test]
    async fn run_reports_exit_code_and_appends_output() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("out.log");
        std::fs::write(&log, "before\n").unwrap();

        let code = CommandLine::new("sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .run(CommandOutput::AppendTo(&log), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(code.get(), 3);
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.starts_with("before\n"));
        assert!(content.contains("out\n"));
        assert!(content.contains("err\n"));
    }

    #[tokio::test]
    async fn run_times_out() {
        let err = CommandLine::new("sleep")
            .arg("10")
            .run(CommandOutput::Discard, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }
}
