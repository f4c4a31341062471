use std::process::{Command, Output};

use ntest::timeout;

fn dbfleet<'a>(args: impl IntoIterator<Item = &'a str>) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dbfleet"))
        .args(args)
        .env_remove("DBFLEET_CONFIG")
        .env("DBFLEET_LOG", "warn")
        .output()
        .unwrap()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
#[timeout(10000)]
fn help_lists_subcommands() {
    let output = dbfleet(["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for subcommand in ["provision", "run", "crash"] {
        assert!(stdout.contains(subcommand), "{stdout}");
    }
}

#[test]
#[timeout(10000)]
fn missing_config_file_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let config = tmp.path().join("absent.toml");

    let output = dbfleet(["provision", "--config", config.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(101));
    assert!(stderr(&output).contains("reading configuration"), "{}", stderr(&output));
}

#[test]
#[timeout(10000)]
fn malformed_config_file_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let config = tmp.path().join("config.toml");
    std::fs::write(&config, "[fleet]\nengine = \"oracle\"\n").unwrap();

    let output = dbfleet(["crash", "--config", config.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(101));
    assert!(stderr(&output).contains("parsing configuration"), "{}", stderr(&output));
}

#[test]
#[timeout(10000)]
fn run_requires_a_command() {
    let output = dbfleet(["run", "--servers=2"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("<COMMAND>"), "{}", stderr(&output));
}
