//! CLI tests for the `mlrunner` binary.
//!
//! Spawns the binary and checks exit codes and the artifact layout it leaves
//! behind.

use std::fs;
use std::process::Command;

use mlrunner::exit_codes;

fn mlrunner() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_mlrunner"));
    cmd.env("RUST_LOG", "warn");
    cmd
}

#[test]
fn validate_template_accepts_registered_variables() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("coder.txt");
    fs::write(&path, "Task: {task_description}\nData: {data_prompt_truncate_end_100}\n").expect("write");

    let output = mlrunner()
        .arg("validate-template")
        .arg(&path)
        .output()
        .expect("validate-template");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("task_description"));
}

#[test]
fn validate_template_rejects_unknown_variables() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("coder.txt");
    fs::write(&path, "Use {no_such_variable}.").expect("write");

    let output = mlrunner()
        .arg("validate-template")
        .arg(&path)
        .output()
        .expect("validate-template");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no_such_variable"));
}

#[test]
fn invalid_config_exits_with_invalid_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let input = temp.path().join("input");
    fs::create_dir_all(&input).expect("input");
    let config = temp.path().join("config.toml");
    fs::write(&config, "max_debug_depth = 0\n").expect("config");

    let status = mlrunner()
        .arg("run")
        .arg(&input)
        .arg(temp.path().join("output"))
        .arg(&config)
        .arg("1")
        .status()
        .expect("run");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[cfg(unix)]
#[test]
fn run_without_a_working_backend_finds_no_success() {
    let temp = tempfile::tempdir().expect("tempdir");
    let input = temp.path().join("input");
    fs::create_dir_all(&input).expect("input");
    fs::write(input.join("train.csv"), "id,y\n1,0\n").expect("data");
    let config = temp.path().join("config.toml");
    fs::write(
        &config,
        "per_execution_timeout = 30\n\n[llm]\ncommand = [\"false\"]\nmax_retries = 0\nretry_backoff_ms = 0\n",
    )
    .expect("config");
    let output = temp.path().join("output");

    let status = mlrunner()
        .arg("run")
        .arg(&input)
        .arg(&output)
        .arg(&config)
        .arg("2")
        .status()
        .expect("run");

    assert_eq!(status.code(), Some(exit_codes::NO_SUCCESS));
    assert!(output.join("node_init/states/data_prompt.txt").exists());
    for node in ["node_0", "node_1"] {
        assert!(output.join(node).join("generated_code.py").exists(), "{node} program");
        let script = fs::read_to_string(output.join(node).join("execution_script.sh")).expect("script");
        assert!(script.contains("generated_code.py"));
    }
    assert!(!output.join("best_run").exists());
}
