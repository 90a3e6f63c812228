//! Exercises the `palladium` binary's exit-code contract end to end,
//! writing scripts into a [`tempfile::tempdir`] rather than fixed fixture
//! paths.

use std::process::Command;
use tempfile::tempdir;

fn palladium() -> Command {
    Command::new(env!("CARGO_BIN_EXE_palladium"))
}

#[test]
fn missing_script_argument_exits_64() {
    let output = palladium().output().unwrap();
    assert_eq!(output.status.code(), Some(64));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Usage: palladium"));
}

#[test]
fn compile_error_exits_65() {
    let dir = tempdir().unwrap();
    let script = dir.path().join("bad.pd");
    std::fs::write(&script, "int x = ;").unwrap();

    let output = palladium().arg(&script).output().unwrap();
    assert_eq!(output.status.code(), Some(65));
}

#[test]
fn runtime_error_exits_70() {
    let dir = tempdir().unwrap();
    let script = dir.path().join("div_zero.pd");
    std::fs::write(&script, "print 1 / 0;").unwrap();

    let output = palladium().arg(&script).output().unwrap();
    assert_eq!(output.status.code(), Some(70));
}

#[test]
fn successful_run_prints_output_and_exits_0() {
    let dir = tempdir().unwrap();
    let script = dir.path().join("hello.pd");
    std::fs::write(&script, "print 1 + 1;").unwrap();

    let output = palladium().arg(&script).output().unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "2\n");
}

#[test]
fn missing_file_exits_74() {
    let output = palladium().arg("/nonexistent/path/does-not-exist.pd").output().unwrap();
    assert_eq!(output.status.code(), Some(74));
}
