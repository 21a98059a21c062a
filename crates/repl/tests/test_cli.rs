//! Exercise the `ember` binary end to end: write a script to a temp file,
//! run it, check stdout and the exit code contract.

use std::io::Write;
use std::process::Command;

use tempfile::NamedTempFile;

fn run_script(source: &str) -> std::process::Output {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(source.as_bytes()).expect("write script");
    Command::new(env!("CARGO_BIN_EXE_ember"))
        .arg(file.path())
        .output()
        .expect("run ember")
}

#[test]
fn test_runs_script_and_prints() {
    let output = run_script("print 1 + 2 * 3;");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "7\n");
}

#[test]
fn test_compile_error_exits_70() {
    let output = run_script("let = ;");
    assert_eq!(output.status.code(), Some(70));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error"), "stderr: {stderr}");
}

#[test]
fn test_runtime_error_exits_65() {
    let output = run_script("print 1 + nil;");
    assert_eq!(output.status.code(), Some(65));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("runtime error"), "stderr: {stderr}");
}

#[test]
fn test_missing_file_exits_60() {
    let output = Command::new(env!("CARGO_BIN_EXE_ember"))
        .arg("no-such-file.em")
        .output()
        .expect("run ember");
    assert_eq!(output.status.code(), Some(60));
}

#[test]
fn test_unknown_flag_exits_64() {
    let output = Command::new(env!("CARGO_BIN_EXE_ember"))
        .arg("--definitely-not-a-flag")
        .output()
        .expect("run ember");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn test_stress_gc_flag_accepted() {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(b"let s = \"a\" + \"b\"; print s;")
        .expect("write script");
    let output = Command::new(env!("CARGO_BIN_EXE_ember"))
        .arg("--stress-gc")
        .arg(file.path())
        .output()
        .expect("run ember");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "ab\n");
}
