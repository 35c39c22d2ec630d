//! The `metatrace` binary

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

const COUNTDOWN: &str = r#"
func main locals 2
    const r0, 5
    const r1, 1
loop:
    cp 0
    printkv "n", r0
    sub r0, r0, r1
    jnz r0, loop
    ret
end
"#;

fn write_program(name: &str, src: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("metatrace-{}-{}.mt", std::process::id(), name));
    fs::write(&path, src).unwrap();
    path
}

fn metatrace(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_metatrace"))
        .args(args)
        .env_remove("METATRACE_HOT_THRESHOLD")
        .env_remove("METATRACE_SERIALISE_COMPILATION")
        .env_remove("METATRACE_PRINT_JITSTATE")
        .env_remove("METATRACE_PRINT_IR")
        .env_remove("METATRACE_MAX_TRACE_LEN")
        .output()
        .unwrap()
}

fn jit_events(stderr: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(stderr)
        .lines()
        .filter_map(|l| l.strip_prefix("jit-state: "))
        .map(str::to_owned)
        .collect()
}

const EXPECTED_OUTPUT: &str = "n=5\nn=4\nn=3\nn=2\nn=1\n";

#[test]
fn test_cli_runs_with_jitstate() {
    let path = write_program("jitstate", COUNTDOWN);
    let out = metatrace(&["-t", "0", "-s", "-j", path.to_str().unwrap()]);
    fs::remove_file(&path).ok();

    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout), EXPECTED_OUTPUT);
    let events = jit_events(&out.stderr);
    assert_eq!(events.first().map(String::as_str), Some("start-tracing"));
    assert_eq!(events.get(1).map(String::as_str), Some("stop-tracing"));
    assert_eq!(events.last().map(String::as_str), Some("exit-jit-code"));
    assert!(events.iter().any(|e| e == "deoptimise"));
}

#[test]
fn test_cli_no_jit_is_silent() {
    let path = write_program("nojit", COUNTDOWN);
    let out = metatrace(&["--no-jit", "-j", path.to_str().unwrap()]);
    fs::remove_file(&path).ok();

    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout), EXPECTED_OUTPUT);
    assert!(jit_events(&out.stderr).is_empty());
}

#[test]
fn test_cli_environment_and_config_file() {
    let path = write_program("env", COUNTDOWN);
    let config = std::env::temp_dir().join(format!("metatrace-{}-config.toml", std::process::id()));
    fs::write(&config, "hot-threshold = 0\nprint-jitstate = true\n").unwrap();

    let out = Command::new(env!("CARGO_BIN_EXE_metatrace"))
        .args(["--config", config.to_str().unwrap(), path.to_str().unwrap()])
        .env("METATRACE_SERIALISE_COMPILATION", "1")
        .env_remove("METATRACE_HOT_THRESHOLD")
        .env_remove("METATRACE_PRINT_JITSTATE")
        .env_remove("METATRACE_PRINT_IR")
        .env_remove("METATRACE_MAX_TRACE_LEN")
        .output()
        .unwrap();
    fs::remove_file(&path).ok();
    fs::remove_file(&config).ok();

    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout), EXPECTED_OUTPUT);
    assert_eq!(jit_events(&out.stderr).first().map(String::as_str), Some("start-tracing"));
}

#[test]
fn test_cli_errors_exit_one() {
    let out = metatrace(&["--hot-threshold", "lots", "x.mt"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("Invalid hot threshold"));

    let out = metatrace(&["--bogus"]);
    assert_eq!(out.status.code(), Some(1));

    let out = metatrace(&["/definitely/not/here.mt"]);
    assert_eq!(out.status.code(), Some(1));

    let path = write_program("bad", "func main locals 1\n  jmp nowhere\nend\n");
    let out = metatrace(&[path.to_str().unwrap()]);
    fs::remove_file(&path).ok();
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("nowhere"));
}

#[test]
fn test_cli_version() {
    let out = metatrace(&["--version"]);
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).starts_with("metatrace "));
}
