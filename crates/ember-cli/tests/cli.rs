//! End-to-end tests of the `ember` binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn ember() -> Command {
    Command::cargo_bin("ember").expect("binary not built")
}

fn script(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("could not create temp file");
    write!(file, "{}", contents).expect("could not write temp file");
    file
}

#[test]
fn runs_a_script_and_prints_to_stdout() {
    let file = script("print 1 + 2 * 3;\n");
    ember()
        .arg(file.path())
        .assert()
        .success()
        .stdout("7\n");
}

#[test]
fn compile_errors_exit_65() {
    let file = script("var = 1;\n");
    ember()
        .arg(file.path())
        .assert()
        .code(65)
        .stderr(predicate::str::contains("[line 1] Error"));
}

#[test]
fn runtime_errors_exit_70_with_a_trace() {
    let file = script("fun f() { return missing; }\nf();\n");
    ember()
        .arg(file.path())
        .assert()
        .code(70)
        .stderr(predicate::str::contains("Undefined variable 'missing'."))
        .stderr(predicate::str::contains("[line 1] in f()"));
}

#[test]
fn unreadable_file_exits_74() {
    ember()
        .arg("does-not-exist.emb")
        .assert()
        .code(74)
        .stderr(predicate::str::contains("does-not-exist.emb"));
}

#[test]
fn unknown_arguments_exit_64() {
    let file = script("print 1;\n");
    ember()
        .arg(file.path())
        .arg("--bogus-flag")
        .assert()
        .code(64);
}

#[test]
fn json_flag_emits_machine_readable_diagnostics() {
    let file = script("var = 1;\n");
    ember()
        .arg("--json")
        .arg(file.path())
        .assert()
        .code(65)
        .stdout(predicate::str::contains("\"message\":\"Expect variable name.\""));
}

#[test]
fn repl_reads_from_stdin() {
    ember()
        .write_stdin("print 40 + 2;\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("42"));
}

#[test]
fn repl_keeps_state_across_lines() {
    ember()
        .write_stdin("var x = 10;\nprint x * 2;\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("20"));
}
