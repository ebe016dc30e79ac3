//! End-to-end tests driving the `eva` binary as a subprocess.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn eva() -> Command {
    Command::cargo_bin("eva").unwrap()
}

fn source_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{contents}").unwrap();
    file
}

#[test]
fn run_prints_the_final_value() {
    let file = source_file("(+ 2 3)");
    eva()
        .arg("run")
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("5"));
}

#[test]
fn run_reads_from_stdin_when_file_is_dash() {
    eva()
        .arg("run")
        .arg("-")
        .write_stdin("(* 6 7)")
        .assert()
        .success()
        .stdout(predicate::str::contains("42"));
}

#[test]
fn run_reports_a_resolve_error_and_exits_nonzero() {
    let file = source_file("undefined_name");
    eva().arg("run").arg(file.path()).assert().failure();
}

#[test]
fn run_missing_file_exits_nonzero() {
    eva().arg("run").arg("does-not-exist.eva").assert().failure();
}

#[test]
fn disassemble_flag_prints_opcodes_without_running() {
    let file = source_file("(def square (x) (* x x))");
    eva()
        .arg("run")
        .arg(file.path())
        .arg("--disassemble")
        .assert()
        .success()
        .stdout(predicate::str::contains("OP_HALT"))
        .stdout(predicate::str::contains("== square"));
}

#[test]
fn class_and_inheritance_program_runs_end_to_end() {
    let file = source_file(
        "(class Point null \
           (def constructor (self x y) (begin (set (prop self x) x) (set (prop self y) y))) \
           (def g (self) (prop self x))) \
         (var p (new Point 7 9)) \
         ((prop p g) p)",
    );
    eva()
        .arg("run")
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("7"));
}
