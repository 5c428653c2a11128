// Integration tests for the `coalesce` binary: output formats and exit codes.

use std::path::PathBuf;
use std::process::{Command, Output};

fn coalesce_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_coalesce"))
}

fn data(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/data").join(name)
}

fn run(args: &[&str], file: &str) -> Output {
    Command::new(coalesce_binary())
        .args(args)
        .arg(data(file))
        .output()
        .expect("failed to run coalesce")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn text_report_for_entry_root() {
    let output = run(&["--exact"], "transpose_fusion.hlo");
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.starts_with("fusion: fusion\n"), "{}", text);
    assert!(text.contains("mode: exact"), "{}", text);
    assert!(text.contains("  a  f32[64,32]{1,0}  not coalesced\n"), "{}", text);
    assert!(text.contains("  b  f32[32,64]{1,0}  coalesced\n"), "{}", text);
}

#[test]
fn fail_on_uncoalesced_sets_exit_code() {
    let output = run(&["--exact", "--fail-on-uncoalesced"], "transpose_fusion.hlo");
    assert_eq!(output.status.code(), Some(1));
    let output = run(&["--fail-on-uncoalesced"], "elementwise.hlo");
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
}

#[test]
fn json_report_for_producer_consumer() {
    let output = run(
        &["--exact", "--producer", "e", "--consumer", "m", "--format", "json"],
        "elementwise.hlo",
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("report must be JSON");
    assert_eq!(json["module"], "elementwise");
    assert_eq!(json["producer"], "e");
    assert_eq!(json["consumer"], "m");
    assert_eq!(json["mode"], "exact");
    let names: Vec<&str> = json["operands"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["x", "y"]);
    assert!(json["operands"].as_array().unwrap().iter().all(|o| o["coalesced"] == true));
}

#[test]
fn heuristic_is_the_default_mode() {
    let output = run(&["--instr", "e", "--kind", "transpose"], "elementwise.hlo");
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("kind: transpose  mode: heuristic"), "{}", text);
}

#[test]
fn resolution_errors_exit_with_2() {
    let output = run(&[], "broken.hlo");
    assert_eq!(output.status.code(), Some(2));
    let err = stderr(&output);
    assert!(err.contains("E0102"), "{}", err);
}

#[test]
fn invalid_config_exits_with_2() {
    let config = data("bad_config.json");
    let output = run(&["--config", config.to_str().unwrap()], "elementwise.hlo");
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("warp_size"), "{}", stderr(&output));
}

#[test]
fn unknown_instruction_exits_with_2() {
    let output = run(&["--instr", "nope"], "elementwise.hlo");
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("no instruction named 'nope'"));
}

#[test]
fn disconnected_pair_exits_with_2() {
    let output = run(&["--producer", "y", "--consumer", "e"], "elementwise.hlo");
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("'y' is not an operand of 'e'"), "{}", stderr(&output));
    let output = run(&["--producer", "e", "--consumer", "e"], "elementwise.hlo");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn unknown_attributes_warn_but_analyze() {
    let output = run(&["--exact"], "unknown_attribute.hlo");
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stderr(&output).contains("warning[W0120]"), "{}", stderr(&output));
    assert!(stdout(&output).contains("  v  f32[16]{0}  coalesced\n"), "{}", stdout(&output));
}
