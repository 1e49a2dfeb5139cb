//! CLI Argument Parsing Compatibility Tests
//!
//! These tests verify that command-line arguments are parsed correctly and maintain
//! backward compatibility. The focus is on ensuring that argument values, aliases,
//! and formats continue to work as expected across versions.
//!
//! Tests in this file should NOT be modified to match new behavior unless it's
//! intentional and documented in the changelog. Breaking changes here indicate
//! potential issues for existing users.

use assert_cmd::Command;

/// Test that --help output is generated without errors
#[test]
fn test_help_runs() {
    Command::cargo_bin("rcp")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

/// Test --version flag works
#[test]
fn test_version_runs() {
    Command::cargo_bin("rcp")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

/// Test that both subcommands have their own help
#[test]
fn test_subcommand_help_runs() {
    for subcommand in ["send", "listen"] {
        Command::cargo_bin("rcp")
            .unwrap()
            .args([subcommand, "--help"])
            .assert()
            .success();
    }
}

/// Test that a subcommand is required
#[test]
fn test_subcommand_required() {
    Command::cargo_bin("rcp").unwrap().assert().failure();
}

// ============================================================================
// ProgressType Argument Parsing Tests
// ============================================================================

/// Test that every accepted spelling of --progress-type parses
#[test]
fn test_progress_type_spellings() {
    for value in [
        "auto",
        "Auto",
        "ProgressBar",
        "progress-bar",
        "TextUpdates",
        "text-updates",
    ] {
        Command::cargo_bin("rcp")
            .unwrap()
            .args(["send", "--progress-type", value, "--help"])
            .assert()
            .success();
    }
}

/// Test that an unknown progress type is rejected
#[test]
fn test_progress_type_invalid() {
    Command::cargo_bin("rcp")
        .unwrap()
        .args(["send", "--progress-type", "fancy", "--dummy-output"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("invalid value"));
}

// ============================================================================
// Size and Duration Argument Parsing Tests
// ============================================================================

/// Test human-readable buffer and dummy input sizes
#[test]
fn test_size_formats() {
    for value in ["4096", "4KiB", "10MiB", "1MB", "2GiB"] {
        Command::cargo_bin("rcp")
            .unwrap()
            .args(["send", "--buf-size", value, "--dummy-input", value, "--help"])
            .assert()
            .success();
    }
}

/// Test that a malformed size is rejected
#[test]
fn test_size_invalid() {
    Command::cargo_bin("rcp")
        .unwrap()
        .args(["send", "--buf-size", "lots", "--dummy-output"])
        .assert()
        .failure();
}

/// Test human-readable progress delays
#[test]
fn test_progress_delay_formats() {
    for value in ["500ms", "1s", "10s", "1min"] {
        Command::cargo_bin("rcp")
            .unwrap()
            .args(["listen", "--progress-delay", value, "--help"])
            .assert()
            .success();
    }
}

/// Test that a malformed delay is rejected
#[test]
fn test_progress_delay_invalid() {
    Command::cargo_bin("rcp")
        .unwrap()
        .args(["send", "--progress-delay", "soon", "--dummy-output"])
        .assert()
        .failure();
}

/// Test that global flags are accepted both before and after the subcommand
#[test]
fn test_global_flag_positions() {
    Command::cargo_bin("rcp")
        .unwrap()
        .args(["-s", "--max-buf-num", "4", "send", "--help"])
        .assert()
        .success();
    Command::cargo_bin("rcp")
        .unwrap()
        .args(["send", "-s", "--max-buf-num", "4", "--help"])
        .assert()
        .success();
}

/// Test short endpoint flags of both subcommands
#[test]
fn test_short_endpoint_flags() {
    Command::cargo_bin("rcp")
        .unwrap()
        .args(["send", "-i", "input", "-d", "127.0.0.1:1987", "--help"])
        .assert()
        .success();
    Command::cargo_bin("rcp")
        .unwrap()
        .args(["listen", "-l", ":1987", "-o", "output", "--help"])
        .assert()
        .success();
}
