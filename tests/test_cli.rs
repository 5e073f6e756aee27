// CLI integration tests for devbus
// Tests the command-line interface functionality

use std::process::{Command, Output};

use tempfile::TempDir;

/// Run the binary with an empty config home so the user's own settings
/// never leak into assertions.
fn devbus(args: &[&str]) -> (Output, TempDir) {
    let config_home = TempDir::new().expect("Failed to create temp dir");
    let output = Command::new(env!("CARGO_BIN_EXE_devbus"))
        .args(args)
        .env("XDG_CONFIG_HOME", config_home.path())
        .output()
        .expect("Failed to execute command");
    (output, config_home)
}

/// Test that --help flag shows help message with program description
#[test]
fn test_help_flag_shows_help_message() {
    let (output, _home) = devbus(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Help should exit with success");
    assert!(
        stdout.contains("devbus"),
        "Help should contain program name. Got: {}",
        stdout
    );
    assert!(
        stdout.contains("Message bus"),
        "Help should contain description. Got: {}",
        stdout
    );
    assert!(
        stdout.contains("config") && stdout.contains("ping"),
        "Help should list subcommands. Got: {}",
        stdout
    );
}

#[test]
fn test_config_prints_defaults() {
    let (output, _home) = devbus(&["config"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "config should succeed");
    assert!(
        stdout.contains("rpc_queue_name = \"devbus.services\""),
        "Default services queue should be printed. Got: {}",
        stdout
    );
}

#[test]
fn test_config_flag_overrides_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bus.toml");
    std::fs::write(&path, "rpc_queue_name = \"team.services\"\n").unwrap();

    let (output, _home) = devbus(&["config", "--config", path.to_str().unwrap()]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "config should succeed");
    assert!(
        stdout.contains("rpc_queue_name = \"team.services\""),
        "Explicit config should win. Got: {}",
        stdout
    );
}

/// Test that a broken explicit config fails with a readable error
#[test]
fn test_invalid_config_shows_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bus.toml");
    std::fs::write(&path, "no_such_setting = 1\n").unwrap();

    let (output, _home) = devbus(&["config", "--config", path.to_str().unwrap()]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "Invalid config should fail");
    assert!(
        stderr.contains("Error"),
        "Should print an error. Got: {}",
        stderr
    );
}

#[test]
fn test_ping_round_trips() {
    let (output, _home) = devbus(&["ping", "--user", "carol", "--count", "2"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(
        output.status.success(),
        "ping should succeed. stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout.contains("ping 1 from echo.ping"), "Got: {}", stdout);
    assert!(stdout.contains("ping 2 from echo.ping"), "Got: {}", stdout);
    assert!(
        stdout.contains("broadcast answered on ping.response"),
        "Got: {}",
        stdout
    );
}
