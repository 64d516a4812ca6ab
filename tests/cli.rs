mod common;

use common::hydra_sync_bin;

#[test]
fn version_flag_prints_version() {
    let assert = hydra_sync_bin().arg("--version").assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(stdout.contains("hydra-sync"));
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn help_lists_sync_once_command() {
    let assert = hydra_sync_bin().arg("--help").assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(stdout.contains("sync-once"));
}

#[test]
fn unknown_command_exits_with_usage_error() {
    hydra_sync_bin().arg("bogus").assert().code(2);
}
