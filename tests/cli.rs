use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_feed_urls() {
    Command::cargo_bin("flashblocks-monitor")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--block-ws-url"))
        .stdout(predicate::str::contains("--flashblocks-ws-url"));
}

#[test]
fn test_rejects_empty_block_buffer() {
    Command::cargo_bin("flashblocks-monitor")
        .unwrap()
        .args(["--max-blocks", "0"])
        .env_remove("MAX_BLOCKS")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid arguments"));
}

#[test]
fn test_rejects_out_of_range_jitter() {
    Command::cargo_bin("flashblocks-monitor")
        .unwrap()
        .args(["--reconnect-jitter", "1.5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid arguments"));
}
