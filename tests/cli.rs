//! Server binary surface: flags parse, bad input fails fast.

use assert_cmd::Command;

#[test]
fn help_prints_usage() {
    Command::cargo_bin("bundocd")
        .expect("binary built")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("--data-dir"));
}

#[test]
fn unknown_flag_is_a_startup_failure() {
    Command::cargo_bin("bundocd")
        .expect("binary built")
        .arg("--definitely-not-a-flag")
        .assert()
        .failure();
}

#[test]
fn invalid_listen_address_is_rejected() {
    Command::cargo_bin("bundocd")
        .expect("binary built")
        .args(["--listen", "not-an-address"])
        .assert()
        .failure();
}
