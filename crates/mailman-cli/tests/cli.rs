use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

#[test]
fn qrunner_list_prints_known_runner_names() {
    Command::new(assert_cmd::cargo::cargo_bin!("qrunner"))
        .arg("--list")
        .assert()
        .success()
        .stdout(contains("Incoming"))
        .stdout(contains("Outgoing"))
        .stdout(contains("Archive"));
}

#[test]
fn qrunner_rejects_an_unknown_runner_name() {
    let td = tempdir().unwrap();
    Command::new(assert_cmd::cargo::cargo_bin!("qrunner"))
        .args(["--once", "--runner=Bogus"])
        .env("MAILMAN_PREFIX_UNUSED", td.path())
        .assert()
        .failure();
}

#[test]
fn qrunner_requires_a_runner_argument() {
    Command::new(assert_cmd::cargo::cargo_bin!("qrunner")).assert().failure();
}

#[test]
fn mailmanctl_stop_without_a_pid_file_fails_with_usage_exit_code() {
    let td = tempdir().unwrap();
    let config_path = td.path().join("mailman.toml");
    std::fs::write(&config_path, format!("prefix = {:?}\n", td.path().join("var").display().to_string())).unwrap();

    Command::new(assert_cmd::cargo::cargo_bin!("mailmanctl"))
        .args(["--config", config_path.to_str().unwrap(), "stop"])
        .assert()
        .code(1);
}

#[test]
fn mmtask_moderation_succeeds_with_no_lists_present() {
    let td = tempdir().unwrap();
    let config_path = td.path().join("mailman.toml");
    std::fs::write(&config_path, format!("prefix = {:?}\n", td.path().join("var").display().to_string())).unwrap();

    Command::new(assert_cmd::cargo::cargo_bin!("mmtask"))
        .args(["--config", config_path.to_str().unwrap(), "moderation"])
        .assert()
        .success();
}

#[test]
fn mmtask_nntp_requires_list_and_server() {
    Command::new(assert_cmd::cargo::cargo_bin!("mmtask")).args(["nntp"]).assert().failure();
}
