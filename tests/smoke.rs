//! Smoke tests -- verify the binary runs and the CLI surface exists.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("robotbench")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("robot test orchestration"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("robotbench")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("robotbench"));
}

#[test]
fn test_run_subcommand_exists() {
    Command::cargo_bin("robotbench")
        .unwrap()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--platforms"));
}

#[test]
fn test_cases_lists_builtin_case() {
    Command::cargo_bin("robotbench")
        .unwrap()
        .env_remove("ROBOTBENCH_CONFIG")
        .arg("cases")
        .assert()
        .success()
        .stdout(predicates::str::contains("walk_forward"));
}

#[test]
fn test_platforms_list_shows_reference_pair() {
    Command::cargo_bin("robotbench")
        .unwrap()
        .env_remove("ROBOTBENCH_CONFIG")
        .args(["platforms", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("real_robot"))
        .stdout(predicates::str::contains("gazebo"));
}

#[test]
fn test_explicit_config_file_is_honored() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.toml");
    std::fs::write(
        &path,
        r#"
        [[platforms]]
        key = "mujoco"
        display_name = "MuJoCo"
        control_url = "http://127.0.0.1:9400"
        "#,
    )
    .unwrap();

    Command::cargo_bin("robotbench")
        .unwrap()
        .arg("--config")
        .arg(&path)
        .args(["platforms", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("mujoco"));
}
