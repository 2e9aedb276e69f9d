use assert_cmd::Command;

fn modkeep() -> Command {
    Command::cargo_bin("modkeep").expect("binary builds")
}

#[test]
fn help_succeeds() {
    modkeep().arg("--help").assert().success();
}

#[test]
fn status_works_in_an_empty_home() {
    let temp = tempfile::tempdir().expect("tempdir");
    modkeep()
        .env("MODKEEP_HOME", temp.path())
        .arg("status")
        .assert()
        .success();
}

#[test]
fn history_reports_no_operations_in_an_empty_home() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = modkeep()
        .env("MODKEEP_HOME", temp.path())
        .arg("history")
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).to_string();
    assert!(stdout.contains("no recorded operations"));
}

#[test]
fn gc_runs_on_an_empty_store() {
    let temp = tempfile::tempdir().expect("tempdir");
    modkeep()
        .env("MODKEEP_HOME", temp.path())
        .args(["gc", "--force"])
        .assert()
        .success();
}

#[test]
fn removing_an_unknown_manifest_still_succeeds() {
    let temp = tempfile::tempdir().expect("tempdir");
    modkeep()
        .env("MODKEEP_HOME", temp.path())
        .args(["remove", "1.1.moddb.map.ghost"])
        .assert()
        .success();
}
