use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

/// Command rooted in a scratch directory, with a config path that does not
/// exist (so defaults apply and the user's own config is never read).
fn cannery(dir: &tempfile::TempDir) -> assert_cmd::Command {
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("cannery").into();
    cmd.env("CANNERY_ROOT", dir.path().join("machines"))
        .env("CANNERY_CONFIG", dir.path().join("cannery.toml"))
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_works() {
    let dir = tempfile::tempdir().unwrap();
    cannery(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("install once, boot anytime"));
}

#[test]
fn list_empty_root() {
    let dir = tempfile::tempdir().unwrap();
    cannery(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No instances"));
    assert!(dir.path().join("machines").is_dir());
}

#[test]
fn create_then_list() {
    let dir = tempfile::tempdir().unwrap();
    cannery(&dir)
        .args(["create", "dev", "--memory", "8"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created instance 'dev'"));
    cannery(&dir).args(["create", "ci"]).assert().success();

    cannery(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("ci\tnot installed"))
        .stdout(predicate::str::contains("dev\tnot installed"));

    assert!(dir.path().join("machines/dev/options.json").is_file());
}

#[test]
fn duplicate_create_fails() {
    let dir = tempfile::tempdir().unwrap();
    cannery(&dir).args(["create", "dev", "--memory", "8"]).assert().success();

    cannery(&dir)
        .args(["create", "dev"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    // The first instance's options survive.
    cannery(&dir)
        .args(["show", "dev"])
        .assert()
        .success()
        .stdout(predicate::str::contains("8 GB"));
}

#[test]
fn create_rejects_bad_name() {
    let dir = tempfile::tempdir().unwrap();
    cannery(&dir)
        .args(["create", ".sneaky"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("instance name must match"));
}

#[test]
fn show_defaults() {
    let dir = tempfile::tempdir().unwrap();
    cannery(&dir).args(["create", "dev"]).assert().success();

    cannery(&dir)
        .args(["show", "dev"])
        .assert()
        .success()
        .stdout(predicate::str::contains("installed:     no"))
        .stdout(predicate::str::contains("memory:        4 GB"))
        .stdout(predicate::str::contains("display:       1920x1080"))
        .stdout(predicate::str::contains("serial:        off"));
}

#[test]
fn show_missing_instance() {
    let dir = tempfile::tempdir().unwrap();
    cannery(&dir)
        .args(["show", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn set_updates_options() {
    let dir = tempfile::tempdir().unwrap();
    cannery(&dir).args(["create", "dev"]).assert().success();

    cannery(&dir).args(["set", "dev", "memory", "16"]).assert().success();
    cannery(&dir).args(["set", "dev", "serial", "on"]).assert().success();
    cannery(&dir).args(["set", "dev", "vnc", "on"]).assert().success();

    cannery(&dir)
        .args(["show", "dev"])
        .assert()
        .success()
        .stdout(predicate::str::contains("memory:        16 GB"))
        .stdout(predicate::str::contains("serial0.out"))
        .stdout(predicate::str::contains("vnc:           port 5905"));
}

#[test]
fn set_rejects_unknown_key_and_bad_value() {
    let dir = tempfile::tempdir().unwrap();
    cannery(&dir).args(["create", "dev"]).assert().success();

    cannery(&dir)
        .args(["set", "dev", "turbo", "on"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown setting"));

    cannery(&dir)
        .args(["set", "dev", "memory", "lots"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn delete_moves_to_trash() {
    let dir = tempfile::tempdir().unwrap();
    cannery(&dir).args(["create", "dev"]).assert().success();

    cannery(&dir)
        .args(["delete", "dev"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Moved 'dev'"));

    let root = dir.path().join("machines");
    assert!(!root.join("dev").exists());
    let trashed: Vec<_> = std::fs::read_dir(root.join(".trash")).unwrap().collect();
    assert_eq!(trashed.len(), 1);

    cannery(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No instances"));
}

#[test]
fn delete_missing_instance() {
    let dir = tempfile::tempdir().unwrap();
    cannery(&dir)
        .args(["delete", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn bad_config_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("cannery.toml"), "[qemu\nbinary = ").unwrap();
    cannery(&dir).args(["create", "dev"]).assert().success();

    cannery(&dir)
        .args(["delete", "dev"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to parse config"));
    assert!(dir.path().join("machines/dev").is_dir());
}

#[test]
fn boot_rejects_bad_view_size() {
    let dir = tempfile::tempdir().unwrap();
    cannery(&dir)
        .args(["boot", "dev", "--view-size", "wide"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("view size"));
}

#[test]
fn instance_in_use_is_not_deleted_or_booted() {
    let dir = tempfile::tempdir().unwrap();
    cannery(&dir).args(["create", "dev"]).assert().success();
    let instance_dir = dir.path().join("machines/dev");
    let _held = cannery::lock::InstanceLock::acquire(&instance_dir, "dev").unwrap();

    cannery(&dir)
        .args(["delete", "dev"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("in use by another cannery process"));
    assert!(instance_dir.is_dir());

    cannery(&dir)
        .args(["-q", "boot", "dev"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("in use by another cannery process"));
}
