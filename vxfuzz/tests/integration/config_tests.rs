use crate::common::{HarnessFixture, assert_contains, assert_exit_code, init_test_logging, vxfuzz};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_missing_config_exits_with_config_code() {
    init_test_logging();
    crate::test_log!("TEST START: test_missing_config_exits_with_config_code");

    let dir = TempDir::new().unwrap();
    let output = vxfuzz(dir.path()).output().expect("Failed to run vxfuzz");

    assert_exit_code(&output, 6);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_contains(&stderr, "no configuration file found");
    crate::test_log!("TEST PASS: test_missing_config_exits_with_config_code");
}

#[test]
fn test_missing_vmrun_is_rejected_before_startup() {
    init_test_logging();
    crate::test_log!("TEST START: test_missing_vmrun_is_rejected_before_startup");

    let fixture = HarnessFixture::new(false);
    fs::remove_file(&fixture.vmrun).unwrap();

    let output = vxfuzz(fixture.root()).output().expect("Failed to run vxfuzz");

    assert_exit_code(&output, 6);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_contains(&stderr, "vmware.vmrun");
    assert!(!fixture.session_log.exists(), "nothing should run");
    crate::test_log!("TEST PASS: test_missing_vmrun_is_rejected_before_startup");
}

#[test]
fn test_cli_overrides_are_validated() {
    init_test_logging();
    crate::test_log!("TEST START: test_cli_overrides_are_validated");

    let fixture = HarnessFixture::new(false);
    let output = vxfuzz(fixture.root())
        .args(["--config"])
        .arg(&fixture.config)
        .args(["-p", "0"])
        .output()
        .expect("Failed to run vxfuzz");

    assert_exit_code(&output, 6);
    assert_contains(&String::from_utf8_lossy(&output.stderr), "target.port");
    crate::test_log!("TEST PASS: test_cli_overrides_are_validated");
}
