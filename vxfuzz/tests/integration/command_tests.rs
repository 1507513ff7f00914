use crate::common::{assert_contains, assert_exit_code, init_test_logging, vxfuzz};
use tempfile::TempDir;

#[test]
fn test_help_lists_target_flags() {
    init_test_logging();
    crate::test_log!("TEST START: test_help_lists_target_flags");

    let dir = TempDir::new().unwrap();
    let output = vxfuzz(dir.path())
        .arg("--help")
        .output()
        .expect("Failed to run vxfuzz --help");

    assert!(output.status.success(), "vxfuzz --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains(&stdout, "VxWorks network service fuzzer");
    assert_contains(&stdout, "--target-addr");
    assert_contains(&stdout, "--target-port");
    assert_contains(&stdout, "--target-version");
    assert_contains(&stdout, "--session-timeout");
    crate::test_log!("TEST PASS: test_help_lists_target_flags");
}

#[test]
fn test_version_flag() {
    init_test_logging();
    crate::test_log!("TEST START: test_version_flag");

    let dir = TempDir::new().unwrap();
    let output = vxfuzz(dir.path())
        .arg("--version")
        .output()
        .expect("Failed to run vxfuzz --version");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains(&stdout, env!("CARGO_PKG_VERSION"));
    crate::test_log!("TEST PASS: test_version_flag");
}

#[test]
fn test_rejects_unsupported_target_version() {
    init_test_logging();
    crate::test_log!("TEST START: test_rejects_unsupported_target_version");

    let dir = TempDir::new().unwrap();
    let output = vxfuzz(dir.path())
        .args(["-v", "7"])
        .output()
        .expect("Failed to run vxfuzz");

    // clap usage errors exit with 2
    assert_exit_code(&output, 2);
    crate::test_log!("TEST PASS: test_rejects_unsupported_target_version");
}
