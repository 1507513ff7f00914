use crate::common::{HarnessFixture, assert_exit_code, init_test_logging, vxfuzz};
use std::fs;

#[test]
fn test_session_against_fake_environment() {
    init_test_logging();
    crate::test_log!("TEST START: test_session_against_fake_environment");

    let fixture = HarnessFixture::new(false);
    let output = vxfuzz(fixture.root())
        .args(["--max-tests", "3", "-l", "debug"])
        .output()
        .expect("Failed to run vxfuzz");

    assert_exit_code(&output, 0);
    assert!(!fixture.crash_log.exists(), "no crash expected");

    let log = fs::read_to_string(&fixture.session_log).expect("session log written");
    assert!(log.contains("Started VxWorks 6.x fuzzing session"));
    assert!(log.contains("Session finished: 3 tests"));
    crate::test_log!("TEST PASS: test_session_against_fake_environment");
}

#[test]
fn test_crash_is_written_to_crash_log() {
    init_test_logging();
    crate::test_log!("TEST START: test_crash_is_written_to_crash_log");

    let fixture = HarnessFixture::new(true);
    let output = vxfuzz(fixture.root())
        .args(["--max-tests", "2"])
        .output()
        .expect("Failed to run vxfuzz");

    assert_exit_code(&output, 0);
    let raw = fs::read_to_string(&fixture.crash_log).expect("crash log written");
    let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
    assert_eq!(lines.len(), 1);

    let report: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(report["test_number"], 0);
    assert_eq!(report["context"]["task"], "tPortmapd");
    crate::test_log!("TEST PASS: test_crash_is_written_to_crash_log");
}
