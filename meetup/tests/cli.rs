//! Command line validation of the meetup binary

use std::process::Command;

fn meetup(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_meetup"))
        .args(args)
        .env_remove("MEETUP_LISTEN1")
        .env_remove("MEETUP_CONNECT1")
        .env_remove("MEETUP_LISTEN2")
        .env_remove("MEETUP_CONNECT2")
        .output()
        .expect("failed to run meetup")
}

#[test]
fn test_no_flags_exits_non_zero() {
    let output = meetup(&[]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Either -listen1 or -connect1 must be specified"), "{stderr}");
}

#[test]
fn test_missing_second_endpoint_exits_non_zero() {
    let output = meetup(&["-listen1=127.0.0.1:0"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Either -listen2 or -connect2 must be specified"), "{stderr}");
    // Validation happens before any socket is opened
    assert!(!stderr.contains("listening on"), "{stderr}");
}

#[test]
fn test_unusable_listen_address_exits_non_zero() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap().to_string();

    let output = meetup(&["-listen1", &addr, "-listen2=127.0.0.1:0"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to bind"), "{stderr}");
}
