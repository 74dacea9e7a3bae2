mod common;

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use common::ScriptedRunner;
use reportforge::error::ForgeError;
use reportforge::freeze::BundleManifest;
use reportforge::matrix::VersionMatrix;
use reportforge::pin::{PinnedRevision, ReferenceKind};
use reportforge::platform::{CommandOutput, HostPlatform};
use reportforge::validation::{
    ArtifactValidator, FileCountCheck, Probe, ServerCheck, ValidationPlan, wait_for_release,
    wait_for_server,
};
use tempfile::tempdir;

const ID_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

fn plan() -> ValidationPlan {
    ValidationPlan {
        required_paths: vec![PathBuf::from("engine/_internal/superset/templates")],
        min_file_counts: vec![FileCountCheck {
            path: PathBuf::from("engine/_internal/superset/migrations/versions"),
            min: 300,
        }],
        server: ServerCheck {
            enabled: false,
            ..ServerCheck::default()
        },
        ..ValidationPlan::default()
    }
}

fn populate(bundle: &Path, migrations: usize) {
    let launcher = bundle.join(HostPlatform::current().executable_name("reportgui"));
    fs::create_dir_all(bundle.join("engine/_internal/superset/templates")).unwrap();
    fs::write(launcher, "").unwrap();
    let versions = bundle.join("engine/_internal/superset/migrations/versions");
    fs::create_dir_all(&versions).unwrap();
    for idx in 0..migrations {
        fs::write(versions.join(format!("{idx:04}_rev.py")), "").unwrap();
    }
}

fn matrix(id: &str) -> VersionMatrix {
    VersionMatrix::new(
        PinnedRevision {
            reference_kind: ReferenceKind::ExplicitId,
            requested_value: id.into(),
            resolved_id: id.into(),
            resolved_display_name: id[..12].into(),
        },
        "4.1.1",
        BTreeMap::new(),
        "0.1.0",
    )
}

fn write_bundle_manifest(bundle: &Path, id: &str) {
    BundleManifest {
        manifest_version: 1,
        app_name: "pyPASreporterGUI".into(),
        app_version: "0.1.0".into(),
        resolved_id: id.into(),
        external_version: "4.1.1".into(),
        engine: PathBuf::from("engine/superset-engine"),
        resource_root: PathBuf::from("engine/_internal"),
        hidden_imports: vec!["superset.app".into()],
        resources: Vec::new(),
        generated_at: Utc::now(),
    }
    .write(bundle)
    .unwrap();
}

/// Behaves like a healthy launcher: `init` fills the scratch home.
fn healthy_launcher() -> ScriptedRunner {
    ScriptedRunner::new(|invocation| {
        if invocation.args.first().map(String::as_str) == Some("init") {
            let home = invocation.cwd.clone().unwrap();
            fs::write(home.join("superset_config.py"), "").unwrap();
            fs::write(home.join("superset.db"), "").unwrap();
        }
        CommandOutput::ok("")
    })
}

#[test]
fn complete_bundle_passes_every_check() {
    let temp = tempdir().unwrap();
    let bundle = temp.path().join("bundle");
    populate(&bundle, 305);
    write_bundle_manifest(&bundle, ID_A);
    let scratch = temp.path().join("validate-home");
    fs::create_dir_all(&scratch).unwrap();
    fs::write(scratch.join("leftover.db"), "").unwrap();
    let recorded = matrix(ID_A);
    let plan = plan();
    let runner = healthy_launcher();

    let report = ArtifactValidator::new(&runner, &plan, bundle, scratch.clone())
        .with_matrix(Some(&recorded))
        .validate();

    assert!(report.passed(), "{:?}", report.checks);
    assert!(!scratch.join("leftover.db").exists(), "scratch home not reset");
    assert!(scratch.join("superset.db").is_file());
    let names: Vec<&str> = report.checks.iter().map(|c| c.name.as_str()).collect();
    assert!(names.contains(&"bundle-revision"));
    assert!(names.contains(&"diagnostic"));
    assert!(names.contains(&"init"));
}

#[test]
fn independent_failures_are_all_reported() {
    let temp = tempdir().unwrap();
    let bundle = temp.path().join("bundle");
    populate(&bundle, 50);
    fs::remove_dir_all(bundle.join("engine/_internal/superset/templates")).unwrap();
    write_bundle_manifest(&bundle, "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
    let recorded = matrix(ID_A);
    let plan = plan();
    let runner = ScriptedRunner::new(|invocation| {
        if invocation.args.first().map(String::as_str) == Some("doctor") {
            CommandOutput::failed(8, "branding-static missing")
        } else {
            CommandOutput::ok("")
        }
    });

    let report = ArtifactValidator::new(&runner, &plan, bundle, temp.path().join("home"))
        .with_matrix(Some(&recorded))
        .validate();

    let failed: Vec<&str> = report
        .checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(
        failed,
        vec![
            "exists:engine/_internal/superset/templates",
            "file-count:engine/_internal/superset/migrations/versions",
            "bundle-revision",
            "diagnostic",
            "init",
        ]
    );
    let count = report
        .checks
        .iter()
        .find(|c| c.name.starts_with("file-count"))
        .unwrap();
    assert!(count.detail.contains("found 50 files"), "{}", count.detail);

    match report.into_result() {
        Err(ForgeError::ValidationFailure { failures, checks }) => {
            assert_eq!(failures, 5);
            assert!(checks.iter().any(|c| c.contains("did not create superset_config.py")));
        }
        other => panic!("unexpected {other:?}"),
    }
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn quick_check(port: u16) -> ServerCheck {
    ServerCheck {
        port,
        attempts: 5,
        interval_ms: 20,
        ..ServerCheck::default()
    }
}

#[test]
fn health_endpoint_is_preferred() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming().take(4) {
            let Ok(mut stream) = stream else { continue };
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK",
            );
        }
    });

    let probe = wait_for_server(&quick_check(port), || None).unwrap();
    assert_eq!(probe, Probe::Health);
}

#[test]
fn bare_socket_counts_as_started() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming().take(8) {
            drop(stream);
        }
    });

    let probe = wait_for_server(&quick_check(port), || None).unwrap();
    assert_eq!(probe, Probe::Socket);
}

#[test]
fn unreachable_server_times_out() {
    let port = free_port();
    let err = wait_for_server(&quick_check(port), || None).unwrap_err();
    assert!(err.contains("after 5 attempts"), "{err}");
}

#[test]
fn crashed_server_ends_the_wait_early() {
    let port = free_port();
    let mut polls = 0;
    let err = wait_for_server(&quick_check(port), || {
        polls += 1;
        (polls > 1).then(|| "exit status: 1".to_string())
    })
    .unwrap_err();
    assert!(err.contains("exited before binding"), "{err}");
    assert_eq!(polls, 2);
}

#[test]
fn port_release_waits_for_the_listener_to_close() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    assert!(!wait_for_release("127.0.0.1", port, Duration::from_millis(200)));
    drop(listener);
    assert!(wait_for_release("127.0.0.1", port, Duration::from_secs(2)));
}

#[test]
fn occupied_port_fails_without_starting_the_launcher() {
    let temp = tempdir().unwrap();
    let bundle = temp.path().join("bundle");
    populate(&bundle, 305);
    let occupant = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupant.local_addr().unwrap().port();
    let plan = ValidationPlan {
        server: quick_check(port),
        ..plan()
    };
    let runner = healthy_launcher();

    let report = ArtifactValidator::new(&runner, &plan, bundle, temp.path().join("home")).validate();

    let start = report
        .checks
        .iter()
        .find(|c| c.name == "server-start")
        .unwrap();
    assert!(!start.passed);
    assert!(start.detail.contains("already in use"), "{}", start.detail);
    assert!(report.checks.iter().all(|c| c.name != "port-release"));
    assert!(!report.passed());
    drop(occupant);
}
