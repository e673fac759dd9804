// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Live handover to a replacement broker.

mod common;

use common::{handset, list, serials, wait_for, Lab, Process, SETTLE};
use lab_broker::handover::Adoption;
use lab_broker::{ErrorKind, RemoteSession};
use serde_json::json;
use std::io::{BufRead, BufReader};
use std::process::Stdio;
use std::time::Duration;

/// Run `lab-broker restart` and return the new broker.
fn restart(lab: &Lab, fdtx_dir: &std::path::Path) -> Process {
    let mut child = lab
        .command()
        .arg("restart")
        .arg("--fdtx-dir")
        .arg(fdtx_dir)
        .arg("--timeout")
        .arg("10")
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    // the new broker inherits stdout: read the pid line, not to EOF
    let mut line = String::new();
    BufReader::new(child.stdout.take().unwrap())
        .read_line(&mut line)
        .unwrap();
    assert!(child.wait().unwrap().success(), "restart failed");
    Process::foreign(line.trim().parse().unwrap())
}

#[tokio::test]
async fn test_handover_keeps_allocations() {
    let lab = Lab::new(json!({"equipment": [handset("h1"), handset("h2"), handset("h3")]}));
    let mut old = lab.start();
    let fdtx = tempfile::tempdir().unwrap();

    let mut admin = lab.admin().await;
    let mut holder = lab.client().await;
    let mut held = holder
        .get(vec![json!({"type": "handset", "serial": "h1"})])
        .await
        .unwrap();
    let mut idle = lab.client().await;
    wait_for(&mut admin, "list_available", &["h2", "h3"]).await;
    let before = list(&mut admin, "list_available").await.len();
    drop(admin);

    let _new = restart(&lab, fdtx.path());

    let mut admin = lab.admin().await;
    let after = list(&mut admin, "list_available").await;
    assert_eq!(after.len(), before);
    assert_eq!(serials(&list(&mut admin, "list_allocations_all").await), ["h1"]);
    let serialized = admin.call("serialize", Vec::new()).await.unwrap();
    assert_eq!(serialized.as_object().map(|s| s.len()), Some(1));

    // the session survived and still answers
    let profile = held[0].call("get_profile", Vec::new()).await.unwrap();
    assert_eq!(profile["serial"], "h1");

    // the old broker no longer allocates
    let err = idle
        .call("get", vec![json!({"type": "handset", "serial": "h2"})])
        .await
        .unwrap_err();
    assert!(err.is(&ErrorKind::Restarting), "{:?}", err);

    // its clients still own their sessions: leaving releases on the new broker
    holder.close();
    wait_for(&mut admin, "list_available", &["h1", "h2", "h3"]).await;
    wait_for(&mut admin, "list_allocations_all", &[]).await;

    drop(idle);
    assert!(old.exits_within(SETTLE).await, "old broker did not drain");

    // the new broker serves fresh clients
    let mut client = lab.client().await;
    let held = client
        .get(vec![json!({"type": "handset", "serial": "h2"})])
        .await
        .unwrap();
    assert_eq!(held[0].profile().get_str("serial"), Some("h2"));
}

#[tokio::test]
async fn test_repeated_handover() {
    let lab = Lab::new(json!({"equipment": [handset("h1"), handset("h2")]}));
    let _first = lab.start();
    let fdtx = tempfile::tempdir().unwrap();

    let mut holder = lab.client().await;
    holder
        .get(vec![json!({"type": "handset", "serial": "h2"})])
        .await
        .unwrap();

    let _second = restart(&lab, fdtx.path());
    let _third = restart(&lab, fdtx.path());

    let mut admin = lab.admin().await;
    assert_eq!(serials(&list(&mut admin, "list_available").await), ["h1"]);
    assert_eq!(serials(&list(&mut admin, "list_allocations_all").await), ["h2"]);

    holder.close();
    wait_for(&mut admin, "list_available", &["h1", "h2"]).await;
}

#[tokio::test]
async fn test_begin_handover_checks_the_channel_directory() {
    let lab = Lab::new(json!({}));
    let _broker = lab.start();
    let mut admin = lab.admin().await;
    let scratch = tempfile::tempdir().unwrap();
    let file = scratch.path().join("file");
    std::fs::write(&file, "").unwrap();
    let dir = file.join("fdtx");

    let err = admin
        .call("begin_handover", vec![json!(dir.display().to_string())])
        .await
        .unwrap_err();
    assert!(err.message().contains("fd channel create failed"), "{:?}", err);
    // nothing changed: the broker still accepts clients
    let mut client = lab.client().await;
    let err = client
        .call("get", vec![json!({"type": "handset"})])
        .await
        .unwrap_err();
    assert!(err.is(&ErrorKind::NoSuch), "{:?}", err);
}

#[tokio::test]
async fn test_failed_handover_keeps_serving() {
    let lab = Lab::new(json!({"equipment": [handset("h1"), handset("h2")]}));
    let mut broker = lab.start();
    let fdtx = tempfile::tempdir().unwrap();

    let mut holder = lab.client().await;
    let mut held = holder
        .get(vec![json!({"type": "handset", "serial": "h1"})])
        .await
        .unwrap();

    let mut admin = lab.admin().await;
    admin
        .call("begin_handover", vec![json!(fdtx.path().display().to_string())])
        .await
        .unwrap();
    // nobody connects to the fd channel
    let err = admin
        .call("end_handover", vec![json!(0.3)])
        .await
        .unwrap_err();
    assert!(err.message().contains("no connection on the fd channel"), "{:?}", err);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!broker.exits_within(Duration::from_millis(100)).await, "broker exited");
    let profile = held[0].call("get_profile", Vec::new()).await.unwrap();
    assert_eq!(profile["serial"], "h1");

    // listening and allocation are back
    let mut client = lab.client().await;
    let other = client
        .get(vec![json!({"type": "handset", "serial": "h2"})])
        .await
        .unwrap();
    assert_eq!(other[0].profile().get_str("serial"), Some("h2"));
    let mut admin = lab.admin().await;
    wait_for(&mut admin, "list_allocations_all", &["h1", "h2"]).await;

    holder.close();
    wait_for(&mut admin, "list_allocations_all", &["h2"]).await;
    assert!(std::fs::read_dir(fdtx.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn test_session_lost_during_handover_is_not_adopted() {
    let lab = Lab::new(json!({"equipment": [handset("h1"), handset("h2")]}));
    let _old = lab.start();
    let fdtx = tempfile::tempdir().unwrap();

    let mut holder = lab.client().await;
    let held = holder
        .get(vec![json!({"type": "handset", "serial": "h1"})])
        .await
        .unwrap();
    let mut keeper = lab.client().await;
    let mut kept = keeper
        .get(vec![json!({"type": "handset", "serial": "h2"})])
        .await
        .unwrap();

    let mut admin = lab.admin().await;
    let reply = admin
        .call("begin_handover", vec![json!(fdtx.path().display().to_string())])
        .await
        .unwrap();
    let adoption = Adoption::from_handover(&reply).unwrap();
    assert_eq!(adoption.serialized.len(), 2);

    let key = held[0].authkey().unwrap().to_string();
    let pid = adoption.serialized[&key].pid;
    let mut session = RemoteSession::new(held[0].address().clone(), key, Some(SETTLE));
    let _ = session.call("crash", Vec::new()).await;
    assert!(Process::foreign(pid).exits_within(SETTLE).await, "session survived");
    // the old broker notices before it hands over
    tokio::time::sleep(Duration::from_millis(500)).await;

    let file = lab.home().join("adoption.json");
    adoption.to_file(&file).unwrap();
    let child = lab
        .command()
        .arg("serve")
        .arg("--adoption")
        .arg(&file)
        .spawn()
        .unwrap();
    let _new = Process::spawned(child);
    admin
        .call("end_handover", vec![json!(10.0)])
        .await
        .unwrap();
    drop(admin);

    let mut admin = lab.admin().await;
    wait_for(&mut admin, "list_allocations_all", &["h2"]).await;
    wait_for(&mut admin, "list_available", &["h1"]).await;
    let profile = kept[0].call("get_profile", Vec::new()).await.unwrap();
    assert_eq!(profile["serial"], "h2");
    drop(holder);
}
