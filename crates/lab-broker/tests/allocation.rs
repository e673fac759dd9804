// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Allocation through a running broker: busy equipment, collateral,
//! reclamation and authentication.

mod common;

use common::{handset, list, relay, serials, wait_for, Lab, SETTLE};
use lab_broker::control::RemoteControl;
use lab_broker::{ErrorKind, Profile};
use serde_json::json;

#[tokio::test]
async fn test_busy_then_yield() {
    let lab = Lab::new(json!({"equipment": [handset("x1")]}));
    let _broker = lab.start();

    let mut first = lab.client().await;
    let held = first.get(vec![json!({"type": "handset", "serial": "x1"})]).await.unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].profile().get_str("serial"), Some("x1"));

    let mut second = lab.client().await;
    let err = second
        .get(vec![json!({"type": "handset", "serial": "x1"})])
        .await
        .unwrap_err();
    assert!(err.is(&ErrorKind::Busy), "unexpected error {:?}", err);
    assert!(err.message().contains("busy"));

    let yielded: Vec<Profile> = held.iter().map(|h| h.profile().clone()).collect();
    first.yield_resources(&yielded).await.unwrap();

    // the failed request closed the second session: start over
    let mut second = lab.client().await;
    let held = second.get(vec![json!({"type": "handset", "serial": "x1"})]).await.unwrap();
    assert_eq!(held[0].profile().get_str("serial"), Some("x1"));
}

#[tokio::test]
async fn test_resource_calls_reach_the_session() {
    let lab = Lab::new(json!({"equipment": [handset("h1")]}));
    let _broker = lab.start();

    let mut client = lab.client().await;
    let mut held = client
        .get(vec![json!({"type": "handset"}), json!({"type": "workspace"})])
        .await
        .unwrap();
    assert_eq!(held.len(), 2);
    assert_ne!(held[0].address().port(), lab.port);

    let profile = held[0].call("get_profile", Vec::new()).await.unwrap();
    assert_eq!(profile["serial"], "h1");
    let path = held[1].call("get_path", Vec::new()).await.unwrap();
    let path = std::path::PathBuf::from(path.as_str().unwrap());
    assert!(path.starts_with(lab.home()));
    assert!(path.is_dir());
}

#[tokio::test]
async fn test_collateral_between_overlapping_stacks() {
    let lab = Lab::new(json!({
        "equipment": [relay("ra"), relay("rb"), handset("h1"), handset("h2"), handset("h3")],
        "stacks": [
            [relay("ra"), handset("h1")],
            [relay("ra"), handset("h2")],
            [relay("rb"), handset("h2")],
            [relay("rb"), handset("h3")],
        ],
    }));
    let _broker = lab.start();
    let mut admin = lab.admin().await;

    let mut a = lab.client().await;
    let held_a = a.get(vec![json!({"type": "relay", "uid": "ra"})]).await.unwrap();
    wait_for(&mut admin, "list_collateral_all", &["h1", "h2"]).await;

    let mut b = lab.client().await;
    let held_b = b.get(vec![json!({"type": "relay", "uid": "rb"})]).await.unwrap();
    wait_for(&mut admin, "list_collateral_all", &["h1", "h2", "h3"]).await;
    wait_for(&mut admin, "list_available", &[]).await;

    let ra: Vec<Profile> = held_a.iter().map(|h| h.profile().clone()).collect();
    a.yield_resources(&ra).await.unwrap();
    wait_for(&mut admin, "list_available", &["h1", "ra"]).await;

    let rb: Vec<Profile> = held_b.iter().map(|h| h.profile().clone()).collect();
    b.yield_resources(&rb).await.unwrap();
    wait_for(&mut admin, "list_available", &["h1", "h2", "h3", "ra", "rb"]).await;
}

#[tokio::test]
async fn test_lost_client_releases_everything() {
    let lab = Lab::new(json!({
        "equipment": [relay("r1"), handset("h1"), handset("h2")],
        "stacks": [[relay("r1"), handset("h1")]],
    }));
    let _broker = lab.start();
    let mut admin = lab.admin().await;

    let mut client = lab.client().await;
    client.get(vec![json!({"type": "relay"})]).await.unwrap();
    client
        .get(vec![json!({"type": "handset", "serial": "h2"})])
        .await
        .unwrap();
    wait_for(&mut admin, "list_available", &[]).await;
    assert_eq!(serials(&list(&mut admin, "list_allocations_all").await), ["h2", "r1"]);
    assert_eq!(serials(&list(&mut admin, "list_collateral_all").await), ["h1"]);

    client.close();
    wait_for(&mut admin, "list_available", &["h1", "h2", "r1"]).await;
    wait_for(&mut admin, "list_allocations_all", &[]).await;
}

#[tokio::test]
async fn test_wrong_key_is_survivable() {
    let lab = Lab::new(json!({"equipment": [handset("h1")]}));
    let _broker = lab.start();

    let mut intruder =
        RemoteControl::new(lab.address(), Some("not-the-key".to_string()), Some(SETTLE));
    intruder.connect(SETTLE, true).await.unwrap();
    assert!(!intruder.is_authenticated());
    let err = intruder.call("list_equipment", Vec::new()).await.unwrap_err();
    assert!(err.is(&ErrorKind::AuthError) || err.message().contains("not auth"), "{:?}", err);
    // the connection still serves open calls
    let profile = intruder.call("get_profile", Vec::new()).await.unwrap();
    assert_eq!(profile["type"], "broker");

    let mut admin = lab.admin().await;
    assert_eq!(serials(&list(&mut admin, "list_equipment").await), ["h1"]);
}

#[tokio::test]
async fn test_invalid_requests_leave_nothing_behind() {
    let lab = Lab::new(json!({"equipment": [handset("h1")]}));
    let _broker = lab.start();
    let mut admin = lab.admin().await;

    let mut client = lab.client().await;
    let err = client.call("get", vec![json!({"serial": "h1"})]).await.unwrap_err();
    assert!(err.message().contains("\"type\" field is missing"));
    let err = client
        .call("get", vec![json!({"type": "handset", "serial": "nope"})])
        .await
        .unwrap_err();
    assert!(err.is(&ErrorKind::NoSuch), "{:?}", err);
    wait_for(&mut admin, "list_available", &["h1"]).await;
    assert!(list(&mut admin, "list_allocations_all").await.is_empty());
}

#[tokio::test]
async fn test_multi_allocation_places_groups_independently() {
    let lab = Lab::new(json!({"equipment": [handset("h1"), handset("h2"), relay("r1")]}));
    let _broker = lab.start();
    let mut admin = lab.admin().await;

    let mut client = lab.client().await;
    let mut held = client
        .get_multi(vec![
            vec![json!({"type": "handset"})],
            vec![json!({"type": "handset"}), json!({"type": "relay"})],
        ])
        .await
        .unwrap();
    assert_eq!(held.len(), 3);
    let first = held[0].profile().get_str("serial").unwrap().to_string();
    let second = held[1].profile().get_str("serial").unwrap().to_string();
    assert_ne!(first, second);
    assert_eq!(held[2].profile().get_str("uid"), Some("r1"));
    let profile = held[1].call("get_profile", Vec::new()).await.unwrap();
    assert_eq!(profile["serial"], json!(second));
    wait_for(&mut admin, "list_allocations_all", &["h1", "h2", "r1"]).await;

    client.close();
    wait_for(&mut admin, "list_available", &["h1", "h2", "r1"]).await;

    // a bare profile is a group of one
    let mut client = lab.client().await;
    let responses = client
        .call("get_multi_resources", vec![json!({"type": "relay"})])
        .await
        .unwrap();
    let responses = responses.as_array().unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["resources"][0]["uid"], "r1");
}

#[tokio::test]
async fn test_multi_allocation_failure_releases_every_group() {
    let lab = Lab::new(json!({"equipment": [handset("h1")]}));
    let _broker = lab.start();
    let mut admin = lab.admin().await;

    let mut client = lab.client().await;
    let err = client
        .get_multi(vec![
            vec![json!({"type": "handset"})],
            vec![json!({"type": "handset"})],
        ])
        .await
        .unwrap_err();
    assert!(err.is(&ErrorKind::Busy), "{:?}", err);
    wait_for(&mut admin, "list_available", &["h1"]).await;
    assert!(list(&mut admin, "list_allocations_all").await.is_empty());

    // the failure closed the session: start over
    let mut client = lab.client().await;
    let err = client
        .call("get_multi_resources", vec![json!([{"serial": "h1"}])])
        .await
        .unwrap_err();
    assert!(err.message().contains("\"type\" field is missing"));
}
