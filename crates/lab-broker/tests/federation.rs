// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Brokers cooperating through forward and share policies.

mod common;

use common::{list, serials, wait_for, Lab, SETTLE, SHARE_KEY};
use lab_broker::control::RemoteControl;
use serde_json::{json, Value};
use std::time::Instant;

fn mary(serial: &str) -> Value {
    json!({
        "type": "handset",
        "serial": serial,
        "pretty": "mary",
        "power_state": "boot_completed"
    })
}

#[tokio::test]
async fn test_forward_falls_back_to_master() {
    let master = Lab::new(json!({"equipment": [mary("m1")]}));
    let _master_broker = master.start();
    let forwarder = Lab::new(json!({
        "equipment": [mary("f1")],
        "remote": {"host": "127.0.0.1", "port": master.port, "policy": "forward"},
    }));
    let _forwarder_broker = forwarder.start();

    let wanted = json!({"type": "handset", "pretty": "mary"});
    let mut first = forwarder.client().await;
    let held = first.get(vec![wanted.clone()]).await.unwrap();
    assert_eq!(held[0].profile().get_str("serial"), Some("f1"));

    let mut second = forwarder.client().await;
    let mut held = second.get(vec![wanted]).await.unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].profile().get_str("serial"), Some("m1"));
    let profile = held[0].call("get_profile", Vec::new()).await.unwrap();
    assert_eq!(profile["serial"], "m1");

    let mut master_admin = master.admin().await;
    assert_eq!(
        serials(&list(&mut master_admin, "list_allocations_all").await),
        ["m1"]
    );

    second.close();
    wait_for(&mut master_admin, "list_allocations_all", &[]).await;
    wait_for(&mut master_admin, "list_available", &["m1"]).await;
}

#[tokio::test]
async fn test_shared_equipment_is_allocated_through_master() {
    let master = Lab::new(json!({}));
    let _master_broker = master.start();
    let share = Lab::new(json!({
        "equipment": [mary("h9")],
        "remote": {
            "host": "127.0.0.1",
            "port": master.port,
            "policy": "share",
            "authkey": SHARE_KEY,
        },
    }));
    let _share_broker = share.start();

    let mut master_admin = master.admin().await;
    let deadline = Instant::now() + SETTLE;
    while !serials(&list(&mut master_admin, "list_equipment").await).contains(&"h9".to_string())
    {
        assert!(Instant::now() < deadline, "share never reached the master");
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    let mut client = master.client().await;
    let held = client
        .get(vec![json!({"type": "handset", "serial": "h9"})])
        .await
        .unwrap();
    assert_eq!(held[0].profile().get_str("serial"), Some("h9"));

    let mut share_admin = share.admin().await;
    wait_for(&mut share_admin, "list_available", &[]).await;

    client.close();
    wait_for(&mut share_admin, "list_available", &["h9"]).await;
}

#[tokio::test]
async fn test_multi_allocation_forwards_what_is_busy() {
    let master = Lab::new(json!({"equipment": [mary("m1")]}));
    let _master_broker = master.start();
    let forwarder = Lab::new(json!({
        "equipment": [mary("f1")],
        "remote": {"host": "127.0.0.1", "port": master.port, "policy": "forward"},
    }));
    let _forwarder_broker = forwarder.start();

    let wanted = json!({"type": "handset", "pretty": "mary"});
    let mut client = forwarder.client().await;
    let mut held = client
        .get_multi(vec![vec![wanted.clone()], vec![wanted]])
        .await
        .unwrap();
    assert_eq!(held.len(), 2);
    assert_eq!(held[0].profile().get_str("serial"), Some("f1"));
    assert_eq!(held[1].profile().get_str("serial"), Some("m1"));
    let profile = held[1].call("get_profile", Vec::new()).await.unwrap();
    assert_eq!(profile["serial"], "m1");

    let mut master_admin = master.admin().await;
    wait_for(&mut master_admin, "list_allocations_all", &["m1"]).await;
    client.close();
    wait_for(&mut master_admin, "list_available", &["m1"]).await;
}

#[tokio::test]
async fn test_workspace_pushes_are_refused() {
    let lab = Lab::new(json!({}));
    let _broker = lab.start();
    let mut peer = RemoteControl::new(lab.address(), Some(SHARE_KEY.to_string()), Some(SETTLE));
    let peer_address = json!(["127.0.0.1", 1]);

    let err = peer
        .call("add_workspaces", vec![peer_address.clone(), json!([])])
        .await
        .unwrap_err();
    assert_eq!(err.message(), "add_workspaces() is obsolete. use set_equipment() instead");
    let err = peer
        .call("remove_workspaces", vec![peer_address, json!([])])
        .await
        .unwrap_err();
    assert_eq!(err.message(), "remove_workspaces() is obsolete. use set_equipment() instead");

    let mut anonymous = lab.client().await;
    let err = anonymous
        .call("add_workspaces", vec![json!(["127.0.0.1", 1]), json!([])])
        .await
        .unwrap_err();
    assert_eq!(err.message(), "not authorized to make this call");
}
