//! End-to-end state-sync scenarios over in-process sessions.
//!
//! A simulated router peer speaks the wire protocol at the management
//! controller's sync engine: discovery, manifest exchange, pull
//! reconciliation, and per-peer ordering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use vanfab_db::PeerClass;
use vanfab_protocol::{
    decode, encode, GetState, GetStateReply, Heartbeat, Message, MGMT_CONTROLLER_ADDRESS,
};
use vanfab_sync::{PeerEvents, StateSync, SyncConfig, SyncResult};
use vanfab_transport::Session;

/// Event recorder standing in for the sync bridge.
struct Recorder {
    local: HashMap<String, String>,
    remote: HashMap<String, String>,
    changes: Mutex<Vec<(String, Option<String>)>>,
}

impl Recorder {
    fn new(local: Vec<(&str, &str)>, remote: Vec<(&str, &str)>) -> Arc<Self> {
        let to_map = |pairs: Vec<(&str, &str)>| {
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        Arc::new(Self {
            local: to_map(local),
            remote: to_map(remote),
            changes: Mutex::new(Vec::new()),
        })
    }

    fn changes(&self) -> Vec<(String, Option<String>)> {
        self.changes.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerEvents for Recorder {
    async fn on_new_peer(
        &self,
        _peer_id: &str,
        _class: PeerClass,
    ) -> SyncResult<(HashMap<String, String>, HashMap<String, String>)> {
        Ok((self.local.clone(), self.remote.clone()))
    }

    async fn on_ping(&self, _peer_id: &str) {}

    async fn on_state_change(
        &self,
        _peer_id: &str,
        key: &str,
        hash: Option<&str>,
        _data: Option<Value>,
    ) {
        self.changes
            .lock()
            .unwrap()
            .push((key.to_string(), hash.map(str::to_string)));
    }

    async fn on_state_request(&self, _peer_id: &str, key: &str) -> SyncResult<(String, Value)> {
        let hash = self
            .local
            .get(key)
            .cloned()
            .ok_or_else(|| vanfab_sync::SyncError::Events(format!("no key {key}")))?;
        Ok((hash, json!({"payload": key})))
    }
}

fn controller(events: Arc<dyn PeerEvents>) -> (StateSync, Session) {
    let mut config = SyncConfig::new(PeerClass::Management, "controller");
    config.receive_address = Some(MGMT_CONTROLLER_ADDRESS.to_string());
    let engine = StateSync::new(config);
    engine.set_events(events);
    let (controller_side, router_side) = Session::pair();
    engine.add_connection(Some(uuid::Uuid::new_v4()), &controller_side);
    (engine, router_side)
}

fn heartbeat_body(site: &str, hashset: Option<Vec<(&str, &str)>>) -> Value {
    encode(&Message::Heartbeat(Heartbeat {
        site: site.into(),
        sclass: "backbone".into(),
        address: format!("router/{site}"),
        hashset: hashset.map(|pairs| {
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        }),
    }))
}

/// Discovery law: the first heartbeat is answered with a manifest whose
/// keys equal the advertised local state, and each advertised hash is what
/// a pull of that key returns.
#[tokio::test]
async fn new_peer_manifest_matches_state_requests() {
    let recorder = Recorder::new(vec![("tls-site-1", "SH"), ("access-ap1", "AH")], vec![]);
    let (_engine, router) = controller(recorder);
    let (_, mut rx) = router.open_receiver(Some("router/s1"));

    router
        .send_message(MGMT_CONTROLLER_ADDRESS, heartbeat_body("s1", None), Value::Null)
        .unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let Message::Heartbeat(hb) = decode(&delivery.body).unwrap() else {
        panic!("expected heartbeat");
    };
    let hashset = hb.hashset.expect("manifest expected");
    let mut keys: Vec<&str> = hashset.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["access-ap1", "tls-site-1"]);

    // Pull each advertised key; the returned hash must match the advert.
    for (key, advertised) in &hashset {
        let body = encode(&Message::GetState(GetState {
            site: "s1".into(),
            statekey: key.clone(),
        }));
        let (_, reply) = router
            .request(MGMT_CONTROLLER_ADDRESS, body, Value::Null, Duration::from_secs(2))
            .await
            .unwrap();
        let reply: GetStateReply = serde_json::from_value(reply).unwrap();
        let (_, hash, _) = reply.into_success().unwrap();
        assert_eq!(&hash, advertised);
    }
}

/// Heartbeat reconciliation: a changed hash produces a GET, an
/// on_state_change with the new hash, and an updated remote manifest.
#[tokio::test]
async fn changed_hash_is_pulled_and_recorded() {
    let recorder = Recorder::new(vec![], vec![("link-L1", "H0")]);
    let (engine, router) = controller(recorder.clone());
    let (_, mut rx) = router.open_receiver(Some("router/s1"));

    router
        .send_message(MGMT_CONTROLLER_ADDRESS, heartbeat_body("s1", None), Value::Null)
        .unwrap();
    let _ = rx.recv().await.unwrap(); // answering heartbeat

    router
        .send_message(
            MGMT_CONTROLLER_ADDRESS,
            heartbeat_body("s1", Some(vec![("link-L1", "H1")])),
            Value::Null,
        )
        .unwrap();

    let get = rx.recv().await.unwrap();
    let Message::GetState(request) = decode(&get.body).unwrap() else {
        panic!("expected GET");
    };
    assert_eq!(request.statekey, "link-L1");
    let reply = GetStateReply::ok("link-L1", "H1", json!({"host": "h", "port": "p"}));
    router
        .respond(&get, serde_json::to_value(&reply).unwrap(), Value::Null)
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if engine.remote_hash("s1", "link-L1").await.as_deref() == Some("H1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("remote manifest should converge");
    assert_eq!(
        recorder.changes(),
        vec![("link-L1".to_string(), Some("H1".to_string()))]
    );
}

/// Per-peer FIFO ordering: the order of on_state_change calls matches the
/// order of pulls issued, across consecutive heartbeats.
#[tokio::test]
async fn state_changes_follow_pull_order() {
    let recorder = Recorder::new(vec![], vec![]);
    let (_engine, router) = controller(recorder.clone());
    let (_, mut rx) = router.open_receiver(Some("router/s1"));

    router
        .send_message(MGMT_CONTROLLER_ADDRESS, heartbeat_body("s1", None), Value::Null)
        .unwrap();
    let _ = rx.recv().await.unwrap();

    // Two heartbeats in a burst, each advertising a different generation.
    router
        .send_message(
            MGMT_CONTROLLER_ADDRESS,
            heartbeat_body("s1", Some(vec![("link-a", "A1"), ("link-b", "B1")])),
            Value::Null,
        )
        .unwrap();
    router
        .send_message(
            MGMT_CONTROLLER_ADDRESS,
            heartbeat_body("s1", Some(vec![("link-a", "A2"), ("link-b", "B1")])),
            Value::Null,
        )
        .unwrap();

    let mut served = Vec::new();
    // First heartbeat pulls link-a and link-b; the second (processed only
    // after the first completes) pulls link-a again.
    for _ in 0..3 {
        let get = rx.recv().await.unwrap();
        let Message::GetState(request) = decode(&get.body).unwrap() else {
            panic!("expected GET");
        };
        // Hash value keyed by generation: served in arrival order.
        let hash = match (request.statekey.as_str(), served.len()) {
            ("link-a", 0) => "A1",
            ("link-b", _) => "B1",
            ("link-a", _) => "A2",
            other => panic!("unexpected pull {other:?}"),
        };
        served.push((request.statekey.clone(), hash.to_string()));
        let reply = GetStateReply::ok(&request.statekey, hash, json!({}));
        router
            .respond(&get, serde_json::to_value(&reply).unwrap(), Value::Null)
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if recorder.changes().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all pulls should land");

    let observed: Vec<(String, Option<String>)> = recorder.changes();
    let expected: Vec<(String, Option<String>)> = served
        .into_iter()
        .map(|(k, h)| (k, Some(h)))
        .collect();
    assert_eq!(observed, expected);
}

/// A beaconing node with an extra target reaches the controller and ends
/// its beacon phase when the controller answers.
#[tokio::test]
async fn member_node_beacons_to_the_controller() {
    // Controller engine.
    let controller_events = Recorder::new(vec![("tls-site-m1", "MH")], vec![]);
    let mut controller_config = SyncConfig::new(PeerClass::Management, "controller");
    controller_config.receive_address = Some(MGMT_CONTROLLER_ADDRESS.to_string());
    let controller_engine = StateSync::new(controller_config);
    controller_engine.set_events(controller_events);

    // Member engine beacons every 50ms for the test.
    let member_events = Recorder::new(vec![], vec![]);
    let member_id = uuid::Uuid::new_v4().to_string();
    let mut member_config = SyncConfig::new(PeerClass::Member, member_id.as_str());
    member_config.beacon_period = Duration::from_millis(50);
    let member_engine = StateSync::new(member_config);
    member_engine.set_events(member_events);

    let (controller_side, member_side) = Session::pair();
    controller_engine.add_connection(Some(uuid::Uuid::new_v4()), &controller_side);
    member_engine.add_connection(None, &member_side);
    member_engine.add_target(MGMT_CONTROLLER_ADDRESS);
    member_engine.start();

    // The controller learns the member; the member gets an answering
    // heartbeat, ending its beacon phase and tracking the controller.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if !controller_engine.local_keys(&member_id).await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("controller should track the beaconing member");

    member_engine.stop();
    controller_engine.stop();
}
