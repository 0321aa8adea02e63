//! The state-sync engine.
//!
//! For each peer the engine tracks two hash manifests keyed by state key:
//! `local_state` (what we advertise to the peer) and `remote_state` (what
//! the peer last advertised to us). No payloads are stored, only hashes;
//! payloads move over GET pulls when a hash disagrees.
//!
//! Per-peer ordering: every peer has a FIFO work queue and a processing
//! flag. Inbound messages append to the queue; one drain task at a time
//! works it down, so two messages from the same peer are strictly
//! serialized while peers remain independent.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vanfab_db::PeerClass;
use vanfab_protocol::{
    decode, encode, GetState, GetStateReply, Heartbeat, Message,
};
use vanfab_transport::{Delivery, Session, DEFAULT_REQUEST_TIMEOUT};

use crate::{SyncError, SyncResult};

/// Connection key for sessions not tied to a backbone.
const NET: &str = "net";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Class this node presents to peers
    pub class: PeerClass,
    /// Site identifier this node presents to peers
    pub id: String,
    /// Static receive address; None allocates dynamically per connection
    pub receive_address: Option<String>,
    pub heartbeat_period: Duration,
    pub heartbeat_window: Duration,
    pub beacon_period: Duration,
}

impl SyncConfig {
    pub fn new(class: PeerClass, id: impl Into<String>) -> Self {
        Self {
            class,
            id: id.into(),
            receive_address: None,
            heartbeat_period: Duration::from_secs(10),
            heartbeat_window: Duration::from_secs(5),
            beacon_period: Duration::from_secs(5),
        }
    }
}

/// Callbacks the embedding provides; dispatched by peer class in the bridge.
#[async_trait]
pub trait PeerEvents: Send + Sync {
    /// A never-seen peer sent its first heartbeat. Returns the initial
    /// `(local_state, remote_state)` manifests for the peer.
    async fn on_new_peer(
        &self,
        peer_id: &str,
        class: PeerClass,
    ) -> SyncResult<(HashMap<String, String>, HashMap<String, String>)>;

    /// A known peer heartbeated.
    async fn on_ping(&self, peer_id: &str);

    /// A pulled state entry changed (`hash`/`data` present) or was deleted
    /// (both absent).
    async fn on_state_change(
        &self,
        peer_id: &str,
        key: &str,
        hash: Option<&str>,
        data: Option<Value>,
    );

    /// A peer pulled one of our advertised keys; return `(hash, data)`.
    async fn on_state_request(&self, peer_id: &str, key: &str) -> SyncResult<(String, Value)>;
}

enum Work {
    Heartbeat(Heartbeat),
    Get(GetState, Delivery, String),
}

struct PeerState {
    class: PeerClass,
    /// The peer's receive address, refreshed from each heartbeat
    address: String,
    /// Connection the peer last spoke on
    conn_key: String,
    /// False until on_new_peer has initialized the manifests
    known: bool,
    local_state: HashMap<String, String>,
    remote_state: HashMap<String, String>,
    queue: VecDeque<Work>,
    processing: bool,
    heartbeat_task: Option<JoinHandle<()>>,
}

struct ConnEntry {
    session: Session,
    pump: JoinHandle<()>,
    receive_address: String,
}

struct EngineInner {
    config: SyncConfig,
    events: RwLock<Option<Arc<dyn PeerEvents>>>,
    local_address: RwLock<Option<String>>,
    seen_heartbeat: AtomicBool,
    peers: Mutex<HashMap<String, PeerState>>,
    connections: RwLock<HashMap<String, ConnEntry>>,
    extra_targets: RwLock<Vec<String>>,
    beacon_task: RwLock<Option<JoinHandle<()>>>,
}

/// The state-sync engine. Cheap to clone.
#[derive(Clone)]
pub struct StateSync {
    inner: Arc<EngineInner>,
}

impl StateSync {
    pub fn new(config: SyncConfig) -> Self {
        let local_address = config.receive_address.clone();
        Self {
            inner: Arc::new(EngineInner {
                config,
                events: RwLock::new(None),
                local_address: RwLock::new(local_address),
                seen_heartbeat: AtomicBool::new(false),
                peers: Mutex::new(HashMap::new()),
                connections: RwLock::new(HashMap::new()),
                extra_targets: RwLock::new(Vec::new()),
                beacon_task: RwLock::new(None),
            }),
        }
    }

    /// Install the embedding's event handlers. Must be called before any
    /// connection is added.
    pub fn set_events(&self, events: Arc<dyn PeerEvents>) {
        *self.inner.events.write().unwrap() = Some(events);
    }

    /// Register a target that is not auto-discoverable; beacons go to every
    /// extra target over the `net` connection until a heartbeat arrives.
    pub fn add_target(&self, address: &str) {
        self.inner
            .extra_targets
            .write()
            .unwrap()
            .push(address.to_string());
    }

    /// Register a session under a backbone id (or the `net` sentinel) and
    /// start receiving on it.
    pub fn add_connection(&self, backbone: Option<uuid::Uuid>, session: &Session) {
        let conn_key = backbone.map(|b| b.to_string()).unwrap_or_else(|| NET.into());
        let (address, mut rx) =
            session.open_receiver(self.inner.config.receive_address.as_deref());

        // First dynamically allocated address becomes the advertised one.
        {
            let mut local = self.inner.local_address.write().unwrap();
            if local.is_none() {
                info!(%address, "sync receive address allocated");
                *local = Some(address.clone());
            }
        }

        let engine = self.inner.clone();
        let pump_key = conn_key.clone();
        let pump = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                EngineInner::handle_delivery(&engine, &pump_key, delivery).await;
            }
        });

        self.inner.connections.write().unwrap().insert(
            conn_key.clone(),
            ConnEntry {
                session: session.clone(),
                pump,
                receive_address: address,
            },
        );
        debug!(conn = %conn_key, "sync connection added");
    }

    /// Drop a session mapping. Peer records survive; a stale-peer sweep is
    /// a future concern.
    pub fn delete_connection(&self, backbone: Option<uuid::Uuid>) {
        let conn_key = backbone.map(|b| b.to_string()).unwrap_or_else(|| NET.into());
        if let Some(entry) = self.inner.connections.write().unwrap().remove(&conn_key) {
            entry.pump.abort();
            entry.session.close_receiver(&entry.receive_address);
            debug!(conn = %conn_key, "sync connection deleted");
        }
    }

    /// Start the beacon phase: body-less heartbeats to every extra target
    /// until the first heartbeat is received.
    pub fn start(&self) {
        let engine = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                if engine.seen_heartbeat.load(Ordering::SeqCst) {
                    break;
                }
                engine.send_beacons();
                tokio::time::sleep(engine.config.beacon_period).await;
            }
        });
        *self.inner.beacon_task.write().unwrap() = Some(task);
    }

    /// Stop background tasks.
    pub fn stop(&self) {
        if let Some(task) = self.inner.beacon_task.write().unwrap().take() {
            task.abort();
        }
        for entry in self.inner.connections.write().unwrap().values() {
            entry.pump.abort();
        }
        // Heartbeat timers die with their peers.
        if let Ok(mut peers) = self.inner.peers.try_lock() {
            for peer in peers.values_mut() {
                if let Some(task) = peer.heartbeat_task.take() {
                    task.abort();
                }
            }
        }
    }

    /// Mutate the local manifest for one peer and heartbeat immediately,
    /// cancelling any pending timer. `hash = None` removes the key.
    pub async fn update_local_state(&self, peer_id: &str, key: &str, hash: Option<&str>) {
        {
            let mut peers = self.inner.peers.lock().await;
            let Some(peer) = peers.get_mut(peer_id) else {
                debug!(peer = peer_id, "update_local_state for unknown peer ignored");
                return;
            };
            match hash {
                Some(hash) => {
                    peer.local_state.insert(key.to_string(), hash.to_string());
                }
                None => {
                    peer.local_state.remove(key);
                }
            }
            if let Some(task) = peer.heartbeat_task.take() {
                task.abort();
            }
        }
        self.inner.send_heartbeat(peer_id).await;
        EngineInner::schedule_heartbeat(&self.inner, peer_id).await;
    }

    /// Snapshot a peer's remote manifest entry (used by tests and the
    /// bridge's push paths).
    pub async fn remote_hash(&self, peer_id: &str, key: &str) -> Option<String> {
        self.inner
            .peers
            .lock()
            .await
            .get(peer_id)
            .and_then(|p| p.remote_state.get(key).cloned())
    }

    /// Snapshot a peer's local manifest keys.
    pub async fn local_keys(&self, peer_id: &str) -> Vec<String> {
        self.inner
            .peers
            .lock()
            .await
            .get(peer_id)
            .map(|p| p.local_state.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl EngineInner {
    fn events(&self) -> Option<Arc<dyn PeerEvents>> {
        self.events.read().unwrap().clone()
    }

    fn session_for(&self, conn_key: &str) -> Option<Session> {
        self.connections
            .read()
            .unwrap()
            .get(conn_key)
            .map(|e| e.session.clone())
    }

    fn local_address(&self) -> Option<String> {
        self.local_address.read().unwrap().clone()
    }

    fn send_beacons(&self) {
        // Beacons are deferred until the reply address is known.
        let Some(address) = self.local_address() else {
            return;
        };
        let Some(session) = self.session_for(NET) else {
            return;
        };
        let beacon = encode(&Message::Heartbeat(Heartbeat {
            site: self.config.id.clone(),
            sclass: self.config.class.as_str().to_string(),
            address,
            hashset: None,
        }));
        for target in self.extra_targets.read().unwrap().iter() {
            if let Err(e) = session.send_message(target, beacon.clone(), Value::Null) {
                debug!(target = %target, "beacon send failed: {e}");
            }
        }
    }

    async fn handle_delivery(this: &Arc<Self>, conn_key: &str, delivery: Delivery) {
        let message = match decode(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(conn = conn_key, "undecodable sync message: {e}");
                return;
            }
        };
        match message {
            Message::Heartbeat(hb) => {
                this.seen_heartbeat.store(true, Ordering::SeqCst);
                let class = match PeerClass::parse(&hb.sclass) {
                    Ok(class) => class,
                    Err(_) => {
                        warn!(sclass = %hb.sclass, "heartbeat with unknown class dropped");
                        return;
                    }
                };
                let site = hb.site.clone();
                let address = hb.address.clone();
                Self::enqueue(this, &site, class, &address, conn_key, Work::Heartbeat(hb))
                    .await;
            }
            Message::GetState(get) => {
                let site = get.site.clone();
                // GETs ride the same per-peer FIFO so a peer's messages are
                // processed strictly in order.
                let mut peers = this.peers.lock().await;
                if peers.contains_key(&site) {
                    if let Some(peer) = peers.get_mut(&site) {
                        peer.queue
                            .push_back(Work::Get(get, delivery, conn_key.to_string()));
                    }
                    Self::kick(this, &site, peers).await;
                } else {
                    drop(peers);
                    // Serve GETs from peers we have not heartbeated with.
                    this.process_get(&site, get, delivery, conn_key).await;
                }
            }
            Message::AssertClaim(_) => {
                warn!("claim assertion on a sync address dropped");
            }
        }
    }

    async fn enqueue(
        this: &Arc<Self>,
        peer_id: &str,
        class: PeerClass,
        address: &str,
        conn_key: &str,
        work: Work,
    ) {
        let mut peers = this.peers.lock().await;
        {
            let peer = peers.entry(peer_id.to_string()).or_insert_with(|| PeerState {
                class,
                address: address.to_string(),
                conn_key: conn_key.to_string(),
                known: false,
                local_state: HashMap::new(),
                remote_state: HashMap::new(),
                queue: VecDeque::new(),
                processing: false,
                heartbeat_task: None,
            });
            peer.address = address.to_string();
            peer.conn_key = conn_key.to_string();
            peer.queue.push_back(work);
        }
        Self::kick(this, peer_id, peers).await;
    }

    /// Start a drain task for the peer unless one is already running. Takes
    /// the peers guard to make the processing-flag check atomic with the
    /// enqueue.
    async fn kick(
        this: &Arc<Self>,
        peer_id: &str,
        mut peers: tokio::sync::MutexGuard<'_, HashMap<String, PeerState>>,
    ) {
        let Some(peer) = peers.get_mut(peer_id) else {
            return;
        };
        if peer.processing {
            return;
        }
        peer.processing = true;
        drop(peers);

        let engine = Arc::clone(this);
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            Self::drain(&engine, &peer_id).await;
        });
    }

    async fn drain(this: &Arc<Self>, peer_id: &str) {
        loop {
            let work = {
                let mut peers = this.peers.lock().await;
                let Some(peer) = peers.get_mut(peer_id) else {
                    return;
                };
                match peer.queue.pop_front() {
                    Some(work) => work,
                    None => {
                        peer.processing = false;
                        return;
                    }
                }
            };
            match work {
                Work::Heartbeat(hb) => Self::process_heartbeat(this, peer_id, hb).await,
                Work::Get(get, delivery, conn_key) => {
                    this.process_get(peer_id, get, delivery, &conn_key).await
                }
            }
        }
    }

    async fn process_heartbeat(this: &Arc<Self>, peer_id: &str, hb: Heartbeat) {
        let Some(events) = this.events() else {
            warn!("heartbeat before events were installed");
            return;
        };

        let known = {
            let peers = this.peers.lock().await;
            peers.get(peer_id).map(|p| p.known).unwrap_or(false)
        };

        if !known {
            let class = {
                let peers = this.peers.lock().await;
                match peers.get(peer_id) {
                    Some(p) => p.class,
                    None => return,
                }
            };
            match events.on_new_peer(peer_id, class).await {
                Ok((local_state, remote_state)) => {
                    {
                        let mut peers = this.peers.lock().await;
                        if let Some(peer) = peers.get_mut(peer_id) {
                            peer.local_state = local_state;
                            peer.remote_state = remote_state;
                            peer.known = true;
                        }
                    }
                    info!(peer = peer_id, "new peer tracked");
                    // Answer immediately with our manifest.
                    this.send_heartbeat(peer_id).await;
                    Self::schedule_heartbeat(this, peer_id).await;
                }
                Err(e) => {
                    warn!(peer = peer_id, "on_new_peer failed: {e}");
                }
            }
            return;
        }

        events.on_ping(peer_id).await;

        let Some(hashset) = hb.hashset else {
            return; // beacon only
        };

        let (pulls, deletions, address, conn_key) = {
            let peers = this.peers.lock().await;
            let Some(peer) = peers.get(peer_id) else {
                return;
            };
            let mut pulls: Vec<String> = Vec::new();
            for (key, hash) in &hashset {
                if peer.remote_state.get(key) != Some(hash) {
                    pulls.push(key.clone());
                }
            }
            let mut deletions: Vec<String> = peer
                .remote_state
                .keys()
                .filter(|key| !hashset.contains_key(*key))
                .cloned()
                .collect();
            deletions.sort();
            (pulls, deletions, peer.address.clone(), peer.conn_key.clone())
        };

        for key in deletions {
            events.on_state_change(peer_id, &key, None, None).await;
            let mut peers = this.peers.lock().await;
            if let Some(peer) = peers.get_mut(peer_id) {
                peer.remote_state.remove(&key);
            }
        }

        if pulls.is_empty() {
            return;
        }
        let Some(session) = this.session_for(&conn_key) else {
            warn!(peer = peer_id, conn = %conn_key, "no session for pulls");
            return;
        };
        for key in pulls {
            match this.pull(&session, &address, &key).await {
                Ok((hash, data)) => {
                    events
                        .on_state_change(peer_id, &key, Some(&hash), Some(data))
                        .await;
                    let mut peers = this.peers.lock().await;
                    if let Some(peer) = peers.get_mut(peer_id) {
                        peer.remote_state.insert(key, hash);
                    }
                }
                Err(e) => {
                    // Retried on the next heartbeat where the hash still
                    // disagrees; never poisons the peer.
                    warn!(peer = peer_id, key = %key, "pull failed: {e}");
                }
            }
        }
    }

    async fn pull(
        &self,
        session: &Session,
        address: &str,
        key: &str,
    ) -> SyncResult<(String, Value)> {
        let body = encode(&Message::GetState(GetState {
            site: self.config.id.clone(),
            statekey: key.to_string(),
        }));
        let (_, reply) = session
            .request(address, body, Value::Null, DEFAULT_REQUEST_TIMEOUT)
            .await?;
        let reply: GetStateReply = serde_json::from_value(reply)
            .map_err(|e| SyncError::Events(format!("bad GET reply: {e}")))?;
        let (_, hash, data) = reply.into_success()?;
        Ok((hash, data))
    }

    async fn process_get(
        &self,
        peer_id: &str,
        get: GetState,
        delivery: Delivery,
        conn_key: &str,
    ) {
        let Some(events) = self.events() else {
            return;
        };
        let reply = match events.on_state_request(peer_id, &get.statekey).await {
            Ok((hash, data)) => GetStateReply::ok(&get.statekey, &hash, data),
            Err(e) => {
                debug!(peer = peer_id, key = %get.statekey, "state request failed: {e}");
                GetStateReply::error(404, format!("unknown state key {}", get.statekey))
            }
        };
        let Some(session) = self.session_for(conn_key) else {
            return;
        };
        let body = match serde_json::to_value(&reply) {
            Ok(body) => body,
            Err(_) => return,
        };
        if let Err(e) = session.respond(&delivery, body, Value::Null) {
            debug!(peer = peer_id, "GET reply send failed: {e}");
        }
    }

    /// Send one heartbeat carrying the peer's local manifest. Send failures
    /// are dropped; the next heartbeat is the retry.
    async fn send_heartbeat(&self, peer_id: &str) {
        let Some(address) = self.local_address() else {
            return;
        };
        let (peer_address, conn_key, hashset) = {
            let peers = self.peers.lock().await;
            let Some(peer) = peers.get(peer_id) else {
                return;
            };
            let hashset: BTreeMap<String, String> = peer
                .local_state
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            (peer.address.clone(), peer.conn_key.clone(), hashset)
        };
        let Some(session) = self.session_for(&conn_key) else {
            return;
        };
        let body = encode(&Message::Heartbeat(Heartbeat {
            site: self.config.id.clone(),
            sclass: self.config.class.as_str().to_string(),
            address,
            hashset: Some(hashset),
        }));
        if let Err(e) = session.send_message(&peer_address, body, Value::Null) {
            debug!(peer = peer_id, "heartbeat send failed: {e}");
        }
    }

    /// Jittered delay to the next heartbeat: `uniform(0, window) + period`.
    fn heartbeat_delay(&self) -> Duration {
        let window = self.config.heartbeat_window.as_secs_f64();
        let jitter = rand::thread_rng().gen_range(0.0..window.max(f64::EPSILON));
        self.config.heartbeat_period + Duration::from_secs_f64(jitter)
    }

    /// (Re)start the peer's heartbeat timer, replacing any pending one.
    async fn schedule_heartbeat(this: &Arc<Self>, peer_id: &str) {
        let engine = Arc::clone(this);
        let id = peer_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(engine.heartbeat_delay()).await;
                engine.send_heartbeat(&id).await;
            }
        });

        let mut peers = this.peers.lock().await;
        if let Some(peer) = peers.get_mut(peer_id) {
            if let Some(old) = peer.heartbeat_task.replace(task) {
                old.abort();
            }
        } else {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use vanfab_protocol::MGMT_CONTROLLER_ADDRESS;

    /// Records event-handler calls and serves canned state.
    struct Recorder {
        initial_remote: HashMap<String, String>,
        changes: StdMutex<Vec<(String, Option<String>)>>,
        pings: StdMutex<u32>,
    }

    impl Recorder {
        fn new(initial_remote: HashMap<String, String>) -> Arc<Self> {
            Arc::new(Self {
                initial_remote,
                changes: StdMutex::new(Vec::new()),
                pings: StdMutex::new(0),
            })
        }
    }

    #[async_trait]
    impl PeerEvents for Recorder {
        async fn on_new_peer(
            &self,
            _peer_id: &str,
            _class: PeerClass,
        ) -> SyncResult<(HashMap<String, String>, HashMap<String, String>)> {
            let mut local = HashMap::new();
            local.insert("tls-site-1".to_string(), "LH".to_string());
            Ok((local, self.initial_remote.clone()))
        }

        async fn on_ping(&self, _peer_id: &str) {
            *self.pings.lock().unwrap() += 1;
        }

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
            Ok(("LH".to_string(), serde_json::json!({"key": key})))
        }
    }

    fn heartbeat(site: &str, address: &str, hashset: Option<Vec<(&str, &str)>>) -> Value {
        encode(&Message::Heartbeat(Heartbeat {
            site: site.into(),
            sclass: "backbone".into(),
            address: address.into(),
            hashset: hashset.map(|pairs| {
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            }),
        }))
    }

    fn engine_with(events: Arc<dyn PeerEvents>) -> (StateSync, Session) {
        let mut config = SyncConfig::new(PeerClass::Management, "controller");
        config.receive_address = Some(MGMT_CONTROLLER_ADDRESS.to_string());
        let engine = StateSync::new(config);
        engine.set_events(events);

        let (controller_side, peer_side) = Session::pair();
        engine.add_connection(Some(uuid::Uuid::new_v4()), &controller_side);
        (engine, peer_side)
    }

    #[tokio::test]
    async fn first_heartbeat_tracks_peer_and_answers_with_manifest() {
        let recorder = Recorder::new(HashMap::new());
        let (engine, peer) = engine_with(recorder.clone());
        let (_, mut peer_rx) = peer.open_receiver(Some("router/s1"));

        peer.send_message(
            MGMT_CONTROLLER_ADDRESS,
            heartbeat("s1", "router/s1", None),
            Value::Null,
        )
        .unwrap();

        // The engine answers a new peer immediately with its local manifest.
        let delivery = peer_rx.recv().await.unwrap();
        let Message::Heartbeat(hb) = decode(&delivery.body).unwrap() else {
            panic!("expected heartbeat");
        };
        assert_eq!(hb.site, "controller");
        let hashset = hb.hashset.expect("manifest expected");
        assert_eq!(hashset.get("tls-site-1").map(String::as_str), Some("LH"));
        assert_eq!(engine.local_keys("s1").await, vec!["tls-site-1".to_string()]);
    }

    #[tokio::test]
    async fn changed_hash_triggers_pull_and_updates_remote_state() {
        let mut remote = HashMap::new();
        remote.insert("link-L1".to_string(), "H0".to_string());
        let recorder = Recorder::new(remote);
        let (engine, peer) = engine_with(recorder.clone());
        let (_, mut peer_rx) = peer.open_receiver(Some("router/s1"));

        // First heartbeat: become known (consume the answering heartbeat).
        peer.send_message(
            MGMT_CONTROLLER_ADDRESS,
            heartbeat("s1", "router/s1", None),
            Value::Null,
        )
        .unwrap();
        let _ = peer_rx.recv().await.unwrap();

        // Second heartbeat advertises a new hash for link-L1.
        peer.send_message(
            MGMT_CONTROLLER_ADDRESS,
            heartbeat("s1", "router/s1", Some(vec![("link-L1", "H1")])),
            Value::Null,
        )
        .unwrap();

        // The engine pulls; serve the GET.
        let get = peer_rx.recv().await.unwrap();
        let Message::GetState(body) = decode(&get.body).unwrap() else {
            panic!("expected GET");
        };
        assert_eq!(body.statekey, "link-L1");
        let reply = GetStateReply::ok("link-L1", "H1", serde_json::json!({"host": "h1"}));
        peer.respond(&get, serde_json::to_value(&reply).unwrap(), Value::Null)
            .unwrap();

        // on_state_change fires with the new hash and remote state updates.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if engine.remote_hash("s1", "link-L1").await.as_deref() == Some("H1") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("remote state should converge");
        let changes = recorder.changes.lock().unwrap().clone();
        assert_eq!(
            changes,
            vec![("link-L1".to_string(), Some("H1".to_string()))]
        );
    }

    #[tokio::test]
    async fn missing_key_is_reported_as_deletion() {
        let mut remote = HashMap::new();
        remote.insert("link-L1".to_string(), "H0".to_string());
        let recorder = Recorder::new(remote);
        let (engine, peer) = engine_with(recorder.clone());
        let (_, mut peer_rx) = peer.open_receiver(Some("router/s1"));

        peer.send_message(
            MGMT_CONTROLLER_ADDRESS,
            heartbeat("s1", "router/s1", None),
            Value::Null,
        )
        .unwrap();
        let _ = peer_rx.recv().await.unwrap();

        // Empty hashset: link-L1 disappeared.
        peer.send_message(
            MGMT_CONTROLLER_ADDRESS,
            heartbeat("s1", "router/s1", Some(vec![])),
            Value::Null,
        )
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if engine.remote_hash("s1", "link-L1").await.is_none()
                    && !recorder.changes.lock().unwrap().is_empty()
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("deletion should be observed");
        let changes = recorder.changes.lock().unwrap().clone();
        assert_eq!(changes, vec![("link-L1".to_string(), None)]);
    }

    #[tokio::test]
    async fn engine_serves_get_requests() {
        let recorder = Recorder::new(HashMap::new());
        let (_engine, peer) = engine_with(recorder);

        let body = encode(&Message::GetState(GetState {
            site: "s1".into(),
            statekey: "tls-site-1".into(),
        }));
        let (_, reply) = peer
            .request(MGMT_CONTROLLER_ADDRESS, body, Value::Null, Duration::from_secs(2))
            .await
            .unwrap();
        let reply: GetStateReply = serde_json::from_value(reply).unwrap();
        let (key, hash, data) = reply.into_success().unwrap();
        assert_eq!(key, "tls-site-1");
        assert_eq!(hash, "LH");
        assert_eq!(data["key"], "tls-site-1");
    }

    #[tokio::test]
    async fn update_local_state_fires_immediate_heartbeat() {
        let recorder = Recorder::new(HashMap::new());
        let (engine, peer) = engine_with(recorder);
        let (_, mut peer_rx) = peer.open_receiver(Some("router/s1"));

        peer.send_message(
            MGMT_CONTROLLER_ADDRESS,
            heartbeat("s1", "router/s1", None),
            Value::Null,
        )
        .unwrap();
        let _ = peer_rx.recv().await.unwrap();

        engine
            .update_local_state("s1", "access-ap1", Some("AH"))
            .await;

        let delivery = tokio::time::timeout(Duration::from_secs(2), peer_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Message::Heartbeat(hb) = decode(&delivery.body).unwrap() else {
            panic!("expected heartbeat");
        };
        let hashset = hb.hashset.unwrap();
        assert_eq!(hashset.get("access-ap1").map(String::as_str), Some("AH"));
    }
}
