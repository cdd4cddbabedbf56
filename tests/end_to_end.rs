use async_trait::async_trait;
use bytes::Bytes;
use netstate::config::ConnectionConfig;
use netstate::connection::Connection;
use netstate::connection_listener::ConnectionListener;
use netstate::server::{Server, ServerListener};
use netstate::state::State;
use netstate::state_link::LinkState;
use netstate::test_util::{RecordedEvent, RecordingConnectionListener, SimulatedNetwork};
use netstate::math::{Quaternion, Vector3};
use netstate::value::{FloatFormat, IntegerFormat, ValueData};
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// polls `condition` for up to ten seconds
async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..1000 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn time_state(time: &str, bar: i64) -> Arc<State> {
    let state = State::new(true);
    state.add_value(ValueData::String(time.to_string())).unwrap();
    state.add_value(ValueData::Integer(IntegerFormat::S16, bar)).unwrap();
    Arc::new(state)
}

struct TimeServer {
    state: Arc<State>,
}

#[async_trait]
impl ServerListener for TimeServer {
    fn create_connection_listener(&self) -> Arc<dyn ConnectionListener> {
        Arc::new(RecordingConnectionListener::new())
    }

    async fn client_connected(&self, _server: &Server, connection: &Arc<Connection>) {
        connection.link_state(b"time", &self.state, true).await.unwrap();
    }
}

#[tokio::test]
async fn test_read_only_state_is_replicated() {
    let server_state = time_state("time", 30);
    let server = Server::new(Arc::new(TimeServer { state: server_state.clone() }));
    server.listen_on("127.0.0.1:3413").await.unwrap();

    let replica = time_state("", 0);
    let replica_clone = replica.clone();
    let client_listener = Arc::new(RecordingConnectionListener::with_state_factory(move |message, read_only| {
        (message.as_ref() == b"time" && read_only).then(|| replica_clone.clone())
    }));
    let client = Connection::new(client_listener.clone());
    client.connect("127.0.0.1").await.unwrap();
    assert!(client_listener.wait_for(|e| e.contains(&RecordedEvent::Established)).await);

    assert!(eventually(|| replica.value(1) == Some(ValueData::Integer(IntegerFormat::S16, 30))).await);
    assert_eq!(replica.value(0), Some(ValueData::String("time".to_string())));

    let accepted = server.connections().await.remove(0);
    for _ in 0..100 {
        if accepted.link_state_of(&server_state).await == LinkState::Up {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(accepted.link_state_of(&server_state).await, LinkState::Up);
    assert_eq!(accepted.link_read_only(&server_state).await, Some(true));

    server_state.set_value(1, ValueData::Integer(IntegerFormat::S16, 45)).unwrap();
    assert!(eventually(|| replica.value(1) == Some(ValueData::Integer(IntegerFormat::S16, 45))).await);

    client.disconnect().await;
    assert_eq!(replica.link_count(), 0);
    for _ in 0..100 {
        if server.connections().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(server.connections().await.is_empty());
    assert_eq!(server_state.link_count(), 0);

    server.dispose().await;
}

const OWN_STATE: &[u8] = b"own";
const OTHER_STATE_PREFIX: &str = "other:";
const DROP_CLIENT_PREFIX: &str = "drop:";

fn counter_state(read_only: bool) -> Arc<State> {
    let state = State::new(read_only);
    state.add_value(ValueData::Integer(IntegerFormat::S32, 0)).unwrap();
    Arc::new(state)
}

struct ClientEntry {
    id: u32,
    connection: Arc<Connection>,
    state: Arc<State>,
}

/// Links each client's own state to it read-write, and read-only to all other clients. When a
///  client leaves, the others are told to drop their view of it.
struct LobbyServer {
    next_id: Mutex<u32>,
    clients: Mutex<Vec<ClientEntry>>,
    myself: Weak<LobbyServer>,
}

impl LobbyServer {
    fn new() -> Arc<LobbyServer> {
        Arc::new_cyclic(|myself| LobbyServer {
            next_id: Default::default(),
            clients: Default::default(),
            myself: myself.clone(),
        })
    }

    async fn client_left(&self, connection: &Arc<Connection>) {
        let (left, remaining) = {
            let mut clients = self.clients.lock().unwrap();
            let Some(index) = clients.iter().position(|c| Arc::ptr_eq(&c.connection, connection)) else {
                return;
            };
            let left = clients.remove(index);
            let remaining = clients.iter().map(|c| c.connection.clone()).collect::<Vec<_>>();
            (left, remaining)
        };

        let message = format!("{}{}", DROP_CLIENT_PREFIX, left.id);
        for connection in remaining {
            connection.send_reliable_message(message.as_bytes()).await.unwrap();
        }
    }
}

struct LobbyConnectionListener {
    lobby: Weak<LobbyServer>,
}

#[async_trait]
impl ConnectionListener for LobbyConnectionListener {
    async fn connection_closed(&self, connection: &Arc<Connection>) {
        if let Some(lobby) = self.lobby.upgrade() {
            lobby.client_left(connection).await;
        }
    }
}

#[async_trait]
impl ServerListener for LobbyServer {
    fn create_connection_listener(&self) -> Arc<dyn ConnectionListener> {
        Arc::new(LobbyConnectionListener { lobby: self.myself.clone() })
    }

    async fn client_connected(&self, _server: &Server, connection: &Arc<Connection>) {
        let id = {
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            *next_id
        };
        let state = counter_state(false);

        let others = {
            let mut clients = self.clients.lock().unwrap();
            let others = clients.iter()
                .map(|c| (c.id, c.connection.clone(), c.state.clone()))
                .collect::<Vec<_>>();
            clients.push(ClientEntry { id, connection: connection.clone(), state: state.clone() });
            others
        };

        connection.link_state(OWN_STATE, &state, false).await.unwrap();
        for (other_id, other_connection, other_state) in others {
            connection.link_state(format!("{}{}", OTHER_STATE_PREFIX, other_id).as_bytes(), &other_state, true).await.unwrap();
            other_connection.link_state(format!("{}{}", OTHER_STATE_PREFIX, id).as_bytes(), &state, true).await.unwrap();
        }
    }
}

/// A client's view of the lobby: its own state, and read-only replicas of the other clients'
struct LobbyClient {
    own: Arc<State>,
    others: Mutex<FxHashMap<u32, Arc<State>>>,
}

impl LobbyClient {
    fn new() -> Arc<LobbyClient> {
        Arc::new(LobbyClient {
            own: counter_state(false),
            others: Default::default(),
        })
    }

    fn other(&self, id: u32) -> Option<Arc<State>> {
        self.others.lock().unwrap().get(&id).cloned()
    }
}

#[async_trait]
impl ConnectionListener for LobbyClient {
    async fn message_received(&self, _connection: &Arc<Connection>, message: Bytes) {
        let message = String::from_utf8_lossy(&message);
        if let Some(id) = message.strip_prefix(DROP_CLIENT_PREFIX).and_then(|id| id.parse::<u32>().ok()) {
            self.others.lock().unwrap().remove(&id);
        }
    }

    fn create_state(&self, message: &Bytes, read_only: bool) -> Option<Arc<State>> {
        if message.as_ref() == OWN_STATE && !read_only {
            return Some(self.own.clone());
        }

        let id: u32 = std::str::from_utf8(message).ok()?
            .strip_prefix(OTHER_STATE_PREFIX)?
            .parse().ok()?;
        let state = counter_state(true);
        self.others.lock().unwrap().insert(id, state.clone());
        Some(state)
    }
}

#[tokio::test]
async fn test_client_changes_are_fanned_out_and_dropped() {
    let lobby = LobbyServer::new();
    let server = Server::new(lobby.clone());
    server.listen_on("127.0.0.1:0").await.unwrap();
    let address = server.address().await.unwrap().to_string();

    let client_a = LobbyClient::new();
    let connection_a = Connection::new(client_a.clone());
    connection_a.connect(&address).await.unwrap();
    assert!(eventually(|| client_a.own.link_count() == 1).await);

    let client_b = LobbyClient::new();
    let connection_b = Connection::new(client_b.clone());
    connection_b.connect(&address).await.unwrap();
    assert!(eventually(|| client_b.own.link_count() == 1).await);
    assert!(eventually(|| client_a.other(2).is_some() && client_b.other(1).is_some()).await);

    client_a.own.set_value(0, ValueData::Integer(IntegerFormat::S32, 7)).unwrap();
    assert!(eventually(|| client_b.other(1).and_then(|s| s.value(0)) == Some(ValueData::Integer(IntegerFormat::S32, 7))).await);

    client_b.own.set_value(0, ValueData::Integer(IntegerFormat::S32, -3)).unwrap();
    assert!(eventually(|| client_a.other(2).and_then(|s| s.value(0)) == Some(ValueData::Integer(IntegerFormat::S32, -3))).await);

    connection_a.disconnect().await;
    assert!(eventually(|| client_b.other(1).is_none()).await);
    assert!(connection_b.is_connected().await);

    connection_b.disconnect().await;
    server.dispose().await;
}

/// Records the callbacks of all accepted connections, and links a state to each client
struct RecordingServer {
    state: Arc<State>,
    connection_listeners: Mutex<Vec<Arc<RecordingConnectionListener>>>,
}

#[async_trait]
impl ServerListener for RecordingServer {
    fn create_connection_listener(&self) -> Arc<dyn ConnectionListener> {
        let listener = Arc::new(RecordingConnectionListener::new());
        self.connection_listeners.lock().unwrap().push(listener.clone());
        listener
    }

    async fn client_connected(&self, _server: &Server, connection: &Arc<Connection>) {
        connection.link_state(b"counter", &self.state, true).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_lossy_network() {
    let network = SimulatedNetwork::lossy(0.2, 0.1, Duration::from_millis(30), 17);
    let config = ConnectionConfig {
        connect_timeout: Duration::from_secs(60),
        reliable_resend_interval: Duration::from_millis(100),
        reliable_timeout: Duration::from_secs(60),
        ..Default::default()
    };

    let server_state = counter_state(true);
    server_state.set_value(0, ValueData::Integer(IntegerFormat::S32, 12345)).unwrap();
    let recording_server = Arc::new(RecordingServer {
        state: server_state.clone(),
        connection_listeners: Default::default(),
    });
    let server = Server::with_transport(config.clone(), Arc::new(network.clone()), recording_server.clone()).unwrap();
    server.listen_on("127.0.0.1:3413").await.unwrap();

    let replica = counter_state(true);
    let replica_clone = replica.clone();
    let client_listener = Arc::new(RecordingConnectionListener::with_state_factory(move |_, _| Some(replica_clone.clone())));
    let client = Connection::with_transport(config, Arc::new(network.clone()), client_listener.clone()).unwrap();
    client.connect("127.0.0.1:3413").await.unwrap();
    assert!(client_listener.wait_for(|e| e.contains(&RecordedEvent::Established)).await);

    let long_message = (0..10_000).map(|i| (i % 251) as u8).collect::<Vec<_>>();
    let mut expected = Vec::new();
    for i in 0..40u8 {
        if i == 20 {
            client.send_reliable_message(&long_message).await.unwrap();
            expected.push(Bytes::from(long_message.clone()));
        }
        client.send_reliable_message(&[i]).await.unwrap();
        expected.push(Bytes::from(vec![i]));
    }

    assert!(eventually(|| recording_server.connection_listeners.lock().unwrap().len() == 1).await);
    let server_side_listener = recording_server.connection_listeners.lock().unwrap()[0].clone();
    assert!(server_side_listener.wait_for(|e| e.iter().filter(|e| matches!(e, RecordedEvent::Message(_))).count() == expected.len()).await);
    assert_eq!(server_side_listener.messages().await, expected);

    // the snapshot travels reliably, so it arrives in spite of the losses
    assert!(eventually(|| replica.value(0) == Some(ValueData::Integer(IntegerFormat::S32, 12345))).await);

    assert!(client.is_connected().await);
    client.dispose().await;
    server.dispose().await;
}

/// Connects a client to a server that links `server_state` read-only to it, over a perfect
///  simulated network. The client replicates into `replica`.
async fn linked_over_simulated_network(server_state: &Arc<State>, replica: &Arc<State>) -> (Arc<Server>, Arc<Connection>) {
    let network = SimulatedNetwork::new();
    let recording_server = Arc::new(RecordingServer {
        state: server_state.clone(),
        connection_listeners: Default::default(),
    });
    let server = Server::with_transport(ConnectionConfig::default(), Arc::new(network.clone()), recording_server).unwrap();
    server.listen_on("127.0.0.1:3413").await.unwrap();

    let replica_clone = replica.clone();
    let client_listener = Arc::new(RecordingConnectionListener::with_state_factory(move |_, _| Some(replica_clone.clone())));
    let client = Connection::with_transport(ConnectionConfig::default(), Arc::new(network), client_listener.clone()).unwrap();
    client.connect("127.0.0.1:3413").await.unwrap();
    assert!(client_listener.wait_for(|e| e.contains(&RecordedEvent::Established)).await);
    assert!(eventually(|| replica.link_count() == 1).await);

    let accepted = server.connections().await.remove(0);
    for _ in 0..100 {
        if accepted.link_state_of(server_state).await == LinkState::Up {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(accepted.link_state_of(server_state).await, LinkState::Up);

    (server, client)
}

#[tokio::test(start_paused = true)]
async fn test_large_values_are_replicated() {
    let strings = || {
        let state = State::new(true);
        state.add_value(ValueData::String(String::new())).unwrap();
        state.add_value(ValueData::String(String::new())).unwrap();
        Arc::new(state)
    };
    let server_state = strings();
    let replica = strings();
    let (server, client) = linked_over_simulated_network(&server_state, &replica).await;

    let first = "a".repeat(40_000);
    let second = "b".repeat(40_000);
    server_state.set_value(0, ValueData::String(first.clone())).unwrap();
    server_state.set_value(1, ValueData::String(second.clone())).unwrap();

    assert!(eventually(|| replica.value(0) == Some(ValueData::String(first.clone()))).await);
    assert!(eventually(|| replica.value(1) == Some(ValueData::String(second.clone()))).await);
    assert!(client.is_connected().await);

    client.dispose().await;
    server.dispose().await;
}

fn components(data: &ValueData) -> Vec<f64> {
    match data {
        ValueData::Float(_, v) => vec![*v],
        ValueData::Vector3(_, v) => vec![v.x, v.y, v.z],
        ValueData::Quaternion(_, q) => vec![q.x, q.y, q.z, q.w],
        other => panic!("not a float value: {:?}", other),
    }
}

fn within(a: &State, b: &State, index: usize, precision: f64) -> bool {
    let (Some(a), Some(b)) = (a.value(index), b.value(index)) else {
        return false;
    };
    components(&a).iter()
        .zip(components(&b))
        .all(|(x, y)| (x - y).abs() <= precision)
}

#[tokio::test(start_paused = true)]
async fn test_float_values_converge_within_precision() {
    const PRECISIONS: [f64; 3] = [0.01, 0.1, 0.01];

    let float_state = || {
        let state = State::new(true);
        state.add_value(ValueData::Float(FloatFormat::F32, 0.0)).unwrap();
        state.add_value(ValueData::Vector3(FloatFormat::F64, Vector3::default())).unwrap();
        state.add_value(ValueData::Quaternion(FloatFormat::F16, Quaternion::IDENTITY)).unwrap();
        for (index, precision) in PRECISIONS.iter().enumerate() {
            state.set_precision(index, *precision).unwrap();
        }
        Arc::new(state)
    };
    let master = float_state();
    let replica = float_state();
    let (server, client) = linked_over_simulated_network(&master, &replica).await;

    let writes = [
        (1.0, Vector3::new(1.0, -2.0, 3.0), Quaternion::new(0.0, 0.0, 0.0, 1.0)),
        // below the precision: the replica may lag behind
        (1.004, Vector3::new(1.05, -2.05, 3.05), Quaternion::new(0.004, 0.0, 0.0, 0.999)),
        (1.008, Vector3::new(1.09, -2.09, 3.09), Quaternion::new(0.008, 0.0, 0.0, 0.998)),
        (1.5, Vector3::new(10.0, 0.25, -7.5), Quaternion::new(0.5, 0.5, 0.5, 0.5)),
        (1.503, Vector3::new(10.03, 0.27, -7.48), Quaternion::new(0.505, 0.5, 0.495, 0.5)),
        (-3.25, Vector3::new(0.0, 0.0, 0.0), Quaternion::new(0.0, 0.7071, 0.0, 0.7071)),
    ];

    for (float, vector, quaternion) in writes {
        master.set_value(0, ValueData::Float(FloatFormat::F32, float)).unwrap();
        master.set_value(1, ValueData::Vector3(FloatFormat::F64, vector)).unwrap();
        master.set_value(2, ValueData::Quaternion(FloatFormat::F16, quaternion)).unwrap();

        assert!(eventually(|| (0..3).all(|i| within(&master, &replica, i, PRECISIONS[i]))).await);
    }

    // the last write moved every value by more than its precision, so it arrives as is
    for index in 0..3 {
        assert!(eventually(|| replica.value(index) == master.value(index)).await);
    }

    client.dispose().await;
    server.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_changes_below_precision_are_not_sent() {
    let float_state = || {
        let state = State::new(true);
        state.add_value(ValueData::Float(FloatFormat::F64, 0.0)).unwrap();
        state.set_precision(0, 0.5).unwrap();
        Arc::new(state)
    };
    let master = float_state();
    let replica = float_state();
    let (server, client) = linked_over_simulated_network(&master, &replica).await;

    // small steps accumulate against the last value that was sent, not the previous write
    for step in 1..=4 {
        master.set_value(0, ValueData::Float(FloatFormat::F64, step as f64 * 0.1)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(replica.value(0), Some(ValueData::Float(FloatFormat::F64, 0.0)));
    }

    master.set_value(0, ValueData::Float(FloatFormat::F64, 0.6)).unwrap();
    assert!(eventually(|| replica.value(0) == Some(ValueData::Float(FloatFormat::F64, 0.6))).await);

    client.dispose().await;
    server.dispose().await;
}
