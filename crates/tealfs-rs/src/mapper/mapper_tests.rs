use super::*;

fn node(id: &str) -> NodeId {
    NodeId::from(id)
}

#[test]
fn dialed_address_is_a_candidate_until_bound() {
    let mut m = NodeConnectionMapper::new();
    assert!(m.add_address("10.0.0.2:9000"));
    assert!(!m.add_address("10.0.0.2:9000"));
    assert_eq!(m.reconnect_candidates(), vec!["10.0.0.2:9000".to_string()]);

    m.register_conn(ConnId(1), Some("10.0.0.2:9000".to_string()));
    assert!(!m.is_handshaken(ConnId(1)));
    assert_eq!(m.bind(ConnId(1), &node("b"), "10.0.0.2:9000"), None);

    assert!(m.reconnect_candidates().is_empty());
    assert_eq!(m.conn_for_node(&node("b")), Some(ConnId(1)));
    assert_eq!(m.node_for_conn(ConnId(1)), Some(&node("b")));
    assert!(m.is_handshaken(ConnId(1)));
}

#[test]
fn dialed_alias_is_dropped_in_favour_of_advertised_address() {
    let mut m = NodeConnectionMapper::new();
    m.add_address("localhost:9000");
    m.register_conn(ConnId(1), Some("localhost:9000".to_string()));
    m.bind(ConnId(1), &node("b"), "127.0.0.1:9000");

    assert_eq!(
        m.known_nodes(),
        vec![(node("b"), "127.0.0.1:9000".to_string())]
    );
    assert!(m.reconnect_candidates().is_empty());
}

#[test]
fn lost_connection_keeps_node_as_candidate() {
    let mut m = NodeConnectionMapper::new();
    m.register_conn(ConnId(7), None);
    m.bind(ConnId(7), &node("b"), "h:1");

    assert_eq!(m.remove_conn(ConnId(7)), Some(node("b")));
    assert_eq!(m.conn_for_node(&node("b")), None);
    assert!(m.is_known(&node("b")));
    assert_eq!(m.reconnect_candidates(), vec!["h:1".to_string()]);
    assert!(m.connected_peers().is_empty());
}

#[test]
fn unbound_connection_removal_returns_nothing() {
    let mut m = NodeConnectionMapper::new();
    m.register_conn(ConnId(1), None);
    assert_eq!(m.remove_conn(ConnId(1)), None);
    assert_eq!(m.remove_conn(ConnId(1)), None);
}

#[test]
fn second_connection_takes_over_node() {
    let mut m = NodeConnectionMapper::new();
    m.register_conn(ConnId(1), Some("h:1".to_string()));
    m.register_conn(ConnId(2), None);
    m.bind(ConnId(1), &node("b"), "h:1");

    assert_eq!(m.bind(ConnId(2), &node("b"), "h:1"), Some(ConnId(1)));
    assert_eq!(m.conn_for_node(&node("b")), Some(ConnId(2)));

    // losing the superseded connection leaves the live one in place
    m.remove_conn(ConnId(1));
    assert_eq!(m.conn_for_node(&node("b")), Some(ConnId(2)));
}

#[test]
fn new_identity_at_same_address_replaces_old_node() {
    let mut m = NodeConnectionMapper::new();
    m.register_conn(ConnId(1), None);
    m.bind(ConnId(1), &node("old"), "h:1");
    m.remove_conn(ConnId(1));

    m.register_conn(ConnId(2), Some("h:1".to_string()));
    m.bind(ConnId(2), &node("new"), "h:1");

    assert!(!m.is_known(&node("old")));
    assert_eq!(m.known_nodes(), vec![(node("new"), "h:1".to_string())]);
}

#[test]
fn state_round_trips_without_connections() {
    let mut m = NodeConnectionMapper::new();
    m.add_address("pending:1");
    m.register_conn(ConnId(1), None);
    m.bind(ConnId(1), &node("b"), "h:2");

    let state = m.to_state();
    let json = serde_json::to_string(&state).unwrap();
    assert!(json.contains("\"nodeId\""));

    let restored = NodeConnectionMapper::from_state(&serde_json::from_str(&json).unwrap());
    assert_eq!(restored.to_state(), state);
    assert_eq!(restored.conn_for_node(&node("b")), None);
    assert_eq!(
        restored.reconnect_candidates(),
        vec!["h:2".to_string(), "pending:1".to_string()]
    );
}

#[tokio::test]
async fn saver_writes_latest_state() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("cluster.json");
    let (state_tx, state_rx) = watch::channel(ClusterState::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let saver = tokio::spawn(run_cluster_saver(path.clone(), state_rx, shutdown_rx));

    state_tx
        .send(ClusterState {
            nodes: vec![KnownNode {
                node_id: node("b"),
                address: "h:1".to_string(),
            }],
            addresses: Vec::new(),
        })
        .unwrap();
    shutdown_tx.send(true).unwrap();
    saver.await.unwrap();

    let saved: ClusterState = crate::config::read_json(&path).await.unwrap().unwrap();
    assert_eq!(saved.nodes.len(), 1);
    assert_eq!(saved.nodes[0].address, "h:1");
}
