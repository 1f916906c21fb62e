use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};

use mmrelay::config::{Config, RoomMapping};
use mmrelay::db::Db;
use mmrelay::matrix::{MatrixEventKind, MatrixIncoming, MatrixPort, MeshtasticFields};
use mmrelay::meshtastic::{MeshCommand, MeshtasticHandle, PortNum};
use mmrelay::plugins::{Plugin, PluginSet};
use mmrelay::queue::{LinkState, MessageQueue};
use mmrelay::relay::{MatrixToMesh, RoomMap};

#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Text { text: String, channel: u32, reply_id: Option<u32> },
    Data { payload: Vec<u8>, portnum: PortNum, channel: u32 },
}

struct NullMatrix;

#[async_trait]
impl MatrixPort for NullMatrix {
    async fn send_event(&self, _room_id: &str, _content: Value) -> Result<String> {
        unreachable!("matrix-to-mesh never emits Matrix events")
    }

    async fn display_name(&self, _room_id: &str, user_id: &str) -> String {
        if user_id == "@bob:x" {
            "Bob Quimby".to_string()
        } else {
            user_id.to_string()
        }
    }

    fn bot_user_id(&self) -> String {
        "@bot:x".to_string()
    }

    fn bot_display_name(&self) -> String {
        "Relay Bot".to_string()
    }
}

fn test_config(extra: &str) -> Config {
    serde_yaml::from_str(&format!(
        r#"
matrix:
  homeserver: https://example.org
matrix_rooms:
  - id: "!room:x"
    meshtastic_channel: 0
meshtastic:
  connection_type: tcp
  host: radio.local
  meshnet_name: M1
  message_interactions:
    reactions: true
    replies: true
{}
"#,
        extra
    ))
    .unwrap()
}

struct Harness {
    translator: MatrixToMesh,
    queue: MessageQueue,
    db: Db,
    sent: Arc<Mutex<Vec<Sent>>>,
    _link_tx: watch::Sender<LinkState>,
    _dir: tempfile::TempDir,
}

/// Build the translator with a live queue and a stub radio that answers
/// every send with sequential packet ids starting at 1000.
fn harness_with(config: Config, plugins: PluginSet) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path().join("relay.sqlite")).unwrap();

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<MeshCommand>(32);
    let sent: Arc<Mutex<Vec<Sent>>> = Arc::new(Mutex::new(Vec::new()));
    let sent_in_stub = sent.clone();
    tokio::spawn(async move {
        let mut next_id = 1000u32;
        while let Some(command) = cmd_rx.recv().await {
            match command {
                MeshCommand::SendText { text, channel, reply_id, resp } => {
                    sent_in_stub.lock().unwrap().push(Sent::Text { text, channel, reply_id });
                    let _ = resp.send(Ok(next_id));
                }
                MeshCommand::SendData { payload, portnum, channel, resp } => {
                    sent_in_stub.lock().unwrap().push(Sent::Data { payload, portnum, channel });
                    let _ = resp.send(Ok(next_id));
                }
            }
            next_id += 1;
        }
    });

    let (link_tx, link_rx) =
        watch::channel(LinkState { attached: true, reconnecting: false, connected: true });
    let mesh = MeshtasticHandle::new(
        cmd_tx,
        link_rx.clone(),
        Arc::new(RwLock::new(HashMap::new())),
        Arc::new(AtomicU32::new(0x99)),
    );
    let queue = MessageQueue::new(db.clone(), link_rx);
    queue.start(2.0);

    let translator = MatrixToMesh::new(
        Arc::new(config),
        db.clone(),
        Arc::new(NullMatrix),
        mesh,
        queue.clone(),
        Arc::new(plugins),
        RoomMap::new(vec![RoomMapping { id: "!room:x".into(), meshtastic_channel: 0 }]),
    );
    Harness { translator, queue, db, sent, _link_tx: link_tx, _dir: dir }
}

fn harness() -> Harness {
    harness_with(test_config(""), PluginSet::empty())
}

fn text_event(body: &str) -> MatrixIncoming {
    MatrixIncoming {
        room_id: "!room:x".into(),
        event_id: "$ev1".into(),
        sender: "@bob:x".into(),
        body: body.into(),
        formatted_body: None,
        kind: MatrixEventKind::Text,
        reply_to_event_id: None,
        reacts_to_event_id: None,
        meshtastic: MeshtasticFields::default(),
    }
}

async fn drain(h: &Harness) {
    // Virtual time; the paced queue drains instantly under the test clock.
    sleep(Duration::from_secs(30)).await;
}

#[tokio::test(start_paused = true)]
async fn relays_matrix_text_and_stores_map_after_send() {
    let h = harness();
    h.translator.handle_event(text_event("hello")).await;
    drain(&h).await;

    let sent = h.sent.lock().unwrap().clone();
    assert_eq!(
        sent,
        vec![Sent::Text { text: "Bob Q[M]: hello".into(), channel: 0, reply_id: None }]
    );

    let entry = h.db.get_message_map_by_mesh_id(1000).unwrap().expect("map entry");
    assert_eq!(entry.matrix_event_id, "$ev1");
    assert_eq!(entry.room_id, "!room:x");
    assert_eq!(entry.text, "hello");
    assert_eq!(entry.meshnet, "M1");
    h.queue.stop();
}

#[tokio::test(start_paused = true)]
async fn relays_matrix_reply_as_structured_reply() {
    let h = harness();
    h.db.store_message_map(42, "$e1", "!room:x", "hi", "M1").unwrap();

    let mut event = text_event("> <@bot:x> hi\n\nhello back");
    event.reply_to_event_id = Some("$e1".into());
    h.translator.handle_event(event).await;
    drain(&h).await;

    let sent = h.sent.lock().unwrap().clone();
    assert_eq!(
        sent,
        vec![Sent::Text { text: "Bob Q[M]: hello back".into(), channel: 0, reply_id: Some(42) }]
    );
    let entry = h.db.get_message_map_by_mesh_id(1000).unwrap().expect("reply mapped");
    assert_eq!(entry.text, "hello back");
    h.queue.stop();
}

#[tokio::test(start_paused = true)]
async fn reply_to_unknown_event_falls_through_to_plain_text() {
    let h = harness();
    let mut event = text_event("> quoted\n\nstandalone");
    event.reply_to_event_id = Some("$unknown".into());
    h.translator.handle_event(event).await;
    drain(&h).await;

    let sent = h.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Sent::Text { text, reply_id, .. } => {
            assert_eq!(reply_id, &None);
            assert_eq!(text, "Bob Q[M]: > quoted\n\nstandalone");
        }
        other => panic!("unexpected send: {:?}", other),
    }
    h.queue.stop();
}

#[tokio::test(start_paused = true)]
async fn local_reaction_describes_original() {
    let h = harness();
    h.db.store_message_map(42, "$e1", "!room:x", "hi", "M1").unwrap();

    let mut event = text_event("");
    event.kind = MatrixEventKind::Reaction { key: "👍".into() };
    event.reacts_to_event_id = Some("$e1".into());
    h.translator.handle_event(event).await;
    drain(&h).await;

    let sent = h.sent.lock().unwrap().clone();
    assert_eq!(
        sent,
        vec![Sent::Text { text: "Bob Q[M]: reacted 👍 to \"hi\"".into(), channel: 0, reply_id: None }]
    );
    // Reactions are not reply targets; nothing new in the map.
    assert_eq!(h.db.message_map_len().unwrap(), 1);
    h.queue.stop();
}

#[tokio::test(start_paused = true)]
async fn reaction_to_reaction_is_dropped() {
    let h = harness();
    let mut event = text_event("");
    event.kind = MatrixEventKind::Reaction { key: "👍".into() };
    event.reacts_to_event_id = Some("$unknown".into());
    h.translator.handle_event(event).await;
    drain(&h).await;
    assert!(h.sent.lock().unwrap().is_empty());
    h.queue.stop();
}

#[tokio::test(start_paused = true)]
async fn remote_meshnet_reaction_is_reemitted_on_local_mesh() {
    let h = harness();
    let mut event = text_event("Al/Remo reacted 👍 to \"hello\"");
    event.kind = MatrixEventKind::Emote;
    event.meshtastic = MeshtasticFields {
        longname: Some("Alice".into()),
        shortname: Some("Al".into()),
        meshnet: Some("RemoteNet".into()),
        reply_id: Some(7),
        text: Some("hello".into()),
        emoji: true,
        ..Default::default()
    };
    h.translator.handle_event(event).await;
    drain(&h).await;

    let sent = h.sent.lock().unwrap().clone();
    assert_eq!(
        sent,
        vec![Sent::Text { text: "Al/Remo reacted 👍 to \"hello\"".into(), channel: 0, reply_id: None }]
    );
    h.queue.stop();
}

#[tokio::test(start_paused = true)]
async fn local_meshnet_echo_is_dropped() {
    let h = harness();
    let mut event = text_event("[Alice/M1]: hi");
    event.meshtastic = MeshtasticFields {
        longname: Some("Alice".into()),
        shortname: Some("Al".into()),
        meshnet: Some("M1".into()),
        ..Default::default()
    };
    h.translator.handle_event(event).await;
    drain(&h).await;
    assert!(h.sent.lock().unwrap().is_empty());
    h.queue.stop();
}

#[tokio::test(start_paused = true)]
async fn remote_meshnet_message_is_reprefixed() {
    let h = harness();
    let mut event = text_event("[Alice/RemoteNet]: hello from afar");
    event.meshtastic = MeshtasticFields {
        longname: Some("Alice".into()),
        shortname: Some("Al".into()),
        meshnet: Some("RemoteNet".into()),
        ..Default::default()
    };
    h.translator.handle_event(event).await;
    drain(&h).await;

    let sent = h.sent.lock().unwrap().clone();
    assert_eq!(
        sent,
        vec![Sent::Text { text: "[Alice/Remo]: hello from afar".into(), channel: 0, reply_id: None }]
    );
    h.queue.stop();
}

#[tokio::test(start_paused = true)]
async fn outbound_text_is_truncated_to_packet_limit() {
    let h = harness();
    let long_body = "x".repeat(500);
    h.translator.handle_event(text_event(&long_body)).await;
    drain(&h).await;

    let sent = h.sent.lock().unwrap().clone();
    match &sent[0] {
        Sent::Text { text, .. } => {
            assert!(text.len() <= 227, "sent {} bytes", text.len());
            assert!(text.starts_with("Bob Q[M]: "));
        }
        other => panic!("unexpected send: {:?}", other),
    }
    h.queue.stop();
}

#[tokio::test(start_paused = true)]
async fn broadcast_disabled_drops_messages() {
    let h = harness_with(test_config("  broadcast_enabled: false"), PluginSet::empty());
    h.translator.handle_event(text_event("hello")).await;
    drain(&h).await;
    assert!(h.sent.lock().unwrap().is_empty());
    h.queue.stop();
}

#[tokio::test(start_paused = true)]
async fn unmapped_room_is_ignored() {
    let h = harness();
    let mut event = text_event("hello");
    event.room_id = "!other:x".into();
    h.translator.handle_event(event).await;
    drain(&h).await;
    assert!(h.sent.lock().unwrap().is_empty());
    h.queue.stop();
}

#[tokio::test(start_paused = true)]
async fn detection_sensor_content_passes_through_as_data() {
    let h = harness_with(test_config("  detection_sensor: true"), PluginSet::empty());
    let mut event = text_event("motion detected");
    event.meshtastic.portnum = Some("DETECTION_SENSOR_APP".into());
    h.translator.handle_event(event).await;
    drain(&h).await;

    let sent = h.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Sent::Data { payload, portnum, channel } => {
            assert_eq!(*portnum, PortNum::DetectionSensorApp);
            assert_eq!(*channel, 0);
            assert_eq!(payload, "Bob Q[M]: motion detected".as_bytes());
        }
        other => panic!("unexpected send: {:?}", other),
    }
    // Detection sensor data is never replied to.
    assert_eq!(h.db.message_map_len().unwrap(), 0);
    h.queue.stop();
}

struct PingPlugin;

#[async_trait]
impl Plugin for PingPlugin {
    fn name(&self) -> &str {
        "ping"
    }

    async fn handle_mesh_message(
        &self,
        _packet: &mmrelay::meshtastic::PacketEnvelope,
        _formatted_message: Option<&str>,
        _longname: Option<&str>,
        _meshnet_name: Option<&str>,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn handle_room_message(&self, _event: &MatrixIncoming, _full: &str) -> Result<bool> {
        Ok(false)
    }
}

#[tokio::test(start_paused = true)]
async fn bot_commands_are_not_forwarded() {
    let h = harness_with(test_config(""), PluginSet::new(vec![Arc::new(PingPlugin)]));
    h.translator.handle_event(text_event("!ping")).await;
    h.translator.handle_event(text_event("@bot:x: !ping")).await;
    drain(&h).await;
    assert!(h.sent.lock().unwrap().is_empty());

    // Ordinary chatter still relays.
    h.translator.handle_event(text_event("pinging you all later")).await;
    drain(&h).await;
    assert_eq!(h.sent.lock().unwrap().len(), 1);
    h.queue.stop();
}
