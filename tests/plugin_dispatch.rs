use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use mmrelay::db::Db;
use mmrelay::matrix::{MatrixEventKind, MatrixIncoming, MeshtasticFields};
use mmrelay::meshtastic::{PacketEnvelope, PacketKind, BROADCAST_NUM};
use mmrelay::plugins::{Plugin, PluginSet, PluginStore};

struct OrderedPlugin {
    name: String,
    priority: i32,
    consume: bool,
    fail: bool,
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Plugin for OrderedPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn handle_mesh_message(
        &self,
        _packet: &PacketEnvelope,
        _formatted_message: Option<&str>,
        _longname: Option<&str>,
        _meshnet_name: Option<&str>,
    ) -> Result<bool> {
        self.calls.lock().unwrap().push(self.name.clone());
        if self.fail {
            anyhow::bail!("plugin blew up");
        }
        Ok(self.consume)
    }

    async fn handle_room_message(&self, _event: &MatrixIncoming, _full: &str) -> Result<bool> {
        self.calls.lock().unwrap().push(self.name.clone());
        Ok(self.consume)
    }
}

fn packet() -> PacketEnvelope {
    PacketEnvelope {
        from: 0xaa,
        to: BROADCAST_NUM,
        channel: 0,
        id: 1,
        kind: PacketKind::Text { text: "hi".into() },
    }
}

fn event() -> MatrixIncoming {
    MatrixIncoming {
        room_id: "!room:x".into(),
        event_id: "$e".into(),
        sender: "@bob:x".into(),
        body: "hi".into(),
        formatted_body: None,
        kind: MatrixEventKind::Text,
        reply_to_event_id: None,
        reacts_to_event_id: None,
        meshtastic: MeshtasticFields::default(),
    }
}

#[tokio::test]
async fn plugins_run_in_priority_order_and_first_consumer_wins() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let set = PluginSet::new(vec![
        Arc::new(OrderedPlugin {
            name: "late".into(),
            priority: 20,
            consume: false,
            fail: false,
            calls: calls.clone(),
        }),
        Arc::new(OrderedPlugin {
            name: "middle".into(),
            priority: 10,
            consume: true,
            fail: false,
            calls: calls.clone(),
        }),
        Arc::new(OrderedPlugin {
            name: "early".into(),
            priority: 1,
            consume: false,
            fail: false,
            calls: calls.clone(),
        }),
    ]);

    let handled = set.dispatch_mesh_message(&packet(), None, None, None).await;
    assert!(handled);
    // Priority sorts execution; the consumer stops the chain.
    assert_eq!(*calls.lock().unwrap(), vec!["early", "middle"]);
}

#[tokio::test]
async fn plugin_failure_does_not_stop_later_plugins() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let set = PluginSet::new(vec![
        Arc::new(OrderedPlugin {
            name: "broken".into(),
            priority: 1,
            consume: false,
            fail: true,
            calls: calls.clone(),
        }),
        Arc::new(OrderedPlugin {
            name: "working".into(),
            priority: 2,
            consume: true,
            fail: false,
            calls: calls.clone(),
        }),
    ]);

    let handled = set.dispatch_mesh_message(&packet(), None, None, None).await;
    assert!(handled);
    assert_eq!(*calls.lock().unwrap(), vec!["broken", "working"]);
}

#[tokio::test]
async fn nothing_consumed_returns_false() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let set = PluginSet::new(vec![Arc::new(OrderedPlugin {
        name: "observer".into(),
        priority: 1,
        consume: false,
        fail: false,
        calls: calls.clone(),
    })]);
    assert!(!set.dispatch_room_message(&event(), "hi").await);
    assert!(!set.dispatch_mesh_message(&packet(), None, None, None).await);
    assert_eq!(calls.lock().unwrap().len(), 2);
}

struct CountingPlugin {
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl Plugin for CountingPlugin {
    fn name(&self) -> &str {
        "counting"
    }

    fn matrix_commands(&self) -> Vec<String> {
        vec!["count".into(), "tally".into()]
    }

    async fn handle_mesh_message(
        &self,
        _packet: &PacketEnvelope,
        _formatted_message: Option<&str>,
        _longname: Option<&str>,
        _meshnet_name: Option<&str>,
    ) -> Result<bool> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }

    async fn handle_room_message(&self, _event: &MatrixIncoming, _full: &str) -> Result<bool> {
        Ok(false)
    }
}

#[tokio::test]
async fn command_claim_covers_every_registered_command() {
    let set = PluginSet::new(vec![Arc::new(CountingPlugin {
        count: Arc::new(AtomicUsize::new(0)),
    })]);

    let mut cmd = event();
    cmd.body = "!tally today".into();
    assert!(set.claims_command(&cmd, "@bot:x", "Relay Bot"));

    let mut plain = event();
    plain.body = "tally it up manually".into();
    assert!(!set.claims_command(&plain, "@bot:x", "Relay Bot"));
}

#[test]
fn plugin_store_caps_rows_per_node() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path().join("relay.sqlite")).unwrap();
    let store = PluginStore::new(db, "telemetry").with_max_rows(3);

    for i in 0..5 {
        store
            .store_node_data("!000000aa", serde_json::json!({"reading": i}))
            .unwrap();
    }
    let rows = store.get_node_data("!000000aa").unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 3);
    // The oldest rows were truncated on write.
    assert_eq!(rows[0]["reading"], 2);
    assert_eq!(rows[2]["reading"], 4);

    store.set_node_data("!000000aa", vec![serde_json::json!({"reading": 9})]).unwrap();
    let rows = store.get_node_data("!000000aa").unwrap();
    assert_eq!(rows.as_array().unwrap().len(), 1);

    store.delete_node_data("!000000aa").unwrap();
    assert_eq!(store.get_node_data("!000000aa").unwrap(), serde_json::json!([]));
}
