use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::time::{sleep, Duration, Instant};

use mmrelay::db::Db;
use mmrelay::queue::{LinkState, MessageQueue, SendOutcome, SendThunk};

fn ready_link() -> (watch::Sender<LinkState>, watch::Receiver<LinkState>) {
    watch::channel(LinkState { attached: true, reconnecting: false, connected: true })
}

fn scratch_db() -> (tempfile::TempDir, Db) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Db::open(dir.path().join("relay.sqlite")).expect("db open");
    (dir, db)
}

/// Thunk that appends its completion instant and label, then succeeds.
fn recording_thunk(
    log: Arc<Mutex<Vec<(String, Instant)>>>,
    label: &str,
    mesh_id: Option<u32>,
) -> SendThunk {
    let label = label.to_string();
    Box::new(move || {
        Box::pin(async move {
            log.lock().unwrap().push((label, Instant::now()));
            Ok(SendOutcome { mesh_id })
        })
    })
}

#[tokio::test(start_paused = true)]
async fn fifo_order_and_minimum_gap() {
    let (_dir, db) = scratch_db();
    let (_link_tx, link_rx) = ready_link();
    let queue = MessageQueue::new(db, link_rx);
    queue.start(2.0);

    let log = Arc::new(Mutex::new(Vec::new()));
    for label in ["a", "b", "c"] {
        assert!(queue.enqueue(recording_thunk(log.clone(), label, None), label, None));
    }

    // Three sends at a 2 s gap finish within ~4 s of virtual time.
    sleep(Duration::from_secs(10)).await;

    let entries = log.lock().unwrap().clone();
    let order: Vec<&str> = entries.iter().map(|(label, _)| label.as_str()).collect();
    assert_eq!(order, ["a", "b", "c"]);
    for pair in entries.windows(2) {
        let gap = pair[1].1 - pair[0].1;
        assert!(gap >= Duration::from_secs(2), "inter-send gap too small: {:?}", gap);
    }
    queue.stop();
}

#[tokio::test(start_paused = true)]
async fn sub_minimum_delay_is_clamped() {
    let (_dir, db) = scratch_db();
    let (_link_tx, link_rx) = ready_link();
    let queue = MessageQueue::new(db, link_rx);
    // Below the firmware floor; the queue must pace at 2.0 s anyway.
    queue.start(0.5);

    let log = Arc::new(Mutex::new(Vec::new()));
    for label in ["a", "b"] {
        queue.enqueue(recording_thunk(log.clone(), label, None), label, None);
    }
    sleep(Duration::from_secs(6)).await;

    let entries = log.lock().unwrap().clone();
    assert_eq!(entries.len(), 2);
    assert!(entries[1].1 - entries[0].1 >= Duration::from_secs(2));
    queue.stop();
}

#[tokio::test(start_paused = true)]
async fn outage_holds_head_without_dropping() {
    let (_dir, db) = scratch_db();
    let (link_tx, link_rx) =
        watch::channel(LinkState { attached: false, reconnecting: true, connected: false });
    let queue = MessageQueue::new(db, link_rx);
    queue.start(2.0);

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_thunk = calls.clone();
    let thunk: SendThunk = Box::new(move || {
        Box::pin(async move {
            calls_in_thunk.fetch_add(1, Ordering::SeqCst);
            Ok(SendOutcome::default())
        })
    });
    assert!(queue.enqueue(thunk, "held during outage", None));

    // While the transport is down the drainer polls but never invokes.
    sleep(Duration::from_secs(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    link_tx
        .send(LinkState { attached: true, reconnecting: false, connected: true })
        .unwrap();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "held send must run exactly once");
    queue.stop();
}

#[tokio::test(start_paused = true)]
async fn failed_thunk_does_not_stop_the_drainer() {
    let (_dir, db) = scratch_db();
    let (_link_tx, link_rx) = ready_link();
    let queue = MessageQueue::new(db, link_rx);
    queue.start(2.0);

    let log = Arc::new(Mutex::new(Vec::new()));
    let failing: SendThunk =
        Box::new(|| Box::pin(async { Err(anyhow::anyhow!("radio send failed")) }));
    queue.enqueue(failing, "doomed", None);
    queue.enqueue(recording_thunk(log.clone(), "after failure", None), "after failure", None);

    sleep(Duration::from_secs(8)).await;
    let entries = log.lock().unwrap().clone();
    assert_eq!(entries.len(), 1, "later item must still be sent");
    queue.stop();
}

#[tokio::test(start_paused = true)]
async fn mapping_persisted_only_after_successful_send() {
    let (_dir, db) = scratch_db();
    let (_link_tx, link_rx) = ready_link();
    let queue = MessageQueue::new(db.clone(), link_rx);
    queue.start(2.0);

    let mapping = mmrelay::queue::MappingInfo {
        matrix_event_id: "$e1".into(),
        room_id: "!room:x".into(),
        text: "hello".into(),
        meshnet: "M1".into(),
        msgs_to_keep: 500,
    };
    let log = Arc::new(Mutex::new(Vec::new()));
    queue.enqueue(
        recording_thunk(log.clone(), "mapped", Some(4242)),
        "mapped",
        Some(mapping.clone()),
    );

    // A failing send with mapping info must not write a row.
    let failing: SendThunk =
        Box::new(|| Box::pin(async { Err(anyhow::anyhow!("radio send failed")) }));
    queue.enqueue(failing, "failed with mapping", Some(mapping));

    sleep(Duration::from_secs(8)).await;

    let entry = db.get_message_map_by_mesh_id(4242).unwrap().expect("mapping stored");
    assert_eq!(entry.matrix_event_id, "$e1");
    assert_eq!(entry.text, "hello");
    assert_eq!(db.message_map_len().unwrap(), 1);
    queue.stop();
}

#[tokio::test]
async fn enqueue_rejected_when_not_running_or_full() {
    let (_dir, db) = scratch_db();
    let (link_tx, link_rx) = ready_link();
    let queue = MessageQueue::new(db, link_rx);

    let noop = || -> SendThunk {
        Box::new(|| Box::pin(async { Ok(SendOutcome::default()) }))
    };
    assert!(!queue.enqueue(noop(), "before start", None));

    // Block the drainer by taking the link down, then fill the queue.
    link_tx
        .send(LinkState { attached: false, reconnecting: true, connected: false })
        .unwrap();
    queue.start(2.0);
    for i in 0..mmrelay::queue::MAX_QUEUE_SIZE {
        assert!(queue.enqueue(noop(), format!("fill {}", i), None));
    }
    assert!(!queue.enqueue(noop(), "overflow", None));

    queue.stop();
    assert!(!queue.is_running());
    assert!(!queue.enqueue(noop(), "after stop", None));
}
