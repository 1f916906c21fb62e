//! # Relay Engine
//!
//! Owns every component and wires them into the explicit dependency graph:
//! store, formatter and queue first, then the two transports, then the two
//! translators, then plugin dispatch. All receipt callbacks are channel
//! consumers constructed here; there are no module-level globals and no
//! import cycles.

pub mod matrix_to_mesh;
pub mod mesh_to_matrix;

pub use matrix_to_mesh::MatrixToMesh;
pub use mesh_to_matrix::MeshToMatrix;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

use crate::config::{Config, RoomMapping};
use crate::db::Db;
use crate::matrix::{MatrixClient, MatrixPort};
use crate::plugins::PluginSet;
use crate::queue::MessageQueue;

/// How long to wait for background tasks to wind down on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Bidirectional room ↔ channel lookup over the configured mapping.
#[derive(Debug, Clone, Default)]
pub struct RoomMap {
    mappings: Vec<RoomMapping>,
}

impl RoomMap {
    pub fn new(mappings: Vec<RoomMapping>) -> Self {
        Self { mappings }
    }

    pub fn channel_for_room(&self, room_id: &str) -> Option<u32> {
        self.mappings
            .iter()
            .find(|mapping| mapping.id == room_id)
            .map(|mapping| mapping.meshtastic_channel)
    }

    pub fn room_for_channel(&self, channel: u32) -> Option<String> {
        self.mappings
            .iter()
            .find(|mapping| mapping.meshtastic_channel == channel)
            .map(|mapping| mapping.id.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// The assembled relay. Construct with [`Relay::run`], which blocks until
/// shutdown is signalled.
pub struct Relay;

impl Relay {
    /// Bring the whole relay up and run until ctrl-c.
    pub async fn run(config: Config, plugins: PluginSet) -> Result<()> {
        config.validate()?;
        let db = Db::open(config.database_path())
            .with_context(|| format!("failed to open database {}", config.database_path()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Radio side first: the queue needs its link state before anything
        // can be enqueued.
        let (mesh_handle, mut mesh_events, mesh_task) =
            crate::meshtastic::start(&config, db.clone(), shutdown_rx.clone())?;

        let queue = MessageQueue::new(db.clone(), mesh_handle.link());
        queue.start(config.message_delay());

        // Matrix side: authenticate, join rooms (resolving aliases), then
        // start the sync loop.
        let matrix = MatrixClient::connect(&config).await?;
        matrix.join_rooms().await?;
        let (mut matrix_events, sync_task) = matrix.start_sync(shutdown_rx.clone());
        let rooms = RoomMap::new(matrix.room_mappings());
        if rooms.is_empty() {
            warn!("matrix_rooms is empty; nothing will be relayed");
        }

        let config = Arc::new(config);
        let matrix: Arc<MatrixClient> = Arc::new(matrix);
        let matrix_port: Arc<dyn MatrixPort> = matrix.clone();
        let plugins = Arc::new(plugins);

        let mesh_to_matrix = Arc::new(MeshToMatrix::new(
            config.clone(),
            db.clone(),
            matrix_port.clone(),
            mesh_handle.clone(),
            plugins.clone(),
            rooms.clone(),
        ));
        let matrix_to_mesh = Arc::new(MatrixToMesh::new(
            config.clone(),
            db.clone(),
            matrix_port,
            mesh_handle.clone(),
            queue.clone(),
            plugins,
            rooms,
        ));

        // One consumer per direction. Each awaits its translator before
        // taking the next event, which preserves per-room and per-channel
        // ordering.
        let mesh_consumer = {
            let translator = mesh_to_matrix.clone();
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        packet = mesh_events.recv() => match packet {
                            Some(packet) => translator.handle_packet(packet).await,
                            None => break,
                        },
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("Mesh event consumer terminated");
            })
        };
        let matrix_consumer = {
            let translator = matrix_to_mesh.clone();
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = matrix_events.recv() => match event {
                            Some(event) => translator.handle_event(event).await,
                            None => break,
                        },
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("Matrix event consumer terminated");
            })
        };

        info!("Relay running; press ctrl-c to stop");
        tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
        info!("Shutdown requested");

        let _ = shutdown_tx.send(true);
        queue.stop();
        for (name, task) in [
            ("mesh transport", mesh_task),
            ("matrix sync", sync_task),
            ("mesh consumer", mesh_consumer),
            ("matrix consumer", matrix_consumer),
        ] {
            if timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("{} did not stop within {:?}", name, SHUTDOWN_GRACE);
            }
        }
        info!("Relay stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_map_lookups() {
        let map = RoomMap::new(vec![
            RoomMapping { id: "!a:example.org".into(), meshtastic_channel: 0 },
            RoomMapping { id: "!b:example.org".into(), meshtastic_channel: 2 },
        ]);
        assert_eq!(map.channel_for_room("!a:example.org"), Some(0));
        assert_eq!(map.channel_for_room("!b:example.org"), Some(2));
        assert_eq!(map.channel_for_room("!c:example.org"), None);
        assert_eq!(map.room_for_channel(2).as_deref(), Some("!b:example.org"));
        assert_eq!(map.room_for_channel(9), None);
    }
}
