//! # Identity / Message-Map Store
//!
//! Small sqlite-backed store with four tables: `longnames` and `shortnames`
//! (node display names learned from the mesh), `message_map` (one row per
//! relayed text message, keyed by both the mesh packet id and the Matrix
//! event id) and `plugin_data` (arbitrary JSON blobs per plugin and node).
//!
//! Every operation opens its own connection and commits before returning, so
//! writes are durable when the call completes and no connection state is
//! shared across tasks. Operations are cheap single statements; callers are
//! expected to log failures and carry on. A broken store degrades reply and
//! reaction bridging but never stops the relay.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};

/// One relayed message correlated across both protocols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub mesh_id: u32,
    pub matrix_event_id: String,
    pub room_id: String,
    pub text: String,
    pub meshnet: String,
}

/// Handle to the relay database. Cloning is cheap; connections are per-call.
#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Db { path: path.as_ref().to_path_buf() };
        let conn = db.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS longnames (
                 meshtastic_id TEXT PRIMARY KEY,
                 longname TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS shortnames (
                 meshtastic_id TEXT PRIMARY KEY,
                 shortname TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS message_map (
                 insert_order INTEGER PRIMARY KEY AUTOINCREMENT,
                 meshtastic_id INTEGER NOT NULL UNIQUE,
                 matrix_event_id TEXT NOT NULL,
                 matrix_room_id TEXT NOT NULL,
                 meshtastic_text TEXT NOT NULL,
                 meshtastic_meshnet TEXT NOT NULL DEFAULT ''
             );
             CREATE INDEX IF NOT EXISTS idx_message_map_event_id
                 ON message_map (matrix_event_id);
             CREATE TABLE IF NOT EXISTS plugin_data (
                 plugin_name TEXT NOT NULL,
                 meshtastic_id TEXT NOT NULL,
                 data TEXT NOT NULL,
                 PRIMARY KEY (plugin_name, meshtastic_id)
             );",
        )
        .context("failed to initialize database schema")?;
        Ok(db)
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open(&self.path)
            .with_context(|| format!("failed to open database {}", self.path.display()))
    }

    // ---------- node identity ----------

    pub fn get_longname(&self, node_id: &str) -> Result<Option<String>> {
        let conn = self.connect()?;
        let name = conn
            .query_row(
                "SELECT longname FROM longnames WHERE meshtastic_id = ?1",
                params![node_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    pub fn save_longname(&self, node_id: &str, longname: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO longnames (meshtastic_id, longname) VALUES (?1, ?2)",
            params![node_id, longname],
        )?;
        Ok(())
    }

    pub fn get_shortname(&self, node_id: &str) -> Result<Option<String>> {
        let conn = self.connect()?;
        let name = conn
            .query_row(
                "SELECT shortname FROM shortnames WHERE meshtastic_id = ?1",
                params![node_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    pub fn save_shortname(&self, node_id: &str, shortname: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO shortnames (meshtastic_id, shortname) VALUES (?1, ?2)",
            params![node_id, shortname],
        )?;
        Ok(())
    }

    /// Bulk-import long names from a node-table snapshot.
    pub fn update_longnames<'a>(
        &self,
        entries: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<()> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("INSERT OR REPLACE INTO longnames (meshtastic_id, longname) VALUES (?1, ?2)")?;
        for (node_id, longname) in entries {
            stmt.execute(params![node_id, longname])?;
        }
        Ok(())
    }

    /// Bulk-import short names from a node-table snapshot.
    pub fn update_shortnames<'a>(
        &self,
        entries: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<()> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("INSERT OR REPLACE INTO shortnames (meshtastic_id, shortname) VALUES (?1, ?2)")?;
        for (node_id, shortname) in entries {
            stmt.execute(params![node_id, shortname])?;
        }
        Ok(())
    }

    // ---------- message map ----------

    /// Upsert a map row keyed by the mesh packet id. Replacement refreshes
    /// the row's insert order, which the pruner relies on.
    pub fn store_message_map(
        &self,
        mesh_id: u32,
        matrix_event_id: &str,
        room_id: &str,
        text: &str,
        meshnet: &str,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO message_map
                 (meshtastic_id, matrix_event_id, matrix_room_id, meshtastic_text, meshtastic_meshnet)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![mesh_id as i64, matrix_event_id, room_id, text, meshnet],
        )?;
        debug!("Stored message map for meshtastic_id: {}", mesh_id);
        Ok(())
    }

    pub fn get_message_map_by_mesh_id(&self, mesh_id: u32) -> Result<Option<MapEntry>> {
        let conn = self.connect()?;
        let entry = conn
            .query_row(
                "SELECT meshtastic_id, matrix_event_id, matrix_room_id,
                        meshtastic_text, meshtastic_meshnet
                 FROM message_map WHERE meshtastic_id = ?1",
                params![mesh_id as i64],
                Self::map_entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn get_message_map_by_event_id(&self, matrix_event_id: &str) -> Result<Option<MapEntry>> {
        let conn = self.connect()?;
        let entry = conn
            .query_row(
                "SELECT meshtastic_id, matrix_event_id, matrix_room_id,
                        meshtastic_text, meshtastic_meshnet
                 FROM message_map WHERE matrix_event_id = ?1",
                params![matrix_event_id],
                Self::map_entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    fn map_entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MapEntry> {
        Ok(MapEntry {
            mesh_id: row.get::<_, i64>(0)? as u32,
            matrix_event_id: row.get(1)?,
            room_id: row.get(2)?,
            text: row.get(3)?,
            meshnet: row.get(4)?,
        })
    }

    /// Retain only the `keep` most recently inserted rows. Idempotent.
    pub fn prune_message_map(&self, keep: u32) -> Result<usize> {
        let conn = self.connect()?;
        let removed = conn.execute(
            "DELETE FROM message_map WHERE insert_order NOT IN
                 (SELECT insert_order FROM message_map
                  ORDER BY insert_order DESC LIMIT ?1)",
            params![keep as i64],
        )?;
        if removed > 0 {
            debug!("Pruned {} message map rows, keeping {}", removed, keep);
        }
        Ok(removed)
    }

    /// Operator maintenance: drop every map row.
    pub fn wipe_message_map(&self) -> Result<usize> {
        let conn = self.connect()?;
        let removed = conn.execute("DELETE FROM message_map", [])?;
        Ok(removed)
    }

    pub fn message_map_len(&self) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM message_map", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ---------- plugin data ----------

    pub fn store_plugin_data(
        &self,
        plugin_name: &str,
        node_id: &str,
        data: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO plugin_data (plugin_name, meshtastic_id, data)
             VALUES (?1, ?2, ?3)",
            params![plugin_name, node_id, data.to_string()],
        )?;
        Ok(())
    }

    /// Rows stored for one plugin and node, `[]` when absent.
    pub fn get_plugin_data_for_node(
        &self,
        plugin_name: &str,
        node_id: &str,
    ) -> Result<serde_json::Value> {
        let conn = self.connect()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM plugin_data WHERE plugin_name = ?1 AND meshtastic_id = ?2",
                params![plugin_name, node_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(serde_json::Value::Array(Vec::new())),
        }
    }

    /// All rows stored for one plugin, across nodes.
    pub fn get_plugin_data(&self, plugin_name: &str) -> Result<Vec<serde_json::Value>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT data FROM plugin_data WHERE plugin_name = ?1")?;
        let rows = stmt.query_map(params![plugin_name], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(serde_json::from_str(&raw?)?);
        }
        Ok(out)
    }

    pub fn delete_plugin_data(&self, plugin_name: &str, node_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM plugin_data WHERE plugin_name = ?1 AND meshtastic_id = ?2",
            params![plugin_name, node_id],
        )?;
        Ok(())
    }
}
