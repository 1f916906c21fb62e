//! # Plugin Dispatch Module
//!
//! Contract and dispatcher for relay plugins. Concrete plugins live outside
//! the core; the core only defines the trait they satisfy, routes every
//! message through them in priority order, and offers the per-node JSON
//! storage they persist state in.
//!
//! A handler returning `true` means "consumed, stop further processing".
//! A handler returning an error is logged and treated as "not consumed" so a
//! single broken plugin never blocks the pipeline.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info};
use serde_json::Value;

use crate::db::Db;
use crate::matrix::MatrixIncoming;
use crate::meshtastic::PacketEnvelope;

/// Default cap on stored rows per plugin and node.
pub const DEFAULT_MAX_DATA_ROWS_PER_NODE: usize = 100;

/// A relay plugin. Lower `priority` runs earlier.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        10
    }

    /// Commands this plugin answers to on the Matrix side (`!command`).
    fn matrix_commands(&self) -> Vec<String> {
        vec![self.name().to_string()]
    }

    /// Commands this plugin answers to on the mesh side.
    fn mesh_commands(&self) -> Vec<String> {
        Vec::new()
    }

    /// Offer a received mesh packet. `formatted_message`, `longname` and
    /// `meshnet_name` are populated for text packets only.
    async fn handle_mesh_message(
        &self,
        packet: &PacketEnvelope,
        formatted_message: Option<&str>,
        longname: Option<&str>,
        meshnet_name: Option<&str>,
    ) -> Result<bool>;

    /// Offer a received Matrix room event.
    async fn handle_room_message(&self, event: &MatrixIncoming, full_message: &str)
        -> Result<bool>;
}

/// Priority-ordered plugin collection loaded once at startup.
pub struct PluginSet {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginSet {
    pub fn new(mut plugins: Vec<Arc<dyn Plugin>>) -> Self {
        plugins.sort_by_key(|p| p.priority());
        for plugin in &plugins {
            debug!("Loaded plugin {} with priority={}", plugin.name(), plugin.priority());
        }
        Self { plugins }
    }

    pub fn empty() -> Self {
        Self { plugins: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Offer a mesh packet to every plugin in order; first consumer wins.
    pub async fn dispatch_mesh_message(
        &self,
        packet: &PacketEnvelope,
        formatted_message: Option<&str>,
        longname: Option<&str>,
        meshnet_name: Option<&str>,
    ) -> bool {
        for plugin in &self.plugins {
            match plugin
                .handle_mesh_message(packet, formatted_message, longname, meshnet_name)
                .await
            {
                Ok(true) => {
                    debug!("Processed by plugin {}", plugin.name());
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Plugin {} failed: {:#}", plugin.name(), e);
                }
            }
        }
        false
    }

    /// Offer a Matrix event to every plugin in order; first consumer wins.
    pub async fn dispatch_room_message(&self, event: &MatrixIncoming, full_message: &str) -> bool {
        for plugin in &self.plugins {
            match plugin.handle_room_message(event, full_message).await {
                Ok(true) => {
                    info!(
                        "Processed command with plugin: {} from {}",
                        plugin.name(),
                        event.sender
                    );
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Error processing message with plugin {}: {:#}", plugin.name(), e);
                }
            }
        }
        false
    }

    /// Whether the event is a bot command claimed by any plugin. Claimed
    /// commands are never forwarded to the mesh.
    pub fn claims_command(
        &self,
        event: &MatrixIncoming,
        bot_user_id: &str,
        bot_display_name: &str,
    ) -> bool {
        for plugin in &self.plugins {
            for command in plugin.matrix_commands() {
                if is_bot_command(&command, event, bot_user_id, bot_display_name) {
                    return true;
                }
            }
        }
        false
    }
}

/// Check whether an event addresses `command` at the bot, accounting for the
/// ways different Matrix clients format mentions.
pub fn is_bot_command(
    command: &str,
    event: &MatrixIncoming,
    bot_user_id: &str,
    bot_display_name: &str,
) -> bool {
    let body = event.body.trim();
    let formatted = event
        .formatted_body
        .as_deref()
        .map(strip_html_tags)
        .unwrap_or_default();
    let formatted = formatted.trim();

    let bang = format!("!{}", command);
    for text in [body, formatted] {
        if text.starts_with(&bang) {
            return true;
        }
        if mention_command_match(text, bot_user_id, &bang)
            || mention_command_match(text, bot_display_name, &bang)
        {
            return true;
        }
    }
    false
}

/// Match `<mention>[,:;]? !command ...` at the start of `text`.
fn mention_command_match(text: &str, mention: &str, bang: &str) -> bool {
    if mention.is_empty() {
        return false;
    }
    let Some(mut rest) = text.strip_prefix(mention) else {
        return false;
    };
    rest = rest.strip_prefix([',', ':', ';']).unwrap_or(rest);
    rest.trim_start().starts_with(bang)
}

/// Drop `<...>` tag spans, keeping the text between them.
pub fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

/// Per-plugin persistent state helper: JSON rows keyed by node, truncated to
/// the newest `max_rows` on write.
#[derive(Clone)]
pub struct PluginStore {
    db: Db,
    plugin_name: String,
    max_rows: usize,
}

impl PluginStore {
    pub fn new(db: Db, plugin_name: impl Into<String>) -> Self {
        Self { db, plugin_name: plugin_name.into(), max_rows: DEFAULT_MAX_DATA_ROWS_PER_NODE }
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    /// Append one row (or several) for a node, keeping only the newest rows.
    pub fn store_node_data(&self, node_id: &str, node_data: Value) -> Result<()> {
        let mut rows = match self.db.get_plugin_data_for_node(&self.plugin_name, node_id)? {
            Value::Array(rows) => rows,
            other => vec![other],
        };
        match node_data {
            Value::Array(mut new_rows) => rows.append(&mut new_rows),
            single => rows.push(single),
        }
        if rows.len() > self.max_rows {
            rows.drain(..rows.len() - self.max_rows);
        }
        self.db
            .store_plugin_data(&self.plugin_name, node_id, &Value::Array(rows))
    }

    /// Replace all rows for a node, applying the cap.
    pub fn set_node_data(&self, node_id: &str, node_data: Vec<Value>) -> Result<()> {
        let start = node_data.len().saturating_sub(self.max_rows);
        self.db.store_plugin_data(
            &self.plugin_name,
            node_id,
            &Value::Array(node_data[start..].to_vec()),
        )
    }

    pub fn get_node_data(&self, node_id: &str) -> Result<Value> {
        self.db.get_plugin_data_for_node(&self.plugin_name, node_id)
    }

    pub fn delete_node_data(&self, node_id: &str) -> Result<()> {
        self.db.delete_plugin_data(&self.plugin_name, node_id)
    }

    pub fn get_data(&self) -> Result<Vec<Value>> {
        self.db.get_plugin_data(&self.plugin_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{MatrixEventKind, MeshtasticFields};

    fn text_event(body: &str, formatted: Option<&str>) -> MatrixIncoming {
        MatrixIncoming {
            room_id: "!room:example.org".into(),
            event_id: "$ev".into(),
            sender: "@bob:example.org".into(),
            body: body.into(),
            formatted_body: formatted.map(str::to_string),
            kind: MatrixEventKind::Text,
            reply_to_event_id: None,
            reacts_to_event_id: None,
            meshtastic: MeshtasticFields::default(),
        }
    }

    #[test]
    fn bang_command_matches() {
        let event = text_event("!ping now", None);
        assert!(is_bot_command("ping", &event, "@bot:example.org", "Relay Bot"));
        assert!(!is_bot_command("weather", &event, "@bot:example.org", "Relay Bot"));
    }

    #[test]
    fn mention_command_matches() {
        for body in [
            "@bot:example.org: !ping",
            "@bot:example.org, !ping now",
            "Relay Bot; !ping",
            "Relay Bot !ping",
        ] {
            let event = text_event(body, None);
            assert!(
                is_bot_command("ping", &event, "@bot:example.org", "Relay Bot"),
                "should match: {}",
                body
            );
        }
    }

    #[test]
    fn html_formatted_mention_matches() {
        let event = text_event(
            "unrelated plain body",
            Some("<a href=\"https://matrix.to/#/@bot:example.org\">Relay Bot</a>: !ping"),
        );
        assert!(is_bot_command("ping", &event, "@bot:example.org", "Relay Bot"));
    }

    #[test]
    fn plain_chatter_is_not_a_command() {
        let event = text_event("shall we ping the mesh later?", None);
        assert!(!is_bot_command("ping", &event, "@bot:example.org", "Relay Bot"));
    }

    #[test]
    fn strip_html_removes_tags() {
        assert_eq!(strip_html_tags("<b>hello</b> <i>there</i>"), "hello there");
        assert_eq!(strip_html_tags("no tags"), "no tags");
    }
}
