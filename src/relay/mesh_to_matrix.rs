//! Mesh → Matrix translation: turns received radio packets into Matrix
//! events, consulting the identity store for sender names and the message
//! map for reaction/reply correlation.

use std::sync::Arc;

use log::{debug, error, info};
use serde_json::{json, Value};

use crate::config::{Config, InteractionSettings};
use crate::db::Db;
use crate::matrix::MatrixPort;
use crate::meshtastic::{MeshtasticHandle, PacketEnvelope, PacketKind};
use crate::plugins::PluginSet;
use crate::prefix::{abbreviate_quote, get_matrix_prefix};

use super::RoomMap;

/// Shown when a reaction packet carries no usable emoji text.
const FALLBACK_REACTION_SYMBOL: &str = "⚠️";

pub struct MeshToMatrix {
    config: Arc<Config>,
    db: Db,
    matrix: Arc<dyn MatrixPort>,
    mesh: MeshtasticHandle,
    plugins: Arc<PluginSet>,
    rooms: RoomMap,
    interactions: InteractionSettings,
    msgs_to_keep: u32,
}

impl MeshToMatrix {
    pub fn new(
        config: Arc<Config>,
        db: Db,
        matrix: Arc<dyn MatrixPort>,
        mesh: MeshtasticHandle,
        plugins: Arc<PluginSet>,
        rooms: RoomMap,
    ) -> Self {
        let interactions = config.interaction_settings();
        let msgs_to_keep = config.msgs_to_keep();
        Self { config, db, matrix, mesh, plugins, rooms, interactions, msgs_to_keep }
    }

    /// Process one packet received from the radio.
    pub async fn handle_packet(&self, packet: PacketEnvelope) {
        let text = match &packet.kind {
            PacketKind::Text { text }
            | PacketKind::Reply { text, .. }
            | PacketKind::DetectionSensor { text } => text.clone(),
            PacketKind::Reaction { emoji_text, .. } => emoji_text.clone(),
            PacketKind::Telemetry | PacketKind::Position | PacketKind::Other { .. } => {
                // Non-text traffic is offered to plugins only.
                self.plugins.dispatch_mesh_message(&packet, None, None, None).await;
                return;
            }
        };
        info!("Received Meshtastic message: {}", text);

        let channel = packet.channel;
        let Some(room_id) = self.rooms.room_for_channel(channel) else {
            debug!("Skipping message from unmapped channel {}", channel);
            return;
        };

        if matches!(packet.kind, PacketKind::DetectionSensor { .. })
            && !self.config.meshtastic.detection_sensor
        {
            debug!("Detection sensor packet received, but detection sensor processing is disabled.");
            return;
        }

        let is_direct = self
            .mesh
            .my_node_id()
            .map(|my_id| packet.to == my_id)
            .unwrap_or(false);

        let meshnet_name = self.config.meshtastic.meshnet_name.clone();
        let (longname, shortname) = self.resolve_identity(&packet);
        let prefix = get_matrix_prefix(&self.config, &longname, &shortname, &meshnet_name);
        let formatted_message = format!("{}{}", prefix, text);

        let handled = self
            .plugins
            .dispatch_mesh_message(
                &packet,
                Some(&formatted_message),
                Some(&longname),
                Some(&meshnet_name),
            )
            .await;
        if handled {
            debug!("Message was handled by a plugin. Not relaying to Matrix.");
            return;
        }
        if is_direct {
            debug!(
                "Received a direct message from {}: {}. Not relaying to Matrix.",
                longname, text
            );
            return;
        }

        match &packet.kind {
            PacketKind::Reaction { emoji_text, reply_id } => {
                self.relay_reaction(&packet, emoji_text, *reply_id, &longname, &shortname, &prefix)
                    .await;
            }
            PacketKind::Reply { text, reply_id } => {
                self.relay_reply(&packet, text, *reply_id, &room_id, &longname, &shortname, &prefix)
                    .await;
            }
            PacketKind::Text { text } => {
                self.relay_text(&packet, text, &room_id, &longname, &shortname, &prefix, false)
                    .await;
            }
            PacketKind::DetectionSensor { text } => {
                self.relay_text(&packet, text, &room_id, &longname, &shortname, &prefix, true)
                    .await;
            }
            _ => unreachable!("non-text kinds handled above"),
        }
    }

    /// Mesh reaction → Matrix emote in the room the original landed in.
    async fn relay_reaction(
        &self,
        packet: &PacketEnvelope,
        emoji_text: &str,
        reply_id: u32,
        longname: &str,
        shortname: &str,
        prefix: &str,
    ) {
        if !self.interactions.reactions {
            debug!("Filtered out reaction packet due to reactions being disabled.");
            return;
        }
        let orig = match self.db.get_message_map_by_mesh_id(reply_id) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!("Original message for reaction not found in DB.");
                return;
            }
            Err(e) => {
                error!("Message map lookup failed: {:#}", e);
                return;
            }
        };

        let symbol = {
            let trimmed = emoji_text.trim();
            if trimmed.is_empty() { FALLBACK_REACTION_SYMBOL } else { trimmed }
        };
        let abbreviated = abbreviate_quote(&orig.text);
        let body = format!("{}reacted {} to \"{}\"", prefix, symbol, abbreviated);

        let mut content = self.base_content(&body, longname, shortname, "TEXT_MESSAGE_APP");
        content["msgtype"] = json!("m.emote");
        content["meshtastic_id"] = json!(packet.id);
        content["meshtastic_replyId"] = json!(reply_id);
        content["meshtastic_text"] = json!(orig.text);
        content["meshtastic_emoji"] = json!(1);

        match self.matrix.send_event(&orig.room_id, content).await {
            // Emotes are never reply targets, so no map entry is written.
            Ok(event_id) => {
                info!("Sent inbound radio message to matrix room: {}", orig.room_id);
                debug!("Message event_id: {}", event_id);
            }
            Err(e) => error!("Error relaying reaction to Matrix: {:#}", e),
        }
    }

    /// Mesh reply → proper Matrix reply when the target is known, plain text
    /// otherwise.
    #[allow(clippy::too_many_arguments)]
    async fn relay_reply(
        &self,
        packet: &PacketEnvelope,
        text: &str,
        reply_id: u32,
        room_id: &str,
        longname: &str,
        shortname: &str,
        prefix: &str,
    ) {
        if !self.interactions.replies {
            self.relay_text(packet, text, room_id, longname, shortname, prefix, false).await;
            return;
        }
        let orig = match self.db.get_message_map_by_mesh_id(reply_id) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!("Original message for reply not found in DB.");
                self.relay_text(packet, text, room_id, longname, shortname, prefix, false).await;
                return;
            }
            Err(e) => {
                error!("Message map lookup failed: {:#}", e);
                return;
            }
        };

        info!("Relaying Meshtastic reply from {} to Matrix", longname);
        let message = format!("{}{}", prefix, text);
        let bot_user_id = self.matrix.bot_user_id();
        let original_sender = format!("{}/{}", longname, orig.meshnet);
        let quoted = format!("> <{}> [{}]: {}", bot_user_id, original_sender, orig.text);
        let reply_link = format!("https://matrix.to/#/{}/{}", orig.room_id, orig.matrix_event_id);
        let bot_link = format!("https://matrix.to/#/{}", bot_user_id);
        let blockquote = format!(
            "<a href=\"{}\">In reply to</a> <a href=\"{}\">{}</a><br>[{}]: {}",
            reply_link, bot_link, bot_user_id, original_sender, orig.text
        );

        let mut content = self.base_content(
            &format!("{}\n\n{}", quoted, message),
            longname,
            shortname,
            "TEXT_MESSAGE_APP",
        );
        content["meshtastic_id"] = json!(packet.id);
        content["meshtastic_replyId"] = json!(reply_id);
        content["meshtastic_text"] = json!(text);
        content["m.relates_to"] = json!({
            "m.in_reply_to": { "event_id": orig.matrix_event_id }
        });
        content["format"] = json!("org.matrix.custom.html");
        content["formatted_body"] =
            json!(format!("<mx-reply><blockquote>{}</blockquote></mx-reply>{}", blockquote, message));

        match self.matrix.send_event(&orig.room_id, content).await {
            Ok(event_id) => {
                info!("Sent inbound radio message to matrix room: {}", orig.room_id);
                self.store_map(packet.id, &event_id, &orig.room_id, text);
            }
            Err(e) => error!("Error relaying reply to Matrix: {:#}", e),
        }
    }

    /// Plain text (or detection-sensor text) → Matrix room message.
    #[allow(clippy::too_many_arguments)]
    async fn relay_text(
        &self,
        packet: &PacketEnvelope,
        text: &str,
        room_id: &str,
        longname: &str,
        shortname: &str,
        prefix: &str,
        detection_sensor: bool,
    ) {
        info!("Relaying Meshtastic message from {} to Matrix", longname);
        let portnum = if detection_sensor { "DETECTION_SENSOR_APP" } else { "TEXT_MESSAGE_APP" };
        let body = format!("{}{}", prefix, text);
        let mut content = self.base_content(&body, longname, shortname, portnum);
        content["meshtastic_id"] = json!(packet.id);
        content["meshtastic_text"] = json!(text);

        match self.matrix.send_event(room_id, content).await {
            Ok(event_id) => {
                info!("Sent inbound radio message to matrix room: {}", room_id);
                debug!("Message event_id: {}", event_id);
                self.store_map(packet.id, &event_id, room_id, text);
            }
            Err(e) => error!("Error sending radio message to matrix room {}: {:#}", room_id, e),
        }
    }

    /// Common custom-field envelope. The meshnet tag is always the local
    /// meshnet name so downstream relays can distinguish origin.
    fn base_content(&self, body: &str, longname: &str, shortname: &str, portnum: &str) -> Value {
        json!({
            "msgtype": "m.text",
            "body": body,
            "meshtastic_longname": longname,
            "meshtastic_shortname": shortname,
            "meshtastic_meshnet": self.config.meshtastic.meshnet_name,
            "meshtastic_portnum": portnum,
        })
    }

    /// Write the reply/reaction correlation row once the event exists.
    fn store_map(&self, mesh_id: u32, event_id: &str, room_id: &str, text: &str) {
        if !self.interactions.storage_enabled() {
            return;
        }
        if let Err(e) = self.db.store_message_map(
            mesh_id,
            event_id,
            room_id,
            text,
            &self.config.meshtastic.meshnet_name,
        ) {
            error!("Error storing message map: {:#}", e);
            return;
        }
        if self.msgs_to_keep > 0 {
            if let Err(e) = self.db.prune_message_map(self.msgs_to_keep) {
                error!("Error pruning message map: {:#}", e);
            }
        }
    }

    /// Sender display names: identity store first, then the radio's node
    /// table (persisting anything learned), then the bare node id.
    fn resolve_identity(&self, packet: &PacketEnvelope) -> (String, String) {
        let node_id = packet.sender_id();
        let mut longname = self.db.get_longname(&node_id).unwrap_or_else(|e| {
            error!("Identity lookup failed: {:#}", e);
            None
        });
        let mut shortname = self.db.get_shortname(&node_id).unwrap_or_else(|e| {
            error!("Identity lookup failed: {:#}", e);
            None
        });

        if longname.is_none() || shortname.is_none() {
            if let Some(user) = self.mesh.node_user(packet.from) {
                if longname.is_none() && !user.long_name.is_empty() {
                    if let Err(e) = self.db.save_longname(&node_id, &user.long_name) {
                        error!("Failed to save longname: {:#}", e);
                    }
                    longname = Some(user.long_name);
                }
                if shortname.is_none() && !user.short_name.is_empty() {
                    if let Err(e) = self.db.save_shortname(&node_id, &user.short_name) {
                        error!("Failed to save shortname: {:#}", e);
                    }
                    shortname = Some(user.short_name);
                }
            } else {
                debug!("Node info for sender {} not available yet.", node_id);
            }
        }

        (
            longname.unwrap_or_else(|| node_id.clone()),
            shortname.unwrap_or_else(|| node_id.clone()),
        )
    }
}
