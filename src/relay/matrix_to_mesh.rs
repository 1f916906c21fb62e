//! Matrix → mesh translation: turns room events into rate-limited radio
//! sends, handling reactions, replies, remote-meshnet re-emission and
//! detection-sensor pass-through.

use std::sync::Arc;

use log::{debug, error, info};

use crate::config::{Config, InteractionSettings};
use crate::db::Db;
use crate::matrix::{MatrixEventKind, MatrixIncoming, MatrixPort};
use crate::meshtastic::{MeshtasticHandle, PortNum};
use crate::plugins::PluginSet;
use crate::prefix::{
    abbreviate_quote, get_matrix_prefix, get_meshtastic_prefix, strip_quoted_lines,
    truncate_message,
};
use crate::queue::{MappingInfo, MessageQueue, SendOutcome, SendThunk};

use super::RoomMap;

pub struct MatrixToMesh {
    config: Arc<Config>,
    db: Db,
    matrix: Arc<dyn MatrixPort>,
    mesh: MeshtasticHandle,
    queue: MessageQueue,
    plugins: Arc<PluginSet>,
    rooms: RoomMap,
    interactions: InteractionSettings,
    msgs_to_keep: u32,
}

impl MatrixToMesh {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        db: Db,
        matrix: Arc<dyn MatrixPort>,
        mesh: MeshtasticHandle,
        queue: MessageQueue,
        plugins: Arc<PluginSet>,
        rooms: RoomMap,
    ) -> Self {
        let interactions = config.interaction_settings();
        let msgs_to_keep = config.msgs_to_keep();
        Self { config, db, matrix, mesh, queue, plugins, rooms, interactions, msgs_to_keep }
    }

    /// Process one event from the sync loop. Old events, the bot's own
    /// events and suppressed events were already dropped at the session
    /// boundary.
    pub async fn handle_event(&self, event: MatrixIncoming) {
        let Some(channel) = self.rooms.channel_for_room(&event.room_id) else {
            return;
        };

        // An emote carrying a remote meshnet tag and a mesh reply id is a
        // relayed reaction from another meshnet, not a chat message.
        let is_remote_reaction = event.kind == MatrixEventKind::Emote
            && event.meshtastic.reply_id.is_some()
            && event
                .meshtastic
                .meshnet
                .as_deref()
                .is_some_and(|meshnet| meshnet != self.local_meshnet());

        if let MatrixEventKind::Reaction { key } = &event.kind {
            if !self.interactions.reactions {
                debug!("Reaction event encountered but reactions are disabled. Doing nothing.");
                return;
            }
            self.relay_local_reaction(&event, key.clone(), channel).await;
            return;
        }
        if is_remote_reaction {
            if !self.interactions.reactions {
                debug!("Reaction event encountered but reactions are disabled. Doing nothing.");
                return;
            }
            self.relay_remote_reaction(&event, channel).await;
            return;
        }

        if let Some(reply_to) = event.reply_to_event_id.clone() {
            if self.interactions.replies && self.relay_reply(&event, &reply_to, channel).await {
                return;
            }
        }

        self.relay_plain(&event, channel).await;
    }

    fn local_meshnet(&self) -> &str {
        &self.config.meshtastic.meshnet_name
    }

    /// Reaction by a Matrix user on a relayed message → descriptive text on
    /// the mapped channel.
    async fn relay_local_reaction(&self, event: &MatrixIncoming, emoji: String, channel: u32) {
        let orig = match self.db.get_message_map_by_event_id(
            event.reacts_to_event_id.as_deref().unwrap_or_default(),
        ) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(
                    "Original message for reaction not found in DB. Possibly a \
                     reaction-to-reaction scenario. Not forwarding."
                );
                return;
            }
            Err(e) => {
                error!("Message map lookup failed: {:#}", e);
                return;
            }
        };

        let display_name = self.matrix.display_name(&event.room_id, &event.sender).await;
        let prefix = get_meshtastic_prefix(&self.config, &display_name, Some(&event.sender));
        let abbreviated = abbreviate_quote(&orig.text);
        let message = format!("{}reacted {} to \"{}\"", prefix, emoji, abbreviated);

        if !self.config.meshtastic.broadcast_enabled {
            debug!("Broadcast not supported: Reaction from {} dropped.", display_name);
            return;
        }
        info!("Relaying reaction from {} to radio broadcast", display_name);
        self.enqueue_text(message, channel, format!("Local reaction from {}", display_name), None);
    }

    /// Reaction relayed from another meshnet through Matrix → text line on
    /// our local mesh.
    async fn relay_remote_reaction(&self, event: &MatrixIncoming, channel: u32) {
        let meshnet = event.meshtastic.meshnet.clone().unwrap_or_default();
        info!("Relaying reaction from remote meshnet: {}", meshnet);

        let short_meshnet: String = meshnet.chars().take(4).collect();
        let shortname = remote_shortname(&event.meshtastic.shortname, &event.meshtastic.longname);
        let emoji = extract_reaction_emoji(&event.body);
        let quoted = abbreviate_quote(event.meshtastic.text.as_deref().unwrap_or_default());
        let message =
            format!("{}/{} reacted {} to \"{}\"", shortname, short_meshnet, emoji, quoted);

        if !self.config.meshtastic.broadcast_enabled {
            debug!("Broadcast not supported: remote reaction dropped.");
            return;
        }
        info!("Relaying reaction from remote meshnet {} to radio broadcast", meshnet);
        self.enqueue_text(message, channel, format!("Remote reaction from {}", meshnet), None);
    }

    /// Matrix reply to a relayed mesh message → structured mesh reply.
    /// Returns false when the referenced message is unknown so the caller
    /// can fall through to the plain-text path.
    async fn relay_reply(&self, event: &MatrixIncoming, reply_to: &str, channel: u32) -> bool {
        let orig = match self.db.get_message_map_by_event_id(reply_to) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!("Original message for Matrix reply not found in DB: {}", reply_to);
                return false;
            }
            Err(e) => {
                error!("Message map lookup failed: {:#}", e);
                return false;
            }
        };

        let display_name = self.matrix.display_name(&event.room_id, &event.sender).await;
        let prefix = get_meshtastic_prefix(&self.config, &display_name, Some(&event.sender));
        let clean = strip_quoted_lines(&event.body);
        let reply_message = truncate_message(&format!("{}{}", prefix, clean)).to_string();

        if !self.config.meshtastic.broadcast_enabled {
            debug!("Broadcast not supported: reply from {} dropped.", display_name);
            return true;
        }
        info!(
            "Relaying Matrix reply from {} to Meshtastic as reply to message {}",
            display_name, orig.mesh_id
        );

        let mapping = self.mapping_info(event, &clean);
        let mesh = self.mesh.clone();
        let reply_id = orig.mesh_id;
        let text = reply_message;
        let thunk: SendThunk = Box::new(move || {
            Box::pin(async move {
                let id = mesh.send_text_reply(text, reply_id, channel).await?;
                Ok(SendOutcome { mesh_id: Some(id) })
            })
        });
        let description = format!("Reply from {} to message {}", display_name, reply_id);
        if self.queue.enqueue(thunk, description, mapping) {
            self.log_queued(&format!(
                "Relaying Matrix reply from {} to radio broadcast as structured reply",
                display_name
            ));
        } else {
            error!("Failed to relay structured reply to Meshtastic");
        }
        true
    }

    /// Plain text / notice / emote → prefixed broadcast, with remote-meshnet
    /// re-emission and detection-sensor pass-through.
    async fn relay_plain(&self, event: &MatrixIncoming, channel: u32) {
        let local_meshnet = self.local_meshnet().to_string();
        let text = event.body.clone();

        let (full_message, display_name) = match (&event.meshtastic.longname, &event.meshtastic.meshnet)
        {
            (Some(longname), Some(meshnet)) => {
                if meshnet == &local_meshnet {
                    // Our own earlier echo looping back through Matrix.
                    return;
                }
                info!("Processing message from remote meshnet: {}", meshnet);
                let short_meshnet: String = meshnet.chars().take(4).collect();
                let shortname =
                    remote_shortname(&event.meshtastic.shortname, &event.meshtastic.longname);
                // Strip the prefix the remote relay stamped on, then re-tag
                // with the abbreviated meshnet so the line stays short.
                let original_prefix =
                    get_matrix_prefix(&self.config, longname, &shortname, meshnet);
                let mut body = text.as_str();
                if !original_prefix.is_empty() {
                    if let Some(stripped) = body.strip_prefix(original_prefix.as_str()) {
                        debug!(
                            "Removed original prefix '{}' from remote meshnet message",
                            original_prefix
                        );
                        body = stripped;
                    }
                }
                let body = truncate_message(body);
                let prefix = get_matrix_prefix(&self.config, longname, &shortname, &short_meshnet);
                (format!("{}{}", prefix, body), format!("{}/{}", longname, meshnet))
            }
            _ => {
                let display_name = self.matrix.display_name(&event.room_id, &event.sender).await;
                debug!("Processing matrix message from [{}]: {}", display_name, text);
                let prefix = get_meshtastic_prefix(&self.config, &display_name, Some(&event.sender));
                let full = truncate_message(&format!("{}{}", prefix, text)).to_string();
                (full, display_name)
            }
        };

        let handled = self.plugins.dispatch_room_message(event, &full_message).await;
        if self.plugins.claims_command(
            event,
            &self.matrix.bot_user_id(),
            &self.matrix.bot_display_name(),
        ) {
            debug!("Message is a command, not sending to mesh");
            return;
        }
        if handled {
            return;
        }

        if !self.config.meshtastic.broadcast_enabled {
            debug!("Broadcast not supported: Message from {} dropped.", display_name);
            return;
        }

        if event.meshtastic.portnum.as_deref() == Some("DETECTION_SENSOR_APP") {
            if !self.config.meshtastic.detection_sensor {
                debug!(
                    "Detection sensor packet received from {}, but detection sensor \
                     processing is disabled.",
                    display_name
                );
                return;
            }
            let mesh = self.mesh.clone();
            let payload = full_message.clone().into_bytes();
            let thunk: SendThunk = Box::new(move || {
                Box::pin(async move {
                    let id = mesh.send_data(payload, PortNum::DetectionSensorApp, channel).await?;
                    Ok(SendOutcome { mesh_id: Some(id) })
                })
            });
            // Detection sensor data is never replied to, so no mapping.
            let description = format!("Detection sensor data from {}", display_name);
            if self.queue.enqueue(thunk, description, None) {
                self.log_queued(&format!(
                    "Relaying detection sensor data from {} to radio broadcast",
                    display_name
                ));
            } else {
                error!("Failed to relay detection sensor data to Meshtastic");
            }
            return;
        }

        let mapping = self.mapping_info(event, &strip_quoted_lines(&text));
        let description = format!("Message from {}", display_name);
        if self.enqueue_text(full_message, channel, description, mapping) {
            self.log_queued(&format!(
                "Relaying message from {} to radio broadcast",
                display_name
            ));
        }
    }

    fn enqueue_text(
        &self,
        message: String,
        channel: u32,
        description: String,
        mapping: Option<MappingInfo>,
    ) -> bool {
        let mesh = self.mesh.clone();
        let thunk: SendThunk = Box::new(move || {
            Box::pin(async move {
                let id = mesh.send_text(message, channel).await?;
                Ok(SendOutcome { mesh_id: Some(id) })
            })
        });
        let accepted = self.queue.enqueue(thunk, description, mapping);
        if !accepted {
            error!("Failed to relay message to Meshtastic");
        }
        accepted
    }

    fn mapping_info(&self, event: &MatrixIncoming, text: &str) -> Option<MappingInfo> {
        if !self.interactions.storage_enabled() || text.is_empty() {
            return None;
        }
        Some(MappingInfo {
            matrix_event_id: event.event_id.clone(),
            room_id: event.room_id.clone(),
            text: text.to_string(),
            meshnet: self.local_meshnet().to_string(),
            msgs_to_keep: self.msgs_to_keep,
        })
    }

    fn log_queued(&self, message: &str) {
        let queued = self.queue.len();
        if queued > 1 {
            info!("{} (queued: {} messages)", message, queued);
        } else {
            info!("{}", message);
        }
    }
}

/// Short display form for a remote sender: their shortname, a 3-char cut of
/// the longname, or `???`.
fn remote_shortname(shortname: &Option<String>, longname: &Option<String>) -> String {
    if let Some(short) = shortname {
        if !short.is_empty() {
            return short.clone();
        }
    }
    match longname {
        Some(long) if !long.is_empty() => long.chars().take(3).collect(),
        _ => "???".to_string(),
    }
}

/// Pull the emoji out of a relayed reaction emote body
/// (`"... reacted 👍 to \"...\""`).
fn extract_reaction_emoji(body: &str) -> String {
    let Some(start) = body.find("reacted ") else {
        return "?".to_string();
    };
    let after = &body[start + "reacted ".len()..];
    match after.rfind(" to") {
        Some(end) if end > 0 => after[..end].trim().to_string(),
        _ => "?".to_string(),
    }
}
