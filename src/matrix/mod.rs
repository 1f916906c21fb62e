//! # Matrix Session Module
//!
//! Authenticated Matrix client-server session: access-token auth (credentials
//! file preferred, legacy inline config as fallback), optional E2EE through
//! the sdk's sqlite state/crypto store, room joining with alias resolution,
//! the sync loop, and raw event emission carrying the relay's custom
//! `meshtastic_*` fields.
//!
//! Incoming events are filtered here (older than bot start, sent by the bot
//! itself, or flagged with `mmrelay_suppress`) and handed to the translator
//! as parsed [`MatrixIncoming`] values over a bounded channel, so the
//! translator never touches sdk types and per-room ordering follows sync
//! order.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Duration};

use matrix_sdk::{
    authentication::matrix::MatrixSession,
    config::SyncSettings,
    event_handler::{Ctx, RawEvent},
    ruma::{
        events::reaction::OriginalSyncReactionEvent,
        events::room::message::{MessageType, OriginalSyncRoomMessageEvent},
        OwnedRoomId, OwnedUserId, RoomAliasId, RoomId, UserId,
    },
    Client, Room, SessionMeta, SessionTokens,
};

use crate::config::{Config, RoomMapping};

/// Timeout for a single room send.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for the initial full-state sync.
const INITIAL_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
/// Pause before retrying a failed incremental sync.
const SYNC_RETRY_PAUSE: Duration = Duration::from_secs(5);
/// Capacity of the incoming-event channel handed to the translator.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Credentials file written by the login tool. Preferred over inline config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub homeserver: String,
    pub user_id: String,
    pub access_token: String,
    pub device_id: Option<String>,
}

impl Credentials {
    /// Platform path of the credentials file.
    pub fn default_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("mmrelay").join("credentials.json")
    }

    /// Load from the platform path, falling back to the working directory.
    pub fn load() -> Option<Self> {
        for path in [Self::default_path(), PathBuf::from("credentials.json")] {
            if let Ok(raw) = std::fs::read_to_string(&path) {
                match serde_json::from_str::<Credentials>(&raw) {
                    Ok(creds) => {
                        info!("Using credentials file {}", path.display());
                        return Some(creds);
                    }
                    Err(e) => warn!("Ignoring malformed credentials file {}: {}", path.display(), e),
                }
            }
        }
        None
    }
}

/// Classified incoming room event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatrixEventKind {
    Text,
    Notice,
    Emote,
    Reaction { key: String },
}

/// Custom relay fields carried in event content.
#[derive(Debug, Clone, Default)]
pub struct MeshtasticFields {
    pub longname: Option<String>,
    pub shortname: Option<String>,
    pub meshnet: Option<String>,
    pub reply_id: Option<u32>,
    pub portnum: Option<String>,
    pub text: Option<String>,
    pub emoji: bool,
    pub suppress: bool,
}

impl MeshtasticFields {
    /// Extract the `meshtastic_*` custom fields from raw event content.
    pub fn from_content(content: &Value) -> Self {
        Self {
            longname: content
                .get("meshtastic_longname")
                .and_then(Value::as_str)
                .map(str::to_string),
            shortname: content
                .get("meshtastic_shortname")
                .and_then(Value::as_str)
                .map(str::to_string),
            meshnet: content
                .get("meshtastic_meshnet")
                .and_then(Value::as_str)
                .map(str::to_string),
            reply_id: content.get("meshtastic_replyId").and_then(Value::as_u64).map(|v| v as u32),
            portnum: content
                .get("meshtastic_portnum")
                .and_then(Value::as_str)
                .map(str::to_string),
            text: content
                .get("meshtastic_text")
                .and_then(Value::as_str)
                .map(str::to_string),
            emoji: content.get("meshtastic_emoji").and_then(Value::as_u64) == Some(1),
            suppress: content
                .get("mmrelay_suppress")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

/// One event from sync, parsed at the session boundary.
#[derive(Debug, Clone)]
pub struct MatrixIncoming {
    pub room_id: String,
    pub event_id: String,
    pub sender: String,
    pub body: String,
    pub formatted_body: Option<String>,
    pub kind: MatrixEventKind,
    /// Target of an `m.in_reply_to` relation.
    pub reply_to_event_id: Option<String>,
    /// Target of an annotation (reaction) relation.
    pub reacts_to_event_id: Option<String>,
    pub meshtastic: MeshtasticFields,
}

/// Narrow emission/lookup surface the translators depend on. The live
/// session implements it; tests substitute a recorder.
#[async_trait]
pub trait MatrixPort: Send + Sync {
    /// Send raw `m.room.message` content, returning the new event id.
    async fn send_event(&self, room_id: &str, content: Value) -> Result<String>;
    /// Room-scoped display name, then global profile, then the bare user id.
    async fn display_name(&self, room_id: &str, user_id: &str) -> String;
    fn bot_user_id(&self) -> String;
    fn bot_display_name(&self) -> String;
}

struct HandlerContext {
    tx: mpsc::Sender<MatrixIncoming>,
    bot_user_id: OwnedUserId,
    bot_start_time_ms: u64,
}

/// The relay's Matrix session.
pub struct MatrixClient {
    client: Client,
    bot_user_id: OwnedUserId,
    bot_display_name: String,
    rooms: Arc<RwLock<Vec<RoomMapping>>>,
}

impl MatrixClient {
    /// Authenticate against the homeserver and build the session.
    ///
    /// The credentials file wins when present; otherwise the legacy inline
    /// `matrix.access_token` / `matrix.bot_user_id` keys are used and the
    /// device id is learned through `whoami`. A missing device id leaves
    /// E2EE sends disabled but unencrypted rooms fully functional.
    pub async fn connect(config: &Config) -> Result<Self> {
        let credentials = Credentials::load();
        let (homeserver, user_id, access_token, device_id) = match &credentials {
            Some(creds) => (
                creds.homeserver.clone(),
                creds.user_id.clone(),
                creds.access_token.clone(),
                creds.device_id.clone(),
            ),
            None => {
                let token = config
                    .matrix
                    .access_token
                    .clone()
                    .context("matrix.access_token missing and no credentials file found")?;
                let user = config
                    .matrix
                    .bot_user_id
                    .clone()
                    .context("matrix.bot_user_id missing and no credentials file found")?;
                (config.matrix.homeserver.clone(), user, token, None)
            }
        };

        let bot_user_id = UserId::parse(&user_id)
            .map_err(|e| anyhow!("invalid bot user id {}: {}", user_id, e))?;

        let e2ee_enabled = config.matrix.e2ee.enabled;
        let store_path = config.e2ee_store_path();

        let mut device_id = device_id;
        let mut client = Self::build_client(
            &homeserver,
            &bot_user_id,
            &access_token,
            device_id.as_deref(),
            e2ee_enabled,
            &store_path,
        )
        .await?;

        if device_id.is_none() {
            // Legacy inline auth carries no device id; whoami recovers the
            // one the homeserver associates with the token.
            match client.whoami().await {
                Ok(response) => match response.device_id {
                    Some(real_device) => {
                        debug!("Retrieved device_id: {}", real_device);
                        device_id = Some(real_device.to_string());
                        client = Self::build_client(
                            &homeserver,
                            &bot_user_id,
                            &access_token,
                            device_id.as_deref(),
                            e2ee_enabled,
                            &store_path,
                        )
                        .await?;
                    }
                    None => warn!("device_id not returned by whoami(); E2EE sends disabled"),
                },
                Err(e) => {
                    error!("Failed to retrieve device_id: {}", e);
                }
            }
        }

        let bot_display_name = match client.account().get_display_name().await {
            Ok(Some(name)) => name,
            _ => bot_user_id.to_string(),
        };
        info!("Connected to Matrix as {} ({})", bot_display_name, bot_user_id);

        Ok(Self {
            client,
            bot_user_id,
            bot_display_name,
            rooms: Arc::new(RwLock::new(config.matrix_rooms.clone())),
        })
    }

    async fn build_client(
        homeserver: &str,
        user_id: &OwnedUserId,
        access_token: &str,
        device_id: Option<&str>,
        e2ee_enabled: bool,
        store_path: &str,
    ) -> Result<Client> {
        let mut builder = Client::builder().homeserver_url(homeserver);
        if e2ee_enabled {
            std::fs::create_dir_all(store_path)
                .with_context(|| format!("failed to create crypto store dir {}", store_path))?;
            builder = builder.sqlite_store(store_path, None);
        }
        let client = builder.build().await.context("failed to build Matrix client")?;

        // Without a known device id fall back to a fixed name; encrypted
        // rooms will refuse such a session but plaintext rooms still work.
        let device = device_id.unwrap_or("MMRELAY");
        let session = MatrixSession {
            meta: SessionMeta { user_id: user_id.clone(), device_id: device.into() },
            tokens: SessionTokens {
                access_token: access_token.to_string(),
                refresh_token: None,
            },
        };
        client
            .restore_session(session)
            .await
            .context("failed to restore Matrix session")?;
        Ok(client)
    }

    /// Join every configured room, resolving `#aliases` to ids in place.
    pub async fn join_rooms(&self) -> Result<()> {
        let mappings = self.rooms.read().map(|r| r.clone()).unwrap_or_default();
        for mapping in mappings {
            let room_id = if mapping.id.starts_with('#') {
                let alias = match RoomAliasId::parse(&mapping.id) {
                    Ok(alias) => alias,
                    Err(e) => {
                        error!("Invalid room alias '{}': {}", mapping.id, e);
                        continue;
                    }
                };
                match self.client.resolve_room_alias(&alias).await {
                    Ok(response) => {
                        let resolved = response.room_id;
                        if let Ok(mut rooms) = self.rooms.write() {
                            for entry in rooms.iter_mut() {
                                if entry.id == mapping.id {
                                    entry.id = resolved.to_string();
                                }
                            }
                        }
                        resolved
                    }
                    Err(e) => {
                        error!("Failed to resolve room alias '{}': {}", mapping.id, e);
                        continue;
                    }
                }
            } else {
                match OwnedRoomId::try_from(mapping.id.clone()) {
                    Ok(id) => id,
                    Err(e) => {
                        error!("Invalid room id '{}': {}", mapping.id, e);
                        continue;
                    }
                }
            };

            if self.client.get_room(&room_id).is_none() {
                match self.client.join_room_by_id(&room_id).await {
                    Ok(_) => info!("Joined room '{}' successfully", room_id),
                    Err(e) => error!("Failed to join room '{}': {}", room_id, e),
                }
            } else {
                debug!("Bot is already in room '{}'", room_id);
            }
        }
        Ok(())
    }

    /// Room mapping as currently resolved (aliases replaced with ids).
    pub fn room_mappings(&self) -> Vec<RoomMapping> {
        self.rooms.read().map(|r| r.clone()).unwrap_or_default()
    }

    /// Register event handlers and run the sync loop until shutdown.
    ///
    /// Performs one full-state sync first so room encryption state and
    /// device lists exist before any send, then follows the incremental
    /// stream. Returns the receiver of parsed incoming events.
    pub fn start_sync(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<MatrixIncoming>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let context = Arc::new(HandlerContext {
            tx,
            bot_user_id: self.bot_user_id.clone(),
            bot_start_time_ms: chrono::Utc::now().timestamp_millis() as u64,
        });
        self.client.add_event_handler_context(context);
        self.client.add_event_handler(on_room_message);
        self.client.add_event_handler(on_reaction);

        let client = self.client.clone();
        let task = tokio::spawn(async move {
            let initial = SyncSettings::default()
                .full_state(true)
                .timeout(INITIAL_SYNC_TIMEOUT);
            let mut token = match timeout(INITIAL_SYNC_TIMEOUT, client.sync_once(initial)).await {
                Ok(Ok(response)) => Some(response.next_batch),
                Ok(Err(e)) => {
                    error!("Initial Matrix sync failed: {}", e);
                    None
                }
                Err(_) => {
                    error!("Initial Matrix sync timed out");
                    None
                }
            };
            info!("Matrix sync loop started");

            loop {
                if *shutdown.borrow() {
                    break;
                }
                let mut settings = SyncSettings::default();
                if let Some(batch) = &token {
                    settings = settings.token(batch.clone());
                }
                tokio::select! {
                    result = client.sync_once(settings) => match result {
                        Ok(response) => token = Some(response.next_batch),
                        Err(e) => {
                            error!("Matrix sync error: {}. Retrying...", e);
                            sleep(SYNC_RETRY_PAUSE).await;
                        }
                    },
                    _ = shutdown.changed() => {}
                }
            }
            debug!("Matrix sync loop terminated");
        });
        (rx, task)
    }
}

#[async_trait]
impl MatrixPort for MatrixClient {
    async fn send_event(&self, room_id: &str, content: Value) -> Result<String> {
        let room_id = RoomId::parse(room_id)
            .map_err(|e| anyhow!("invalid room id {}: {}", room_id, e))?;
        let room = self
            .client
            .get_room(&room_id)
            .ok_or_else(|| anyhow!("room {} not joined", room_id))?;
        let send = async { room.send_raw("m.room.message", content).await };
        let response = timeout(SEND_TIMEOUT, send)
            .await
            .map_err(|_| anyhow!("timeout sending message to Matrix room {}", room_id))?
            .with_context(|| format!("error sending message to Matrix room {}", room_id))?;
        Ok(response.event_id.to_string())
    }

    async fn display_name(&self, room_id: &str, user_id: &str) -> String {
        let Ok(user) = UserId::parse(user_id) else {
            return user_id.to_string();
        };
        if let Ok(room_id) = RoomId::parse(room_id) {
            if let Some(room) = self.client.get_room(&room_id) {
                if let Ok(Some(member)) = room.get_member(&user).await {
                    if let Some(name) = member.display_name() {
                        return name.to_string();
                    }
                }
            }
        }
        if let Ok(response) = self.client.account().fetch_user_profile_of(&user).await {
            if let Some(name) = response.displayname {
                return name;
            }
        }
        user_id.to_string()
    }

    fn bot_user_id(&self) -> String {
        self.bot_user_id.to_string()
    }

    fn bot_display_name(&self) -> String {
        self.bot_display_name.clone()
    }
}

async fn on_room_message(
    event: OriginalSyncRoomMessageEvent,
    raw: RawEvent,
    room: Room,
    Ctx(ctx): Ctx<Arc<HandlerContext>>,
) {
    let kind = match &event.content.msgtype {
        MessageType::Text(_) => MatrixEventKind::Text,
        MessageType::Notice(_) => MatrixEventKind::Notice,
        MessageType::Emote(_) => MatrixEventKind::Emote,
        _ => return,
    };

    if u64::from(event.origin_server_ts.0) < ctx.bot_start_time_ms {
        return;
    }
    if event.sender == ctx.bot_user_id {
        return;
    }

    // Re-parse the raw event so custom content fields survive.
    let raw_value: Value = match serde_json::from_str(raw.0.get()) {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to parse raw room event: {}", e);
            return;
        }
    };
    let content = raw_value.get("content").cloned().unwrap_or(Value::Null);
    let meshtastic = MeshtasticFields::from_content(&content);
    if meshtastic.suppress {
        return;
    }

    let reply_to_event_id = content
        .get("m.relates_to")
        .and_then(|r| r.get("m.in_reply_to"))
        .and_then(|r| r.get("event_id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let formatted_body = content
        .get("formatted_body")
        .and_then(Value::as_str)
        .map(str::to_string);

    let incoming = MatrixIncoming {
        room_id: room.room_id().to_string(),
        event_id: event.event_id.to_string(),
        sender: event.sender.to_string(),
        body: event.content.body().to_string(),
        formatted_body,
        kind,
        reply_to_event_id,
        reacts_to_event_id: None,
        meshtastic,
    };
    if ctx.tx.send(incoming).await.is_err() {
        debug!("Incoming event channel closed; dropping Matrix event");
    }
}

async fn on_reaction(
    event: OriginalSyncReactionEvent,
    room: Room,
    Ctx(ctx): Ctx<Arc<HandlerContext>>,
) {
    if u64::from(event.origin_server_ts.0) < ctx.bot_start_time_ms {
        return;
    }
    if event.sender == ctx.bot_user_id {
        return;
    }

    let relates = &event.content.relates_to;
    let incoming = MatrixIncoming {
        room_id: room.room_id().to_string(),
        event_id: event.event_id.to_string(),
        sender: event.sender.to_string(),
        body: String::new(),
        formatted_body: None,
        kind: MatrixEventKind::Reaction { key: relates.key.clone() },
        reply_to_event_id: None,
        reacts_to_event_id: Some(relates.event_id.to_string()),
        meshtastic: MeshtasticFields::default(),
    };
    if ctx.tx.send(incoming).await.is_err() {
        debug!("Incoming event channel closed; dropping reaction event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_custom_fields() {
        let content = json!({
            "msgtype": "m.text",
            "body": "[Alice/M1]: hi",
            "meshtastic_longname": "Alice",
            "meshtastic_shortname": "Al",
            "meshtastic_meshnet": "M1",
            "meshtastic_portnum": "TEXT_MESSAGE_APP",
            "meshtastic_id": 42,
            "meshtastic_text": "hi",
        });
        let fields = MeshtasticFields::from_content(&content);
        assert_eq!(fields.longname.as_deref(), Some("Alice"));
        assert_eq!(fields.shortname.as_deref(), Some("Al"));
        assert_eq!(fields.meshnet.as_deref(), Some("M1"));
        assert_eq!(fields.portnum.as_deref(), Some("TEXT_MESSAGE_APP"));
        assert!(!fields.emoji);
        assert!(!fields.suppress);
    }

    #[test]
    fn suppress_and_emoji_flags() {
        let content = json!({
            "mmrelay_suppress": true,
            "meshtastic_emoji": 1,
            "meshtastic_replyId": 42,
        });
        let fields = MeshtasticFields::from_content(&content);
        assert!(fields.suppress);
        assert!(fields.emoji);
        assert_eq!(fields.reply_id, Some(42));
    }

    #[test]
    fn missing_fields_default() {
        let fields = MeshtasticFields::from_content(&json!({"body": "plain"}));
        assert!(fields.longname.is_none());
        assert!(fields.meshnet.is_none());
        assert!(!fields.suppress);
    }
}
