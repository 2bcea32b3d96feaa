//! Serde model of the Telegram wire format.
//!
//! Only the fields this channel consumes are modeled; everything else in an
//! update passes through untouched. Outbound requests serialize to exactly
//! the Bot API JSON payloads.

use serde::{Deserialize, Serialize, Serializer};

/// One provider update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TgUpdate {
    /// Monotonic provider update id.
    pub update_id: i64,
    /// A new message.
    #[serde(default)]
    pub message: Option<TgMessage>,
    /// An edit of an earlier message.
    #[serde(default)]
    pub edited_message: Option<TgMessage>,
    /// An inline-button press.
    #[serde(default)]
    pub callback_query: Option<TgCallbackQuery>,
}

/// Message sender.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TgUser {
    /// Numeric user id.
    pub id: i64,
    /// Whether the sender is a bot.
    #[serde(default)]
    pub is_bot: bool,
    /// Optional username.
    #[serde(default)]
    pub username: Option<String>,
    /// First name.
    #[serde(default)]
    pub first_name: Option<String>,
}

/// Chat container.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TgChat {
    /// Numeric chat id.
    pub id: i64,
}

/// One photo rendition.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TgPhotoSize {
    /// Provider file id.
    pub file_id: String,
    /// Size in bytes, when known.
    #[serde(default)]
    pub file_size: Option<i64>,
    /// Pixel width.
    #[serde(default)]
    pub width: i64,
    /// Pixel height.
    #[serde(default)]
    pub height: i64,
}

/// A document attachment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TgDocument {
    /// Provider file id.
    pub file_id: String,
    /// Original file name.
    #[serde(default)]
    pub file_name: Option<String>,
    /// Declared mime type.
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// A video attachment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TgVideo {
    /// Provider file id.
    pub file_id: String,
    /// Original file name.
    #[serde(default)]
    pub file_name: Option<String>,
    /// Declared mime type.
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// An audio attachment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TgAudio {
    /// Provider file id.
    pub file_id: String,
    /// Original file name.
    #[serde(default)]
    pub file_name: Option<String>,
    /// Declared mime type.
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// A voice note.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TgVoice {
    /// Provider file id.
    pub file_id: String,
    /// Declared mime type.
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// A message (new or edited).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TgMessage {
    /// Message id, unique per chat.
    pub message_id: i64,
    /// Unix seconds.
    #[serde(default)]
    pub date: Option<i64>,
    /// The chat it belongs to.
    #[serde(default)]
    pub chat: TgChat,
    /// Forum thread id, when threaded.
    #[serde(default)]
    pub message_thread_id: Option<i64>,
    /// Sender; absent for channel posts.
    #[serde(default)]
    pub from: Option<TgUser>,
    /// Text content.
    #[serde(default)]
    pub text: Option<String>,
    /// Caption of a media message.
    #[serde(default)]
    pub caption: Option<String>,
    /// Photo renditions, smallest first.
    #[serde(default)]
    pub photo: Option<Vec<TgPhotoSize>>,
    /// Document attachment.
    #[serde(default)]
    pub document: Option<TgDocument>,
    /// Video attachment.
    #[serde(default)]
    pub video: Option<TgVideo>,
    /// Audio attachment.
    #[serde(default)]
    pub audio: Option<TgAudio>,
    /// Voice note.
    #[serde(default)]
    pub voice: Option<TgVoice>,
}

/// An inline-button press.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TgCallbackQuery {
    /// Callback query id.
    pub id: String,
    /// Who pressed the button.
    #[serde(default)]
    pub from: Option<TgUser>,
    /// The signed callback token.
    #[serde(default)]
    pub data: Option<String>,
    /// The message the keyboard was attached to.
    #[serde(default)]
    pub message: Option<TgMessage>,
}

/// URI scheme for provider-hosted files.
pub const FILE_URI_PREFIX: &str = "telegram:file:";

/// Wrap a provider file id into the internal URI form.
#[must_use]
pub fn file_uri(file_id: &str) -> String {
    format!("{FILE_URI_PREFIX}{file_id}")
}

/// Unwrap an internal URI back into a Bot API payload: a bare file id for
/// `telegram:file:` URIs, the URI itself otherwise (http links pass through).
#[must_use]
pub fn media_payload_from_uri(uri: &str) -> String {
    uri.strip_prefix(FILE_URI_PREFIX).unwrap_or(uri).to_string()
}

/// Serialize a chat id as a JSON number when it is numeric. The Bot API
/// accepts integers for chats and strings only for `@username` channels.
fn chat_id<S: Serializer>(value: &str, serializer: S) -> Result<S::Ok, S::Error> {
    match value.parse::<i64>() {
        Ok(numeric) => serializer.serialize_i64(numeric),
        Err(_) => serializer.serialize_str(value),
    }
}

/// One inline keyboard button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineKeyboardButton {
    /// Button label.
    pub text: String,
    /// Signed callback token, ≤64 bytes.
    pub callback_data: String,
}

/// Inline keyboard layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineKeyboardMarkup {
    /// Button rows.
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

/// `sendMessage` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendMessage {
    /// Target chat.
    #[serde(serialize_with = "chat_id")]
    pub chat_id: String,
    /// Message text, ≤ the configured chunk limit.
    pub text: String,
    /// Inline keyboard, on approval messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_markup: Option<InlineKeyboardMarkup>,
    /// Forum thread.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_thread_id: Option<i64>,
}

/// `sendPhoto` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendPhoto {
    /// Target chat.
    #[serde(serialize_with = "chat_id")]
    pub chat_id: String,
    /// File id or URL.
    pub photo: String,
    /// Optional caption.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Forum thread.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_thread_id: Option<i64>,
}

/// `sendDocument` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendDocument {
    /// Target chat.
    #[serde(serialize_with = "chat_id")]
    pub chat_id: String,
    /// File id or URL.
    pub document: String,
    /// Optional caption.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Forum thread.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_thread_id: Option<i64>,
}

/// One outbound Bot API request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundRequest {
    /// `sendMessage`.
    SendMessage(SendMessage),
    /// `sendPhoto`.
    SendPhoto(SendPhoto),
    /// `sendDocument`.
    SendDocument(SendDocument),
}

impl OutboundRequest {
    /// The Bot API method name.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::SendMessage(_) => "sendMessage",
            Self::SendPhoto(_) => "sendPhoto",
            Self::SendDocument(_) => "sendDocument",
        }
    }
}
