//! Payload types shared by the webhook, the store, and host integrations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of an inbound Official Account message (`MsgType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Plain text.
    Text,
    /// Picture, delivered with `PicUrl` and `MediaId`.
    Image,
    /// Voice clip.
    Voice,
    /// Video.
    Video,
    /// Short video.
    ShortVideo,
    /// Shared location.
    Location,
    /// Shared link.
    Link,
}

impl MessageType {
    /// Returns the wire representation used by the platform.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Voice => "voice",
            Self::Video => "video",
            Self::ShortVideo => "shortvideo",
            Self::Location => "location",
            Self::Link => "link",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a `MsgType` value is not a known message kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type: {0:?}")]
pub struct UnknownMessageType(pub String);

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "voice" => Ok(Self::Voice),
            "video" => Ok(Self::Video),
            "shortvideo" => Ok(Self::ShortVideo),
            "location" => Ok(Self::Location),
            "link" => Ok(Self::Link),
            other => Err(UnknownMessageType(other.to_owned())),
        }
    }
}

/// A message pushed to the webhook by the platform.
///
/// Immutable once decoded. Stored under its `message_id`; re-delivery of
/// the same message overwrites the record with identical content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Official Account that received the message (`ToUserName`).
    pub recipient_id: String,
    /// `openid` of the sending user (`FromUserName`).
    pub sender_id: String,
    /// Unix timestamp in seconds (`CreateTime`).
    pub created_at: i64,
    /// Message kind (`MsgType`).
    pub msg_type: MessageType,
    /// Text body. Empty for kinds that carry no text.
    pub content: String,
    /// Platform message identifier (`MsgId`).
    pub message_id: String,
    /// Picture URL for image messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pic_url: Option<String>,
    /// Media identifier for image, voice and video messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
}

/// Contact attributes as returned by the platform's user-info API.
///
/// Keyed by `openid`. Arrives from an external contact-sync path; the
/// adapter only stores and returns it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactRecord {
    /// 1 when the user follows the account, 0 otherwise.
    pub subscribe: u8,
    /// Per-account user identifier.
    pub openid: String,
    /// Display name.
    pub nickname: String,
    /// 0 unknown, 1 male, 2 female.
    pub sex: u8,
    /// Locale such as `zh_CN`, `zh_TW` or `en`.
    pub language: String,
    /// City.
    pub city: String,
    /// Province.
    pub province: String,
    /// Country.
    pub country: String,
    /// Avatar URL.
    pub headimgurl: String,
    /// Unix timestamp of the latest subscription.
    pub subscribe_time: i64,
    /// Cross-application identifier, when the account is bound to an open platform.
    pub unionid: String,
    /// Operator-assigned remark.
    pub remark: String,
    /// Legacy group id.
    pub groupid: i64,
    /// Tag ids assigned to the user.
    pub tagid_list: Vec<i64>,
    /// How the user subscribed (e.g. `ADD_SCENE_QR_CODE`).
    pub subscribe_scene: String,
    /// Numeric QR scene value.
    pub qr_scene: i64,
    /// String QR scene value.
    pub qr_scene_str: String,
}
