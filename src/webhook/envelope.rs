//! Decoding of the XML envelope the platform POSTs for each message.
//!
//! ```xml
//! <xml>
//!   <ToUserName><![CDATA[gh_account]]></ToUserName>
//!   <FromUserName><![CDATA[o_user]]></FromUserName>
//!   <CreateTime>1348831860</CreateTime>
//!   <MsgType><![CDATA[text]]></MsgType>
//!   <Content><![CDATA[this is a test]]></Content>
//!   <MsgId>1234567890123456</MsgId>
//! </xml>
//! ```

use serde::Deserialize;

use crate::types::{InboundMessage, MessageType, UnknownMessageType};

/// Errors from envelope decoding.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Body is not well-formed XML or lacks a required element.
    #[error("invalid envelope: {0}")]
    Xml(#[from] quick_xml::DeError),

    /// `CreateTime` is not an integer.
    #[error("invalid CreateTime: {0:?}")]
    CreateTime(String),

    /// `MsgType` is not a message kind.
    #[error(transparent)]
    MessageType(#[from] UnknownMessageType),

    /// `MsgId` is empty.
    #[error("empty MsgId")]
    EmptyMessageId,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "ToUserName")]
    to_user_name: String,
    #[serde(rename = "FromUserName")]
    from_user_name: String,
    #[serde(rename = "CreateTime")]
    create_time: String,
    #[serde(rename = "MsgType")]
    msg_type: String,
    #[serde(rename = "Content", default)]
    content: Option<String>,
    #[serde(rename = "MsgId")]
    msg_id: String,
    #[serde(rename = "PicUrl", default)]
    pic_url: Option<String>,
    #[serde(rename = "MediaId", default)]
    media_id: Option<String>,
}

/// Decode a POST body into an [`InboundMessage`].
///
/// # Errors
///
/// Returns [`EnvelopeError`] when the body is not a message envelope.
pub fn decode_message(body: &str) -> Result<InboundMessage, EnvelopeError> {
    let envelope: Envelope = quick_xml::de::from_str(body)?;

    let created_at = envelope
        .create_time
        .trim()
        .parse::<i64>()
        .map_err(|_| EnvelopeError::CreateTime(envelope.create_time.clone()))?;
    let msg_type = envelope.msg_type.trim().parse::<MessageType>()?;
    let message_id = envelope.msg_id.trim().to_owned();
    if message_id.is_empty() {
        return Err(EnvelopeError::EmptyMessageId);
    }

    Ok(InboundMessage {
        recipient_id: envelope.to_user_name,
        sender_id: envelope.from_user_name,
        created_at,
        msg_type,
        content: envelope.content.unwrap_or_default(),
        message_id,
        pic_url: envelope.pic_url.filter(|s| !s.is_empty()),
        media_id: envelope.media_id.filter(|s| !s.is_empty()),
    })
}
