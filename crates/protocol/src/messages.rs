use serde::{Deserialize, Deserializer, Serialize};

/// Messages the client sends over the signaling socket (and, for
/// screenshot requests, optionally over the control data channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Ask the server for ICE servers and related peer configuration
    RequestRtcConfiguration { session_id: String },
    /// WebRTC SDP offer
    Offer { sdp: String, session_id: String },
    /// Local ICE candidate
    Candidate {
        candidate: String,
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
        session_id: String,
    },
    /// Prompt the device to emit a video frame now
    RequestFrame { session_id: String },
    /// Open a URL on the device
    OpenUrl { url: String, session_id: String },
    /// Prevent idle-timeout disconnects
    KeepAlive { session_id: String },
    /// Screenshot request, correlated by `id`
    Screenshot { id: String },
}

/// Messages the server sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    RtcConfiguration { rtc_configuration: RtcConfiguration },
    Answer {
        sdp: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    Candidate {
        candidate: String,
        #[serde(default)]
        sdp_mid: Option<String>,
        #[serde(default, rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Successful screenshot: PNG as a `data:image/png;base64,...` URI
    Screenshot { id: String, data_uri: String },
    ScreenshotError { id: String, message: String },
}

impl ServerMessage {
    /// `type` discriminants this client understands.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "rtcConfiguration",
        "answer",
        "candidate",
        "screenshot",
        "screenshotError",
    ];

    /// Parse a text frame. Unknown `type` values are reported separately from
    /// malformed frames so callers can log and skip them.
    pub fn parse(text: &str) -> Result<Inbound, MessageError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| MessageError::InvalidJson(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(MessageError::MissingType)?
            .to_string();
        if !Self::KNOWN_TYPES.contains(&kind.as_str()) {
            return Ok(Inbound::Unknown(kind));
        }
        serde_json::from_value(value)
            .map(Inbound::Message)
            .map_err(|e| MessageError::Malformed {
                kind,
                reason: e.to_string(),
            })
    }
}

/// Result of parsing one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ServerMessage),
    Unknown(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("message has no string `type` field")]
    MissingType,
    #[error("malformed `{kind}` message: {reason}")]
    Malformed { kind: String, reason: String },
}

/// Peer configuration in the browser `RTCConfiguration` shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcConfiguration {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    /// "all" or "relay"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_transport_policy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    /// Accepts either a single URL string or a list, as browsers do.
    #[serde(deserialize_with = "string_or_vec")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

fn string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// An ICE candidate in transport-neutral form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn into_message(self, session_id: &str) -> ClientMessage {
        ClientMessage::Candidate {
            candidate: self.candidate,
            sdp_mid: self.sdp_mid,
            sdp_mline_index: self.sdp_mline_index,
            session_id: session_id.to_string(),
        }
    }
}
