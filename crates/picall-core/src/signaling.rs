//! Call signaling payloads carried as room events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::PicallError;
use crate::events::TimelineEvent;

/// Version tag put on outbound calls.
pub const PROTOCOL_VERSION: &str = "1";

/// Invite lifetime advertised to the callee.
pub const INVITE_LIFETIME_MS: u64 = 60_000;

/// Hangup reason a callee's client sends when an invite went unanswered.
pub const REASON_INVITE_TIMEOUT: &str = "invite_timeout";

/// Peers send the version either as a string or as an integer; whatever
/// arrives is echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallVersion {
    Number(u64),
    Text(String),
}

impl Default for CallVersion {
    fn default() -> Self {
        CallVersion::Text(PROTOCOL_VERSION.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".into(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".into(),
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInvite {
    pub call_id: String,
    #[serde(default)]
    pub version: CallVersion,
    pub lifetime: u64,
    pub offer: SessionDescription,
}

impl CallInvite {
    /// An invite is expired once its age exceeds the lifetime it advertised.
    pub fn is_expired(&self, age_ms: Option<u64>) -> bool {
        age_ms.is_some_and(|age| age > self.lifetime)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAnswer {
    pub call_id: String,
    #[serde(default)]
    pub version: CallVersion,
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHangup {
    pub call_id: String,
    #[serde(default)]
    pub version: CallVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u32>,
}

impl Candidate {
    /// Candidate line as sent on the wire, always with the `candidate:` prefix.
    pub fn new(line: &str, sdp_mid: Option<String>, sdp_mline_index: Option<u32>) -> Self {
        let line = line.trim();
        let candidate = if line.starts_with("candidate:") {
            line.to_string()
        } else {
            format!("candidate:{line}")
        };
        Self {
            candidate,
            sdp_mid,
            sdp_mline_index,
        }
    }

    /// The media identifier, if the candidate carries a usable one.
    pub fn media_id(&self) -> Option<&str> {
        self.sdp_mid.as_deref().filter(|mid| !mid.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallCandidates {
    pub call_id: String,
    #[serde(default)]
    pub version: CallVersion,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Invite,
    Answer,
    Hangup,
    Candidates,
}

impl SignalKind {
    pub const ALL: [SignalKind; 4] = [
        SignalKind::Invite,
        SignalKind::Answer,
        SignalKind::Hangup,
        SignalKind::Candidates,
    ];

    pub fn event_type(self) -> &'static str {
        match self {
            SignalKind::Invite => "m.call.invite",
            SignalKind::Answer => "m.call.answer",
            SignalKind::Hangup => "m.call.hangup",
            SignalKind::Candidates => "m.call.candidates",
        }
    }

    pub fn from_event_type(event_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.event_type() == event_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Invite(CallInvite),
    Answer(CallAnswer),
    Hangup(CallHangup),
    Candidates(CallCandidates),
}

impl Signal {
    pub fn invite(call_id: &str, lifetime: u64) -> Self {
        Signal::Invite(CallInvite {
            call_id: call_id.to_string(),
            version: CallVersion::default(),
            lifetime,
            offer: SessionDescription::offer(""),
        })
    }

    pub fn answer(call_id: &str, version: CallVersion) -> Self {
        Signal::Answer(CallAnswer {
            call_id: call_id.to_string(),
            version,
            answer: SessionDescription::answer(""),
        })
    }

    pub fn hangup(call_id: &str, version: CallVersion) -> Self {
        Signal::Hangup(CallHangup {
            call_id: call_id.to_string(),
            version,
            reason: None,
        })
    }

    /// A candidates message carrying exactly one candidate.
    pub fn candidate(call_id: &str, version: CallVersion, candidate: Candidate) -> Self {
        Signal::Candidates(CallCandidates {
            call_id: call_id.to_string(),
            version,
            candidates: vec![candidate],
        })
    }

    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Invite(_) => SignalKind::Invite,
            Signal::Answer(_) => SignalKind::Answer,
            Signal::Hangup(_) => SignalKind::Hangup,
            Signal::Candidates(_) => SignalKind::Candidates,
        }
    }

    pub fn call_id(&self) -> &str {
        match self {
            Signal::Invite(s) => &s.call_id,
            Signal::Answer(s) => &s.call_id,
            Signal::Hangup(s) => &s.call_id,
            Signal::Candidates(s) => &s.call_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind().event_type()
    }

    pub fn to_content(&self) -> Result<Value, PicallError> {
        let value = match self {
            Signal::Invite(s) => serde_json::to_value(s),
            Signal::Answer(s) => serde_json::to_value(s),
            Signal::Hangup(s) => serde_json::to_value(s),
            Signal::Candidates(s) => serde_json::to_value(s),
        };
        value.map_err(|e| PicallError::Signaling(format!("encode {}: {e}", self.event_type())))
    }

    fn from_content(kind: SignalKind, content: Value) -> Result<Self, PicallError> {
        let decoded = match kind {
            SignalKind::Invite => serde_json::from_value(content).map(Signal::Invite),
            SignalKind::Answer => serde_json::from_value(content).map(Signal::Answer),
            SignalKind::Hangup => serde_json::from_value(content).map(Signal::Hangup),
            SignalKind::Candidates => serde_json::from_value(content).map(Signal::Candidates),
        };
        decoded.map_err(|e| PicallError::Signaling(format!("decode {}: {e}", kind.event_type())))
    }
}

/// A signaling message received in a room.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSignal {
    pub room_id: String,
    pub sender: String,
    pub age_ms: Option<u64>,
    pub signal: Signal,
}

impl InboundSignal {
    /// `Ok(None)` for events that are not call signaling.
    pub fn from_event(event: &TimelineEvent) -> Result<Option<Self>, PicallError> {
        let Some(kind) = SignalKind::from_event_type(&event.event_type) else {
            return Ok(None);
        };
        let signal = Signal::from_content(kind, event.content.clone())?;
        Ok(Some(Self {
            room_id: event.room_id.clone(),
            sender: event.sender.clone(),
            age_ms: event.age_ms,
            signal,
        }))
    }
}
