use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Record kind discriminant, written to the data-type header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Sms,
    Mms,
    #[serde(rename = "calllog")]
    CallLog,
}

impl DataType {
    pub const ALL: [DataType; 3] = [DataType::Sms, DataType::Mms, DataType::CallLog];

    /// Tag stored in the data-type header.
    pub fn tag(&self) -> &'static str {
        match self {
            DataType::Sms => "SMS",
            DataType::Mms => "MMS",
            DataType::CallLog => "CALLLOG",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.trim();
        DataType::ALL
            .into_iter()
            .find(|data_type| data_type.tag().eq_ignore_ascii_case(tag))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDataType(pub String);

impl fmt::Display for UnknownDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown data type: {}", self.0)
    }
}

impl std::error::Error for UnknownDataType {}

impl FromStr for DataType {
    type Err = UnknownDataType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sms" => Ok(DataType::Sms),
            "mms" => Ok(DataType::Mms),
            "calllog" | "call_log" | "call-log" => Ok(DataType::CallLog),
            other => Err(UnknownDataType(other.to_string())),
        }
    }
}

/// SMS/MMS box type as stored by the telephony provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Received,
    Sent,
    Draft,
    Outbox,
    Failed,
    Queued,
    Other(i32),
}

impl MessageKind {
    pub fn code(&self) -> i32 {
        match self {
            MessageKind::Received => 1,
            MessageKind::Sent => 2,
            MessageKind::Draft => 3,
            MessageKind::Outbox => 4,
            MessageKind::Failed => 5,
            MessageKind::Queued => 6,
            MessageKind::Other(code) => *code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => MessageKind::Received,
            2 => MessageKind::Sent,
            3 => MessageKind::Draft,
            4 => MessageKind::Outbox,
            5 => MessageKind::Failed,
            6 => MessageKind::Queued,
            other => MessageKind::Other(other),
        }
    }

    pub fn is_inbound(&self) -> bool {
        matches!(self, MessageKind::Received)
    }
}

/// Call-log entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Incoming,
    Outgoing,
    Missed,
    Voicemail,
    Rejected,
    Blocked,
    Other(i32),
}

impl CallKind {
    pub fn code(&self) -> i32 {
        match self {
            CallKind::Incoming => 1,
            CallKind::Outgoing => 2,
            CallKind::Missed => 3,
            CallKind::Voicemail => 4,
            CallKind::Rejected => 5,
            CallKind::Blocked => 6,
            CallKind::Other(code) => *code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => CallKind::Incoming,
            2 => CallKind::Outgoing,
            3 => CallKind::Missed,
            4 => CallKind::Voicemail,
            5 => CallKind::Rejected,
            6 => CallKind::Blocked,
            other => CallKind::Other(other),
        }
    }

    pub fn is_inbound(&self) -> bool {
        !matches!(self, CallKind::Outgoing)
    }

    fn label(&self) -> &'static str {
        match self {
            CallKind::Incoming => "incoming call",
            CallKind::Outgoing => "outgoing call",
            CallKind::Missed => "missed call",
            CallKind::Voicemail => "voicemail",
            CallKind::Rejected => "rejected call",
            CallKind::Blocked => "blocked call",
            CallKind::Other(_) => "call",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDetails {
    pub kind: MessageKind,
    pub read: bool,
    #[serde(default)]
    pub thread_id: Option<i64>,
    #[serde(default)]
    pub status: Option<i32>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub service_center: Option<String>,
}

impl MessageDetails {
    pub fn new(kind: MessageKind, read: bool) -> Self {
        Self {
            kind,
            read,
            thread_id: None,
            status: None,
            protocol: None,
            service_center: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDetails {
    pub kind: CallKind,
    #[serde(default)]
    pub duration: Option<i64>,
}

/// Kind-specific fields. Exactly one variant is populated per record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "data_type", rename_all = "lowercase")]
pub enum RecordDetails {
    Sms(MessageDetails),
    Mms(MessageDetails),
    #[serde(rename = "calllog")]
    Call(CallDetails),
}

impl RecordDetails {
    pub fn data_type(&self) -> DataType {
        match self {
            RecordDetails::Sms(_) => DataType::Sms,
            RecordDetails::Mms(_) => DataType::Mms,
            RecordDetails::Call(_) => DataType::CallLog,
        }
    }
}

/// One SMS, MMS or call-log entry from the device store.
///
/// `timestamp` is milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicationRecord {
    #[serde(default)]
    pub id: Option<i64>,
    pub address: String,
    pub timestamp: i64,
    #[serde(default)]
    pub body: String,
    #[serde(flatten)]
    pub details: RecordDetails,
}

impl CommunicationRecord {
    pub fn sms(
        address: impl Into<String>,
        timestamp: i64,
        body: impl Into<String>,
        details: MessageDetails,
    ) -> Self {
        Self {
            id: None,
            address: address.into(),
            timestamp,
            body: body.into(),
            details: RecordDetails::Sms(details),
        }
    }

    pub fn mms(
        address: impl Into<String>,
        timestamp: i64,
        body: impl Into<String>,
        details: MessageDetails,
    ) -> Self {
        Self {
            id: None,
            address: address.into(),
            timestamp,
            body: body.into(),
            details: RecordDetails::Mms(details),
        }
    }

    /// Builds a call-log record with a synthesized label as body.
    pub fn call(address: impl Into<String>, timestamp: i64, kind: CallKind, duration: Option<i64>) -> Self {
        let address = address.into();
        let body = call_label(&address, kind, duration);
        Self {
            id: None,
            address,
            timestamp,
            body,
            details: RecordDetails::Call(CallDetails { kind, duration }),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn data_type(&self) -> DataType {
        self.details.data_type()
    }

    pub fn message_details(&self) -> Option<&MessageDetails> {
        match &self.details {
            RecordDetails::Sms(details) | RecordDetails::Mms(details) => Some(details),
            RecordDetails::Call(_) => None,
        }
    }

    pub fn call_details(&self) -> Option<&CallDetails> {
        match &self.details {
            RecordDetails::Call(details) => Some(details),
            _ => None,
        }
    }

    pub fn thread_id(&self) -> Option<i64> {
        self.message_details().and_then(|details| details.thread_id)
    }

    /// Whether the record originates from the other party.
    pub fn is_inbound(&self) -> bool {
        match &self.details {
            RecordDetails::Sms(details) | RecordDetails::Mms(details) => details.kind.is_inbound(),
            RecordDetails::Call(details) => details.kind.is_inbound(),
        }
    }

    /// Numeric type code written to the type header.
    pub fn type_code(&self) -> i32 {
        match &self.details {
            RecordDetails::Sms(details) | RecordDetails::Mms(details) => details.kind.code(),
            RecordDetails::Call(details) => details.kind.code(),
        }
    }
}

fn call_label(address: &str, kind: CallKind, duration: Option<i64>) -> String {
    match duration {
        Some(seconds) if seconds > 0 && !matches!(kind, CallKind::Missed) => {
            format!("{address} ({}, {})", kind.label(), format_duration(seconds))
        }
        _ => format!("{address} ({})", kind.label()),
    }
}

fn format_duration(seconds: i64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}
