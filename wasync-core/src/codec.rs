use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::headers::{self, HeaderMap};
use crate::message::{MessageFlags, WireMessage};
use crate::record::{
    CallDetails, CallKind, CommunicationRecord, DataType, MessageDetails, MessageKind,
    RecordDetails,
};

/// First instant (ms) past year 9999, which the `Date` header cannot render.
const MAX_TIMESTAMP_MS: i64 = 253_402_300_800_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// How the read state of a record maps onto the seen flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkAsReadPolicy {
    /// Follow the read state of the record itself.
    #[default]
    MessageStatus,
    Unread,
    Read,
}

impl MarkAsReadPolicy {
    pub fn seen(&self, read: bool) -> bool {
        match self {
            MarkAsReadPolicy::MessageStatus => read,
            MarkAsReadPolicy::Unread => false,
            MarkAsReadPolicy::Read => true,
        }
    }
}

impl FromStr for MarkAsReadPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "message_status" | "status" => Ok(MarkAsReadPolicy::MessageStatus),
            "unread" => Ok(MarkAsReadPolicy::Unread),
            "read" => Ok(MarkAsReadPolicy::Read),
            other => Err(format!("unknown mark-as-read policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnclassifiedReason {
    MissingDataType,
    UnknownDataType(String),
    MissingAddress,
    MissingDate,
}

impl fmt::Display for UnclassifiedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnclassifiedReason::MissingDataType => f.write_str("missing data type"),
            UnclassifiedReason::UnknownDataType(tag) => write!(f, "unknown data type {tag:?}"),
            UnclassifiedReason::MissingAddress => f.write_str("missing address"),
            UnclassifiedReason::MissingDate => f.write_str("missing date"),
        }
    }
}

/// A readable message whose record kind could not be determined.
/// Carries no kind-specific fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnclassifiedRecord {
    pub reason: UnclassifiedReason,
    pub message_id: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Record(CommunicationRecord),
    Unclassified(UnclassifiedRecord),
}

impl Decoded {
    pub fn address(&self) -> Option<&str> {
        match self {
            Decoded::Record(record) => Some(record.address.as_str()),
            Decoded::Unclassified(_) => None,
        }
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Decoded::Record(record) => Some(record.data_type()),
            Decoded::Unclassified(_) => None,
        }
    }

    pub fn into_record(self) -> Option<CommunicationRecord> {
        match self {
            Decoded::Record(record) => Some(record),
            Decoded::Unclassified(_) => None,
        }
    }

    pub fn is_unclassified(&self) -> bool {
        matches!(self, Decoded::Unclassified(_))
    }
}

/// Converts records to wire messages and back.
///
/// Encoding is deterministic apart from the backup-time header; the
/// message identifier depends only on the record, never on the version.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    user_email: String,
    reference_uid: String,
    mark_as_read: MarkAsReadPolicy,
}

impl MessageCodec {
    pub fn new(user_email: impl Into<String>) -> Self {
        let user_email = user_email.into();
        let digest = format!("{:x}", md5::compute(user_email.as_bytes()));
        Self {
            reference_uid: digest[..24].to_string(),
            user_email,
            mark_as_read: MarkAsReadPolicy::default(),
        }
    }

    pub fn with_reference_uid(mut self, reference_uid: impl Into<String>) -> Self {
        self.reference_uid = reference_uid.into();
        self
    }

    pub fn with_mark_as_read(mut self, policy: MarkAsReadPolicy) -> Self {
        self.mark_as_read = policy;
        self
    }

    pub fn mark_as_read(&self) -> MarkAsReadPolicy {
        self.mark_as_read
    }

    pub fn encode(&self, record: &CommunicationRecord, version: u64) -> Result<WireMessage, CodecError> {
        self.encode_at(record, version, SystemTime::now())
    }

    pub fn encode_at(
        &self,
        record: &CommunicationRecord,
        version: u64,
        backup_time: SystemTime,
    ) -> Result<WireMessage, CodecError> {
        validate(record)?;

        let address = record.address.trim();
        let data_type = record.data_type();
        let mut map = HeaderMap::new();

        map.insert(headers::SUBJECT, subject(data_type, address));
        let contact = contact_mailbox(address);
        if record.is_inbound() {
            map.insert(headers::FROM, contact);
            map.insert(headers::TO, self.user_email.clone());
        } else {
            map.insert(headers::FROM, self.user_email.clone());
            map.insert(headers::TO, contact);
        }
        map.insert(headers::DATE_STANDARD, httpdate::fmt_http_date(system_time(record.timestamp)));
        map.insert(headers::MIME_VERSION, "1.0");
        map.insert(headers::CONTENT_TYPE, "text/plain; charset=utf-8");
        map.insert(headers::CONTENT_TRANSFER_ENCODING, "8bit");
        map.insert(
            headers::REFERENCES,
            format!("<{}.{}@{}>", self.reference_uid, address, headers::LOCAL_DOMAIN),
        );
        map.insert(
            headers::MESSAGE_ID,
            format!("<{}@{}>", message_digest(record), headers::LOCAL_DOMAIN),
        );

        if let Some(id) = record.id {
            map.insert(headers::ID, id.to_string());
        }
        map.insert(headers::ADDRESS, address);
        map.insert(headers::DATATYPE, data_type.tag());
        map.insert(headers::TYPE, record.type_code().to_string());
        map.insert(headers::DATE, record.timestamp.to_string());
        map.insert(headers::BACKUP_TIME, httpdate::fmt_http_date(backup_time));
        map.insert(headers::VERSION, version.to_string());

        let read = match &record.details {
            RecordDetails::Sms(details) | RecordDetails::Mms(details) => {
                if let Some(thread_id) = details.thread_id {
                    map.insert(headers::THREAD_ID, thread_id.to_string());
                }
                map.insert(headers::READ, if details.read { "1" } else { "0" });
                if let Some(status) = details.status {
                    map.insert(headers::STATUS, status.to_string());
                }
                if let Some(protocol) = &details.protocol {
                    map.insert(headers::PROTOCOL, protocol.clone());
                }
                if let Some(service_center) = &details.service_center {
                    map.insert(headers::SERVICE_CENTER, service_center.clone());
                }
                details.read
            }
            RecordDetails::Call(details) => {
                if let Some(duration) = details.duration {
                    map.insert(headers::DURATION, duration.to_string());
                }
                !matches!(details.kind, CallKind::Missed)
            }
        };

        let mut message = WireMessage::new(map, record.body.clone());
        message.flags = MessageFlags {
            seen: self.mark_as_read.seen(read),
            flagged: false,
        };
        Ok(message)
    }

    /// Decodes one message. Unrecognised messages come back as
    /// [`Decoded::Unclassified`]; only empty input is an error.
    pub fn decode(&self, message: &WireMessage) -> Result<Decoded, CodecError> {
        if message.is_empty() {
            return Err(CodecError::MalformedInput(
                "message has no headers and no body".into(),
            ));
        }

        let unclassified = |reason: UnclassifiedReason| -> Result<Decoded, CodecError> {
            debug!(
                message_id = message.message_id().unwrap_or("-"),
                %reason,
                "message is unclassified"
            );
            Ok(Decoded::Unclassified(UnclassifiedRecord {
                reason,
                message_id: message.message_id().map(str::to_string),
                body: message.body.clone(),
            }))
        };

        let Some(tag) = non_empty(message.header(headers::DATATYPE)) else {
            return unclassified(UnclassifiedReason::MissingDataType);
        };
        let Some(data_type) = DataType::from_tag(tag) else {
            return unclassified(UnclassifiedReason::UnknownDataType(tag.to_string()));
        };
        let Some(address) = non_empty(message.header(headers::ADDRESS)) else {
            return unclassified(UnclassifiedReason::MissingAddress);
        };
        let Some(timestamp) = message.record_timestamp() else {
            return unclassified(UnclassifiedReason::MissingDate);
        };

        let type_code = parse_header::<i32>(message, headers::TYPE);
        let from_user = self.is_from_user(message);
        let details = match data_type {
            DataType::Sms | DataType::Mms => {
                let kind = match type_code {
                    Some(code) => MessageKind::from_code(code),
                    None if from_user => MessageKind::Sent,
                    None => MessageKind::Received,
                };
                let read = parse_header::<i64>(message, headers::READ).is_some_and(|value| value > 0);
                let details = MessageDetails {
                    kind,
                    read: self.mark_as_read.seen(read),
                    thread_id: parse_header(message, headers::THREAD_ID),
                    status: parse_header(message, headers::STATUS),
                    protocol: non_empty(message.header(headers::PROTOCOL)).map(str::to_string),
                    service_center: non_empty(message.header(headers::SERVICE_CENTER))
                        .map(str::to_string),
                };
                if data_type == DataType::Sms {
                    RecordDetails::Sms(details)
                } else {
                    RecordDetails::Mms(details)
                }
            }
            DataType::CallLog => {
                let kind = match type_code {
                    Some(code) => CallKind::from_code(code),
                    None if from_user => CallKind::Outgoing,
                    None => CallKind::Incoming,
                };
                RecordDetails::Call(CallDetails {
                    kind,
                    duration: parse_header(message, headers::DURATION),
                })
            }
        };

        Ok(Decoded::Record(CommunicationRecord {
            id: parse_header(message, headers::ID),
            address: address.to_string(),
            timestamp,
            body: message.body.clone(),
            details,
        }))
    }

    fn is_from_user(&self, message: &WireMessage) -> bool {
        message
            .header(headers::FROM)
            .is_some_and(|from| from.to_ascii_lowercase().contains(&self.user_email.to_ascii_lowercase()))
    }
}

/// Identifier shared by every encode of the same logical record.
pub fn message_digest(record: &CommunicationRecord) -> String {
    let thread = record
        .thread_id()
        .map(|thread_id| thread_id.to_string())
        .unwrap_or_default();
    let key = format!(
        "{}\u{0}{}\u{0}{}\u{0}{}\u{0}{}",
        record.data_type().tag(),
        thread,
        record.address.trim(),
        record.type_code(),
        record.timestamp
    );
    format!("{:x}", md5::compute(key.as_bytes()))
}

fn validate(record: &CommunicationRecord) -> Result<(), CodecError> {
    if record.address.trim().is_empty() {
        return Err(CodecError::InvalidRecord(format!(
            "{} record has no address",
            record.data_type()
        )));
    }
    if record.timestamp < 0 {
        return Err(CodecError::InvalidRecord(format!(
            "{} record has negative timestamp {}",
            record.data_type(),
            record.timestamp
        )));
    }
    if record.timestamp >= MAX_TIMESTAMP_MS {
        return Err(CodecError::InvalidRecord(format!(
            "{} record has timestamp {} beyond year 9999",
            record.data_type(),
            record.timestamp
        )));
    }
    if let Some(duration) = record.call_details().and_then(|details| details.duration)
        && duration < 0
    {
        return Err(CodecError::InvalidRecord(format!(
            "call record has negative duration {duration}"
        )));
    }
    Ok(())
}

fn subject(data_type: DataType, address: &str) -> String {
    match data_type {
        DataType::Sms => format!("SMS with {address}"),
        DataType::Mms => format!("MMS with {address}"),
        DataType::CallLog => format!("Call with {address}"),
    }
}

fn contact_mailbox(address: &str) -> String {
    let local: String = address.chars().filter(|c| !c.is_whitespace()).collect();
    format!("{address} <{local}@{}>", headers::UNKNOWN_DOMAIN)
}

fn system_time(timestamp_ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(timestamp_ms.max(0) as u64)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn parse_header<T: FromStr>(message: &WireMessage, name: &str) -> Option<T> {
    non_empty(message.header(name)).and_then(|value| value.parse().ok())
}
