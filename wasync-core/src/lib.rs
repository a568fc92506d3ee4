mod codec;
pub mod headers;
mod message;
mod oauth;
mod record;

pub use codec::{
    CodecError, Decoded, MarkAsReadPolicy, MessageCodec, UnclassifiedReason, UnclassifiedRecord,
    message_digest,
};
pub use headers::HeaderMap;
pub use message::{MessageFlags, WireMessage};
pub use oauth::{Credential, ErrorClass, LegacyToken, OAuthClient, OAuthError, OAuthToken, now_unix};
pub use record::{
    CallDetails, CallKind, CommunicationRecord, DataType, MessageDetails, MessageKind,
    RecordDetails, UnknownDataType,
};
