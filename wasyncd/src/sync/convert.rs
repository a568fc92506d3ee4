use rayon::prelude::*;
use tracing::{debug, warn};
use wasync_core::{
    CodecError, CommunicationRecord, Decoded, MessageCodec, UnclassifiedRecord, WireMessage,
    message_digest,
};

use crate::config::SyncConfig;

/// A record or message that could not be converted. The rest of its batch
/// is unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    /// Position in the input batch.
    pub position: usize,
    /// Message identifier when one could be determined.
    pub identifier: Option<String>,
    pub error: CodecError,
}

#[derive(Debug, Default)]
pub struct EncodedBatch {
    pub messages: Vec<WireMessage>,
    pub highest_date: Option<i64>,
    pub failures: Vec<RecordFailure>,
    /// Records whose data type is not enabled.
    pub skipped: usize,
}

/// Outcome of decoding one batch of wire messages, in input order.
#[derive(Debug, Default)]
pub struct ConversionResult {
    pub records: Vec<CommunicationRecord>,
    pub highest_date: Option<i64>,
    pub unclassified: Vec<UnclassifiedRecord>,
    pub failures: Vec<RecordFailure>,
    pub skipped: usize,
}

impl ConversionResult {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.unclassified.is_empty() && self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Converter {
    codec: MessageCodec,
}

impl Converter {
    pub fn new(codec: MessageCodec) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    /// Encodes `records` in parallel. Message versions count up from
    /// `first_version` in input order.
    pub fn encode_batch(
        &self,
        records: &[CommunicationRecord],
        config: &SyncConfig,
        first_version: u64,
    ) -> EncodedBatch {
        let codec = self.codec.clone().with_mark_as_read(config.mark_as_read());
        let limit = config.filter().max_items_per_run.unwrap_or(usize::MAX);
        let outcomes: Vec<Option<Result<WireMessage, CodecError>>> = records
            .par_iter()
            .enumerate()
            .map(|(position, record)| {
                config
                    .includes(record.data_type())
                    .then(|| codec.encode(record, first_version + position as u64))
            })
            .collect();

        let mut batch = EncodedBatch::default();
        for (position, (record, outcome)) in records.iter().zip(outcomes).enumerate() {
            let Some(outcome) = outcome else {
                batch.skipped += 1;
                continue;
            };
            if batch.messages.len() + batch.failures.len() >= limit {
                break;
            }
            batch.highest_date = batch.highest_date.max(Some(record.timestamp));
            match outcome {
                Ok(message) => batch.messages.push(message),
                Err(error) => {
                    warn!(position, "record could not be encoded: {error}");
                    batch.failures.push(RecordFailure {
                        position,
                        identifier: Some(message_digest(record)),
                        error,
                    });
                }
            }
        }
        debug!(
            encoded = batch.messages.len(),
            failed = batch.failures.len(),
            skipped = batch.skipped,
            "batch encoded"
        );
        batch
    }

    /// Decodes `messages` in parallel, keeping input order. Records of
    /// disabled data types are skipped; per-message failures are collected.
    pub fn process_batch(&self, messages: &[WireMessage], config: &SyncConfig) -> ConversionResult {
        let codec = self.codec.clone().with_mark_as_read(config.mark_as_read());
        let limit = config.filter().max_items_per_run.unwrap_or(usize::MAX);
        let outcomes: Vec<Result<Decoded, CodecError>> =
            messages.par_iter().map(|message| codec.decode(message)).collect();

        let mut result = ConversionResult::default();
        for (position, (message, outcome)) in messages.iter().zip(outcomes).enumerate() {
            if let Ok(Decoded::Record(record)) = &outcome
                && !config.includes(record.data_type())
            {
                result.skipped += 1;
                continue;
            }
            if result.records.len() + result.unclassified.len() + result.failures.len() >= limit {
                break;
            }
            match outcome {
                Ok(Decoded::Record(record)) => {
                    result.highest_date = result.highest_date.max(Some(record.timestamp));
                    result.records.push(record);
                }
                Ok(Decoded::Unclassified(unclassified)) => result.unclassified.push(unclassified),
                Err(error) => {
                    warn!(position, "message could not be decoded: {error}");
                    result.failures.push(RecordFailure {
                        position,
                        identifier: message.message_id().map(str::to_string),
                        error,
                    });
                }
            }
        }
        debug!(
            decoded = result.records.len(),
            unclassified = result.unclassified.len(),
            failed = result.failures.len(),
            skipped = result.skipped,
            "batch decoded"
        );
        result
    }
}
