mod checkpoint;
mod convert;
mod directory;
mod records_file;
pub mod retry;
mod runner;
mod store;

pub use checkpoint::Checkpoints;
pub use convert::{ConversionResult, Converter, EncodedBatch, RecordFailure};
pub use directory::DirectoryMailbox;
pub use records_file::JsonRecordFile;
pub use runner::{CancelToken, SyncError, SyncReport, SyncRunner};
pub use store::{
    HeaderQuery, MailboxStore, RecordSink, RecordSource, RecordStoreError, StoreError,
};
