use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use wasync_core::DataType;

use super::store::RecordStoreError;

/// Highest committed record timestamp per data type, in ms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoints(BTreeMap<DataType, i64>);

impl Checkpoints {
    pub fn get(&self, data_type: DataType) -> Option<i64> {
        self.0.get(&data_type).copied()
    }

    /// Moves the checkpoint forward. Never moves it back.
    pub fn advance(&mut self, data_type: DataType, timestamp: i64) {
        let entry = self.0.entry(data_type).or_insert(timestamp);
        *entry = (*entry).max(timestamp);
    }

    pub fn reset(&mut self, data_type: DataType) {
        self.0.remove(&data_type);
    }

    pub fn iter(&self) -> impl Iterator<Item = (DataType, i64)> + '_ {
        self.0.iter().map(|(data_type, timestamp)| (*data_type, *timestamp))
    }

    /// Loads checkpoints, treating a missing file as empty.
    pub async fn load(path: &Path) -> Result<Self, RecordStoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), RecordStoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic() {
        let mut checkpoints = Checkpoints::default();
        checkpoints.advance(DataType::Sms, 10);
        checkpoints.advance(DataType::Sms, 5);
        assert_eq!(checkpoints.get(DataType::Sms), Some(10));
        assert_eq!(checkpoints.get(DataType::CallLog), None);
        checkpoints.reset(DataType::Sms);
        assert_eq!(checkpoints.get(DataType::Sms), None);
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/checkpoints.json");
        assert_eq!(Checkpoints::load(&path).await.unwrap(), Checkpoints::default());

        let mut checkpoints = Checkpoints::default();
        checkpoints.advance(DataType::Sms, 1420759456762);
        checkpoints.advance(DataType::CallLog, 1419163218194);
        checkpoints.save(&path).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"calllog\": 1419163218194"));
        assert_eq!(Checkpoints::load(&path).await.unwrap(), checkpoints);
    }
}
