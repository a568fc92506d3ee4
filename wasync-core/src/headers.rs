//! Header names used on backed-up messages.
//!
//! Private headers carry the record fields and are prefixed so they never
//! collide with standard mail headers. Lookups are case-insensitive.

pub const ID: &str = "X-wasync-id";
pub const ADDRESS: &str = "X-wasync-address";
pub const DATATYPE: &str = "X-wasync-datatype";
pub const TYPE: &str = "X-wasync-type";
pub const DATE: &str = "X-wasync-date";
pub const THREAD_ID: &str = "X-wasync-thread";
pub const READ: &str = "X-wasync-read";
pub const STATUS: &str = "X-wasync-status";
pub const PROTOCOL: &str = "X-wasync-protocol";
pub const SERVICE_CENTER: &str = "X-wasync-service_center";
pub const BACKUP_TIME: &str = "X-wasync-backup-time";
pub const VERSION: &str = "X-wasync-version";
pub const DURATION: &str = "X-wasync-duration";

pub const REFERENCES: &str = "References";
pub const MESSAGE_ID: &str = "Message-ID";
pub const SUBJECT: &str = "Subject";
pub const FROM: &str = "From";
pub const TO: &str = "To";
pub const DATE_STANDARD: &str = "Date";
pub const MIME_VERSION: &str = "MIME-Version";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_TRANSFER_ENCODING: &str = "Content-Transfer-Encoding";

/// Domain used for synthetic message and thread identifiers.
pub const LOCAL_DOMAIN: &str = "wasync.local";
/// Domain used to turn a phone number into a mail address.
pub const UNKNOWN_DOMAIN: &str = "unknown.email";

/// Ordered, case-insensitive header list. The first occurrence of a name wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sets `name`, replacing any existing value for it.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Adds `name` only when it is not present yet.
    pub fn insert_if_absent(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if !self.contains(&name) {
            self.entries.push((name, value.into()));
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self
            .entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = HeaderMap::new();
        for (key, value) in iter {
            map.insert_if_absent(key, value);
        }
        map
    }
}
