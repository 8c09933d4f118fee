//! Persisted WiFi credentials.
//!
//! The record is a single JSON object `{"ssid": ..., "password": ...}` kept
//! under one storage name. Loading fails open: anything other than a complete,
//! parseable record with a non-empty identifier reads as "no credentials".

use std::io;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MAX_RECORD_BYTES;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "ssid")]
    pub network_identifier: String,
    #[serde(rename = "password")]
    pub secret: String,
}

impl Credential {
    pub fn new(network_identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            network_identifier: network_identifier.into(),
            secret: secret.into(),
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.network_identifier.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.secret.is_empty()
    }
}

/// Byte-oriented access to named records on non-volatile storage.
///
/// `write` must replace the record atomically: after a failed write the
/// previous content (or its absence) is still what `read` returns.
pub trait RecordStorage {
    fn exists(&self, name: &str) -> io::Result<bool>;
    fn size(&self, name: &str) -> io::Result<u64>;
    fn read(&self, name: &str) -> io::Result<Vec<u8>>;
    fn write(&mut self, name: &str, bytes: &[u8]) -> io::Result<()>;
    fn remove(&mut self, name: &str) -> io::Result<()>;

    /// Appends to a record, creating it when absent. Unlike `write` this need
    /// not be atomic.
    fn append(&mut self, name: &str, bytes: &[u8]) -> io::Result<()> {
        let mut existing = match self.read(name) {
            Ok(existing) => existing,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err),
        };
        existing.extend_from_slice(bytes);
        self.write(name, &existing)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential record is {len} bytes, limit is {max}")]
    TooLarge { len: usize, max: usize },
    #[error("failed to encode credential record")]
    Encode(#[source] serde_json::Error),
    #[error("storage rejected the write")]
    WriteFailed(#[source] io::Error),
    #[error("failed to remove credential record")]
    RemoveFailed(#[source] io::Error),
}

/// Why a stored record was treated as absent.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("no credential record stored")]
    Missing,
    #[error("credential record could not be read")]
    Unreadable(#[source] io::Error),
    #[error("credential record is {len} bytes, limit is {max}")]
    Oversize { len: u64, max: usize },
    #[error("credential record is malformed")]
    Malformed(#[source] serde_json::Error),
    #[error("credential record has an empty network identifier")]
    EmptyIdentifier,
}

pub struct CredentialStore<S> {
    storage: S,
    record_name: String,
    max_bytes: usize,
}

impl<S: RecordStorage> CredentialStore<S> {
    pub fn new(storage: S, record_name: impl Into<String>) -> Self {
        Self::with_limit(storage, record_name, MAX_RECORD_BYTES)
    }

    pub fn with_limit(storage: S, record_name: impl Into<String>, max_bytes: usize) -> Self {
        Self {
            storage,
            record_name: record_name.into(),
            max_bytes,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    pub fn load(&self) -> Option<Credential> {
        match self.try_load() {
            Ok(credential) => Some(credential),
            Err(RecordError::Missing) => {
                info!("no stored wifi credentials");
                None
            }
            Err(err) => {
                warn!("ignoring stored wifi credentials: {err}");
                None
            }
        }
    }

    pub fn try_load(&self) -> Result<Credential, RecordError> {
        let name = self.record_name.as_str();
        match self.storage.exists(name) {
            Ok(true) => {}
            Ok(false) => return Err(RecordError::Missing),
            Err(err) => return Err(RecordError::Unreadable(err)),
        }

        let len = self.storage.size(name).map_err(RecordError::Unreadable)?;
        self.check_len(len)?;

        let raw = self.storage.read(name).map_err(RecordError::Unreadable)?;
        // The record may have changed between size() and read().
        self.check_len(raw.len() as u64)?;

        let credential: Credential =
            serde_json::from_slice(&raw).map_err(RecordError::Malformed)?;
        if !credential.is_usable() {
            return Err(RecordError::EmptyIdentifier);
        }
        Ok(credential)
    }

    pub fn save(&mut self, credential: &Credential) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(credential).map_err(StoreError::Encode)?;
        if payload.len() > self.max_bytes {
            return Err(StoreError::TooLarge {
                len: payload.len(),
                max: self.max_bytes,
            });
        }

        self.storage
            .write(&self.record_name, &payload)
            .map_err(StoreError::WriteFailed)?;
        info!(
            "wifi credentials saved for `{}`",
            credential.network_identifier
        );
        Ok(())
    }

    pub fn clear(&mut self) -> Result<(), StoreError> {
        match self.storage.exists(&self.record_name) {
            Ok(false) => return Ok(()),
            Ok(true) => {}
            Err(err) => warn!("could not check for stored credentials before removal: {err}"),
        }

        match self.storage.remove(&self.record_name) {
            Ok(()) => {
                info!("wifi credentials cleared");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::RemoveFailed(err)),
        }
    }

    fn check_len(&self, len: u64) -> Result<(), RecordError> {
        if len > self.max_bytes as u64 {
            return Err(RecordError::Oversize {
                len,
                max: self.max_bytes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::MemoryStorage;

    const RECORD: &str = "wifi_config";

    fn store() -> CredentialStore<MemoryStorage> {
        CredentialStore::new(MemoryStorage::default(), RECORD)
    }

    #[test]
    fn save_then_load_returns_same_record() {
        let mut store = store();
        let cases = [
            Credential::new("home", "hunter2"),
            Credential::new("Café Guest", ""),
            Credential::new("x".repeat(32), "p".repeat(64)),
            Credential::new("quote\"and\\slash", "ünïcødé"),
        ];

        for credential in cases {
            store.save(&credential).unwrap();
            assert_eq!(store.load(), Some(credential));
        }
    }

    #[test]
    fn record_uses_ssid_and_password_keys() {
        let mut store = store();
        store.save(&Credential::new("home", "hunter2")).unwrap();

        let raw = store.storage().get(RECORD).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "ssid": "home", "password": "hunter2" })
        );
    }

    #[test]
    fn missing_record_loads_as_none() {
        assert!(matches!(store().try_load(), Err(RecordError::Missing)));
        assert_eq!(store().load(), None);
    }

    #[test]
    fn oversize_record_loads_as_none() {
        let mut store = store();
        let padded = format!(
            r#"{{"ssid":"home","password":"{}"}}"#,
            "a".repeat(MAX_RECORD_BYTES)
        );
        store.storage_mut().put(RECORD, padded.into_bytes());

        assert!(matches!(
            store.try_load(),
            Err(RecordError::Oversize { max: MAX_RECORD_BYTES, .. })
        ));
        assert_eq!(store.load(), None);
    }

    #[test]
    fn malformed_records_load_as_none() {
        let mut store = store();
        let bodies: [&[u8]; 5] = [
            b"",
            b"{not json",
            br#"{"ssid":"home"}"#,
            br#"{"ssid":42,"password":"x"}"#,
            &[0xff, 0xfe, 0x00],
        ];

        for body in bodies {
            store.storage_mut().put(RECORD, body.to_vec());
            assert!(matches!(store.try_load(), Err(RecordError::Malformed(_))));
            assert_eq!(store.load(), None);
        }
    }

    #[test]
    fn empty_identifier_is_treated_as_absent() {
        let mut store = store();
        store
            .storage_mut()
            .put(RECORD, br#"{"ssid":"","password":"secret"}"#.to_vec());

        assert!(matches!(store.try_load(), Err(RecordError::EmptyIdentifier)));
        assert_eq!(store.load(), None);
    }

    #[test]
    fn unreadable_storage_loads_as_none() {
        let mut store = store();
        store.save(&Credential::new("home", "hunter2")).unwrap();
        store.storage_mut().fail_reads = true;

        assert!(matches!(store.try_load(), Err(RecordError::Unreadable(_))));
        assert_eq!(store.load(), None);
    }

    #[test]
    fn rejected_write_keeps_previous_record() {
        let mut store = store();
        store.save(&Credential::new("home", "hunter2")).unwrap();
        store.storage_mut().fail_writes = true;

        let err = store.save(&Credential::new("office", "letmein")).unwrap_err();
        assert!(matches!(err, StoreError::WriteFailed(_)));
        assert_eq!(store.load(), Some(Credential::new("home", "hunter2")));
    }

    #[test]
    fn save_refuses_records_over_the_limit() {
        let mut store = CredentialStore::with_limit(MemoryStorage::default(), RECORD, 64);
        let err = store
            .save(&Credential::new("home", "x".repeat(64)))
            .unwrap_err();

        assert!(matches!(err, StoreError::TooLarge { max: 64, .. }));
        assert!(store.storage().get(RECORD).is_none());
    }

    #[test]
    fn clear_is_idempotent() {
        let mut store = store();
        store.save(&Credential::new("home", "hunter2")).unwrap();

        store.clear().unwrap();
        store.clear().unwrap();
        assert_eq!(store.load(), None);
    }
}
