//! Temperature history kept as one CSV record.

use std::io;

use chrono::{DateTime, Datelike, Utc};
use log::{info, warn};

use crate::credentials::RecordStorage;

pub const CSV_HEADER: &str = "timestamp,temperature\n";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Earlier years mean the clock has not been set by SNTP yet.
const FIRST_SYNCED_YEAR: i32 = 2024;

pub fn clock_is_synced(now: DateTime<Utc>) -> bool {
    now.year() >= FIRST_SYNCED_YEAR
}

#[derive(Debug, Clone)]
pub struct TemperatureLog {
    record_name: String,
    max_bytes: usize,
}

impl TemperatureLog {
    pub fn new(record_name: impl Into<String>, max_bytes: usize) -> Self {
        Self {
            record_name: record_name.into(),
            max_bytes,
        }
    }

    pub fn record_name(&self) -> &str {
        &self.record_name
    }

    /// Adds one `timestamp,temperature` row, writing the header first when
    /// the log is new. The oldest rows are dropped once `max_bytes` is reached.
    pub fn append<S: RecordStorage>(
        &self,
        storage: &mut S,
        at: DateTime<Utc>,
        celsius: f32,
    ) -> io::Result<()> {
        let name = self.record_name.as_str();
        let row = format!("{},{celsius:.2}\n", at.format(TIMESTAMP_FORMAT));

        if !storage.exists(name)? {
            let fresh = format!("{CSV_HEADER}{row}");
            return storage.write(name, fresh.as_bytes());
        }

        let len = usize::try_from(storage.size(name)?).unwrap_or(usize::MAX);
        if len.saturating_add(row.len()) <= self.max_bytes {
            return storage.append(name, row.as_bytes());
        }

        let raw = storage.read(name)?;
        info!("temperature log full; dropping oldest rows");
        storage.write(name, &compact(&raw, &row, self.max_bytes))
    }

    /// Returns the log, creating an empty one with just the header if needed.
    pub fn contents<S: RecordStorage>(&self, storage: &mut S) -> io::Result<String> {
        let name = self.record_name.as_str();
        if !storage.exists(name)? {
            storage.write(name, CSV_HEADER.as_bytes())?;
            return Ok(CSV_HEADER.to_string());
        }

        let raw = storage.read(name)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Deletes the log; `Ok(false)` when there was none.
    pub fn remove<S: RecordStorage>(&self, storage: &mut S) -> io::Result<bool> {
        let name = self.record_name.as_str();
        if !storage.exists(name)? {
            return Ok(false);
        }
        match storage.remove(name) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                warn!("failed to remove temperature log: {err}");
                Err(err)
            }
        }
    }
}

/// Header, then as many of the newest rows as fit ahead of `row`.
fn compact(raw: &[u8], row: &str, max_bytes: usize) -> Vec<u8> {
    let text = String::from_utf8_lossy(raw);
    let body = text.strip_prefix(CSV_HEADER).unwrap_or(&*text);
    let budget = max_bytes.saturating_sub(CSV_HEADER.len() + row.len());

    let mut start = 0;
    while body.len() - start > budget {
        match body[start..].find('\n') {
            Some(newline) => start += newline + 1,
            None => start = body.len(),
        }
    }

    format!("{CSV_HEADER}{}{row}", &body[start..]).into_bytes()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::MemoryStorage;

    const RECORD: &str = "temp_log.csv";

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, second).unwrap()
    }

    fn stored(storage: &MemoryStorage) -> String {
        String::from_utf8(storage.get(RECORD).unwrap()).unwrap()
    }

    #[test]
    fn first_reading_writes_header() {
        let log = TemperatureLog::new(RECORD, 1024);
        let mut storage = MemoryStorage::default();

        log.append(&mut storage, at(0), 21.5).unwrap();
        log.append(&mut storage, at(3), 21.4).unwrap();

        assert_eq!(
            stored(&storage),
            "timestamp,temperature\n2025-03-14 09:26:00,21.50\n2025-03-14 09:26:03,21.40\n"
        );
    }

    #[test]
    fn contents_creates_header_only_log() {
        let log = TemperatureLog::new(RECORD, 1024);
        let mut storage = MemoryStorage::default();

        assert_eq!(log.contents(&mut storage).unwrap(), CSV_HEADER);
        assert_eq!(stored(&storage), CSV_HEADER);
    }

    #[test]
    fn remove_reports_whether_log_existed() {
        let log = TemperatureLog::new(RECORD, 1024);
        let mut storage = MemoryStorage::default();

        assert!(!log.remove(&mut storage).unwrap());
        log.append(&mut storage, at(0), 20.0).unwrap();
        assert!(log.remove(&mut storage).unwrap());
        assert_eq!(storage.get(RECORD), None);
    }

    #[test]
    fn full_log_drops_oldest_rows() {
        // Header is 22 bytes and each row 26, so three rows fit.
        let log = TemperatureLog::new(RECORD, 22 + 3 * 26);
        let mut storage = MemoryStorage::default();

        for second in 0..5 {
            log.append(&mut storage, at(second), 20.0).unwrap();
        }

        assert_eq!(
            stored(&storage),
            "timestamp,temperature\n\
             2025-03-14 09:26:02,20.00\n\
             2025-03-14 09:26:03,20.00\n\
             2025-03-14 09:26:04,20.00\n"
        );
    }

    #[test]
    fn unset_clock_is_not_synced() {
        assert!(!clock_is_synced(Utc.timestamp_opt(0, 0).unwrap()));
        assert!(clock_is_synced(at(0)));
    }
}
