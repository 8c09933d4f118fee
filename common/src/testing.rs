//! In-memory collaborators for unit tests.

use std::{collections::HashMap, io, net::Ipv4Addr};

use crate::{
    credentials::{Credential, RecordStorage},
    driver::{DriverError, LinkStatus, NetworkDriver, Personality},
};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    pub records: HashMap<String, Vec<u8>>,
    pub fail_reads: bool,
    pub fail_writes: bool,
}

impl MemoryStorage {
    pub fn put(&mut self, name: &str, bytes: Vec<u8>) {
        self.records.insert(name.to_string(), bytes);
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.records.get(name).cloned()
    }

    fn check_reads(&self) -> io::Result<()> {
        if self.fail_reads {
            return Err(io::Error::other("simulated read failure"));
        }
        Ok(())
    }
}

impl RecordStorage for MemoryStorage {
    fn exists(&self, name: &str) -> io::Result<bool> {
        self.check_reads()?;
        Ok(self.records.contains_key(name))
    }

    fn size(&self, name: &str) -> io::Result<u64> {
        self.check_reads()?;
        self.records
            .get(name)
            .map(|raw| raw.len() as u64)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        self.check_reads()?;
        self.records
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn write(&mut self, name: &str, bytes: &[u8]) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::Error::other("simulated write failure"));
        }
        self.put(name, bytes.to_vec());
        Ok(())
    }

    fn remove(&mut self, name: &str) -> io::Result<()> {
        self.records
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    SetPersonality(Personality),
    Join(Credential),
}

/// Scripted radio. Tests flip `status` to simulate association and link loss.
#[derive(Debug)]
pub struct FakeDriver {
    pub calls: Vec<DriverCall>,
    pub status: LinkStatus,
    pub connect_on_join: bool,
    pub fail_join: bool,
    pub fail_access_point: bool,
    pub station_address: Ipv4Addr,
    pub ap_address: Ipv4Addr,
    pub personality: Option<Personality>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            status: LinkStatus::Disconnected,
            connect_on_join: false,
            fail_join: false,
            fail_access_point: false,
            station_address: Ipv4Addr::new(192, 168, 1, 50),
            ap_address: Ipv4Addr::new(192, 168, 4, 1),
            personality: None,
        }
    }
}

impl FakeDriver {
    pub fn joins(&self) -> Vec<Credential> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                DriverCall::Join(credential) => Some(credential.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn access_point_activations(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| {
                matches!(
                    call,
                    DriverCall::SetPersonality(Personality::AccessPoint(_))
                )
            })
            .count()
    }

    pub fn personality(&self) -> Option<&Personality> {
        self.personality.as_ref()
    }
}

impl NetworkDriver for FakeDriver {
    fn set_personality(&mut self, personality: &Personality) -> Result<(), DriverError> {
        self.calls.push(DriverCall::SetPersonality(personality.clone()));
        if self.fail_access_point && matches!(personality, Personality::AccessPoint(_)) {
            return Err(DriverError::Radio("simulated AP failure".to_string()));
        }
        self.status = LinkStatus::Disconnected;
        self.personality = Some(personality.clone());
        Ok(())
    }

    fn join(&mut self, credential: &Credential) -> Result<(), DriverError> {
        self.calls.push(DriverCall::Join(credential.clone()));
        if self.fail_join {
            return Err(DriverError::Radio("simulated join failure".to_string()));
        }
        if self.connect_on_join {
            self.status = LinkStatus::Connected;
        }
        Ok(())
    }

    fn connection_status(&self) -> LinkStatus {
        self.status
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        (self.status == LinkStatus::Connected).then_some(self.station_address)
    }

    fn access_point_address(&self) -> Ipv4Addr {
        self.ap_address
    }
}

pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;

/// A single-question, recursion-desired DNS query.
pub fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
    for label in name.split('.').filter(|label| !label.is_empty()) {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&1_u16.to_be_bytes());
    packet
}

/// Answer count from a DNS response header.
pub fn answer_count(response: &[u8]) -> u16 {
    u16::from_be_bytes([response[6], response[7]])
}
