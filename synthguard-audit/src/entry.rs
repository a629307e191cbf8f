use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{hash::ChainHash, payload::AuditPayload};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence_no: u64,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: ChainHash,
    pub payload: AuditPayload,
    pub payload_hash: ChainHash,
}

impl AuditEntry {
    pub(crate) fn seal(
        sequence_no: u64,
        timestamp: DateTime<Utc>,
        prev_hash: ChainHash,
        payload: AuditPayload,
    ) -> Result<Self, serde_json::Error> {
        let payload_hash = hash_payload(&payload)?;
        Ok(Self {
            sequence_no,
            timestamp,
            prev_hash,
            payload,
            payload_hash,
        })
    }

    /// Hash of the full serialized entry; the next entry's `prev_hash`.
    pub fn digest(&self) -> Result<ChainHash, serde_json::Error> {
        Ok(ChainHash::digest(serde_json::to_vec(self)?))
    }

    /// Recomputes the payload hash and compares it with the stored one.
    pub fn payload_intact(&self) -> Result<bool, serde_json::Error> {
        Ok(hash_payload(&self.payload)? == self.payload_hash)
    }
}

pub(crate) fn hash_payload(payload: &AuditPayload) -> Result<ChainHash, serde_json::Error> {
    Ok(ChainHash::digest(serde_json::to_vec(payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::ReleaseCause;

    fn released(epsilon: f64) -> AuditPayload {
        AuditPayload::Released {
            dataset_id: "patients_v1".into(),
            reservation_id: "rsv-1".into(),
            epsilon,
            delta: 0.0,
            cause: ReleaseCause::Rejected,
        }
    }

    #[test]
    fn digest_survives_json_round_trip() {
        let entry = AuditEntry::seal(7, Utc::now(), ChainHash::genesis(), released(0.1 + 0.2))
            .unwrap();
        let line = serde_json::to_string(&entry).unwrap();
        let parsed: AuditEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.digest().unwrap(), entry.digest().unwrap());
    }

    #[test]
    fn payload_edit_is_detected() {
        let mut entry =
            AuditEntry::seal(0, Utc::now(), ChainHash::genesis(), released(0.5)).unwrap();
        assert!(entry.payload_intact().unwrap());
        entry.payload = released(0.25);
        assert!(!entry.payload_intact().unwrap());
    }
}
