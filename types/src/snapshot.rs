use crate::{
    account::Keypair, channel::ChannelConfig, game::Round, log::TransactionLogs,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fields without which a snapshot cannot be resumed.
pub const REQUIRED_FIELDS: [&str; 2] = ["keypair", "contractCreationRound"];

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is missing required field {0}")]
    MissingField(&'static str),
    #[error("snapshot is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Everything needed to resume a game after a reload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub keypair: Keypair,
    pub channel_id: Option<String>,
    pub fsm_id: Option<String>,
    pub channel_config: ChannelConfig,
    pub channel_round: Option<u64>,
    pub round: Round,
    pub transaction_logs: TransactionLogs,
    pub contract_creation_round: u64,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a stored snapshot, reporting the first missing required field.
    pub fn from_json(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        for field in REQUIRED_FIELDS {
            if value.get(field).is_none_or(serde_json::Value::is_null) {
                return Err(SnapshotError::MissingField(field));
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    /// The channel configuration extended with the identifiers needed to reconnect.
    pub fn reconnect_config(&self) -> Option<ChannelConfig> {
        let channel_id = self.channel_id.clone()?;
        let fsm_id = self.fsm_id.clone()?;
        Some(
            self.channel_config
                .clone()
                .with_existing(channel_id, fsm_id),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        account::Address,
        channel::Timeouts,
        game::Move,
        hashing::HashKey,
        log::{SignedState, TxLogEntry},
    };

    fn sample() -> Snapshot {
        let keypair = Keypair::from_seed(1);
        let mut round = Round::new(10);
        round.user_selection = Move::Rock;
        round.hash_key = Some(HashKey::from_bytes([4u8; 32]));
        let mut transaction_logs = TransactionLogs::default();
        transaction_logs
            .user
            .append(1, TxLogEntry::new("commit", SignedState::Confirmed, 5));
        Snapshot {
            channel_config: ChannelConfig {
                initiator_id: Address::new("ak_bot"),
                responder_id: keypair.address().clone(),
                initiator_amount: 100,
                responder_amount: 100,
                push_amount: 0,
                channel_reserve: 1,
                host: "localhost".into(),
                port: 3001,
                lock_period: 10,
                timeouts: Timeouts::default(),
                existing_channel_id: None,
                existing_fsm_id: None,
            },
            keypair,
            channel_id: Some("ch_1".into()),
            fsm_id: Some("fsm_1".into()),
            channel_round: Some(9),
            round,
            transaction_logs,
            contract_creation_round: 2,
        }
    }

    #[test]
    fn test_roundtrip() {
        let snapshot = sample();
        let bytes = snapshot.to_json().unwrap();
        assert_eq!(Snapshot::from_json(&bytes).unwrap(), snapshot);
    }

    #[test]
    fn test_missing_contract_creation_round_is_reported() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .remove("contractCreationRound");
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            Snapshot::from_json(&bytes),
            Err(SnapshotError::MissingField("contractCreationRound"))
        ));
    }

    #[test]
    fn test_null_keypair_is_reported() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["keypair"] = serde_json::Value::Null;
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            Snapshot::from_json(&bytes),
            Err(SnapshotError::MissingField("keypair"))
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            Snapshot::from_json(b"{not json"),
            Err(SnapshotError::Malformed(_))
        ));
    }

    #[test]
    fn test_reconnect_config_requires_ids() {
        let mut snapshot = sample();
        let config = snapshot.reconnect_config().unwrap();
        assert_eq!(config.existing_channel_id.as_deref(), Some("ch_1"));
        snapshot.fsm_id = None;
        assert!(snapshot.reconnect_config().is_none());
    }
}
