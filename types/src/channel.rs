use crate::{account::Address, log::TxLogEntry};
use bytes::BufMut;
use commonware_codec::Write;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message type used by the bot to relay its own transaction log.
pub const BOT_TRANSACTION_LOG: &str = "bot-transaction-log";

/// Timeouts negotiated for a channel session (milliseconds).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    pub idle_ms: u64,
    pub accept_ms: u64,
    pub sign_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            idle_ms: 600_000,
            accept_ms: 120_000,
            sign_ms: 30_000,
        }
    }
}

/// Parameters for opening a channel session. Bot is the initiator, user the responder.
///
/// Immutable once a channel opens, except that `existing_channel_id` and
/// `existing_fsm_id` are filled in once known so the session can be resumed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub initiator_id: Address,
    pub responder_id: Address,
    pub initiator_amount: u64,
    pub responder_amount: u64,
    #[serde(default)]
    pub push_amount: u64,
    pub channel_reserve: u64,
    pub host: String,
    pub port: u16,
    pub lock_period: u64,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_fsm_id: Option<String>,
}

impl ChannelConfig {
    pub fn with_existing(mut self, channel_id: String, fsm_id: String) -> Self {
        self.existing_channel_id = Some(channel_id);
        self.existing_fsm_id = Some(fsm_id);
        self
    }

    pub fn is_reconnect(&self) -> bool {
        self.existing_channel_id.is_some() && self.existing_fsm_id.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Connecting,
    Accepted,
    HalfSigned,
    Signed,
    Open,
    Disconnected,
    Closing,
    Closed,
    Died,
}

impl ChannelStatus {
    /// No further events will be delivered for this session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Died)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Connecting => "connecting",
            Self::Accepted => "accepted",
            Self::HalfSigned => "half_signed",
            Self::Signed => "signed",
            Self::Open => "open",
            Self::Disconnected => "disconnected",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Died => "died",
        };
        f.write_str(value)
    }
}

/// A single change proposed inside a channel transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Update {
    #[serde(rename_all = "camelCase")]
    NewContract {
        owner: Address,
        code: Vec<u8>,
        deposit: u64,
        call_data: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    CallContract {
        caller: Address,
        contract: Address,
        amount: u64,
        call_data: Vec<u8>,
    },
}

fn write_bytes(bytes: &[u8], writer: &mut impl BufMut) {
    (bytes.len() as u32).write(writer);
    writer.put_slice(bytes);
}

impl Update {
    fn write_payload(&self, writer: &mut impl BufMut) {
        match self {
            Self::NewContract {
                owner,
                code,
                deposit,
                call_data,
            } => {
                0u8.write(writer);
                write_bytes(owner.as_str().as_bytes(), writer);
                write_bytes(code, writer);
                deposit.write(writer);
                write_bytes(call_data, writer);
            }
            Self::CallContract {
                caller,
                contract,
                amount,
                call_data,
            } => {
                1u8.write(writer);
                write_bytes(caller.as_str().as_bytes(), writer);
                write_bytes(contract.as_str().as_bytes(), writer);
                amount.write(writer);
                write_bytes(call_data, writer);
            }
        }
    }
}

/// An off-chain state transition at channel `round`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTx {
    pub round: u64,
    pub updates: Vec<Update>,
}

impl ChannelTx {
    /// The first contract call in this transaction, if any.
    pub fn contract_call(&self) -> Option<(&Address, &Address, &[u8])> {
        self.updates.iter().find_map(|update| match update {
            Update::CallContract {
                caller,
                contract,
                call_data,
                ..
            } => Some((caller, contract, call_data.as_slice())),
            _ => None,
        })
    }

    pub fn deploys_contract(&self) -> bool {
        self.updates
            .iter()
            .any(|update| matches!(update, Update::NewContract { .. }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SignTag {
    Open = 0,
    Update = 1,
    UpdateAck = 2,
    Shutdown = 3,
}

/// A transaction the channel needs the local account to co-sign.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignRequest {
    pub tag: SignTag,
    pub tx: ChannelTx,
}

impl SignRequest {
    /// Bytes covered by the signature.
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        (self.tag as u8).write(&mut payload);
        self.tx.round.write(&mut payload);
        (self.tx.updates.len() as u32).write(&mut payload);
        for update in &self.tx.updates {
            update.write_payload(&mut payload);
        }
        payload
    }
}

/// Free-form peer message (`{type, data}`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

/// Payload of a [BOT_TRANSACTION_LOG] message: one entry of the bot's own log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotLogRelay {
    pub round: u64,
    pub entry: TxLogEntry,
}

impl ChannelMessage {
    pub fn bot_log(relay: &BotLogRelay) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: BOT_TRANSACTION_LOG.to_string(),
            data: serde_json::to_value(relay)?,
        })
    }

    /// Decode the payload if this is a bot log relay.
    pub fn as_bot_log(&self) -> Option<BotLogRelay> {
        if self.kind != BOT_TRANSACTION_LOG {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// A transaction that reached the shared ledger (open, close, disputes).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainTx {
    pub hash: String,
    pub info: String,
}

/// Everything a channel session delivers to its owner.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    StatusChanged(ChannelStatus),
    StateChanged(ChannelTx),
    Message(ChannelMessage),
    OnChainTx(OnChainTx),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ChannelConfig {
        ChannelConfig {
            initiator_id: Address::new("ak_bot"),
            responder_id: Address::new("ak_user"),
            initiator_amount: 1_000,
            responder_amount: 1_000,
            push_amount: 0,
            channel_reserve: 2,
            host: "localhost".to_string(),
            port: 3333,
            lock_period: 10,
            timeouts: Timeouts::default(),
            existing_channel_id: None,
            existing_fsm_id: None,
        }
    }

    #[test]
    fn test_config_json_shape() {
        let json = serde_json::to_value(sample_config()).unwrap();
        assert_eq!(json["initiatorId"], "ak_bot");
        assert!(json.get("existingChannelId").is_none());

        let resumed = sample_config().with_existing("ch_1".into(), "fsm_1".into());
        assert!(resumed.is_reconnect());
        let json = serde_json::to_value(&resumed).unwrap();
        assert_eq!(json["existingFsmId"], "fsm_1");
    }

    #[test]
    fn test_config_defaults_missing_optional_fields() {
        let json = r#"{
            "initiatorId": "ak_bot",
            "responderId": "ak_user",
            "initiatorAmount": 10,
            "responderAmount": 10,
            "channelReserve": 1,
            "host": "localhost",
            "port": 3001,
            "lockPeriod": 5
        }"#;
        let config: ChannelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.push_amount, 0);
        assert_eq!(config.timeouts, Timeouts::default());
        assert!(!config.is_reconnect());
    }

    #[test]
    fn test_sign_payload_binds_tag_and_round() {
        let tx = ChannelTx {
            round: 4,
            updates: vec![Update::CallContract {
                caller: Address::new("ak_user"),
                contract: Address::new("ct_game"),
                amount: 10,
                call_data: vec![1, 2, 3],
            }],
        };
        let update = SignRequest {
            tag: SignTag::Update,
            tx: tx.clone(),
        };
        let ack = SignRequest {
            tag: SignTag::UpdateAck,
            tx: tx.clone(),
        };
        let later = SignRequest {
            tag: SignTag::Update,
            tx: ChannelTx { round: 5, ..tx },
        };
        assert_ne!(update.payload(), ack.payload());
        assert_ne!(update.payload(), later.payload());
        assert_eq!(update.payload(), update.clone().payload());
    }

    #[test]
    fn test_contract_call_lookup() {
        let tx = ChannelTx {
            round: 2,
            updates: vec![Update::NewContract {
                owner: Address::new("ak_bot"),
                code: vec![0xfe],
                deposit: 0,
                call_data: vec![],
            }],
        };
        assert!(tx.deploys_contract());
        assert!(tx.contract_call().is_none());
    }

    #[test]
    fn test_message_uses_type_key() {
        let message: ChannelMessage =
            serde_json::from_str(r#"{"type":"bot-transaction-log","data":{"round":1}}"#).unwrap();
        assert_eq!(message.kind, BOT_TRANSACTION_LOG);
        assert!(message.as_bot_log().is_none());
        assert!(ChannelStatus::Died.is_terminal());
        assert!(!ChannelStatus::Disconnected.is_terminal());
    }

    #[test]
    fn test_bot_log_relay() {
        let relay = BotLogRelay {
            round: 3,
            entry: TxLogEntry::new("player1_move(paper)", crate::log::SignedState::Confirmed, 9),
        };
        let message = ChannelMessage::bot_log(&relay).unwrap();
        assert_eq!(message.kind, BOT_TRANSACTION_LOG);
        assert_eq!(message.as_bot_log(), Some(relay));

        let other = ChannelMessage {
            kind: "chat".into(),
            data: serde_json::json!({"round": 3}),
        };
        assert!(other.as_bot_log().is_none());
    }
}
