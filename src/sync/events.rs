//! Protocol event schema.
//!
//! This module defines the closed set of event kinds the synchronizer understands and the
//! decoding of raw ledger logs into typed [`ProtocolEvent`]s. Each kind is identified by the
//! Keccak-256 hash of its Solidity-style signature in topic 0. Indexed arguments follow in
//! topics 1..n and the remaining arguments are 32-byte words in the log data.
//!
//! A topic that maps to no kind is a schema mismatch between the synchronizer and the ledger
//! and is reported as [`SyncError::UnknownEvent`].

use crate::ledger::{EventPosition, RawEvent, Topic, keccak256};
use crate::merkle::{Field, to_word};
use crate::sync::types::SyncError;

use num_bigint::BigUint;
use std::sync::OnceLock;

/// Kinds of events emitted by the protocol contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AttesterSignedUp,
    UserSignedUp,
    UserStateTransitioned,
    Attestation,
    StateTreeLeaf,
    EpochTreeLeaf,
    EpochEnded,
    HistoryTreeLeaf,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::AttesterSignedUp,
        EventKind::UserSignedUp,
        EventKind::UserStateTransitioned,
        EventKind::Attestation,
        EventKind::StateTreeLeaf,
        EventKind::EpochTreeLeaf,
        EventKind::EpochEnded,
        EventKind::HistoryTreeLeaf,
    ];

    pub fn signature(self) -> &'static str {
        match self {
            EventKind::AttesterSignedUp => "AttesterSignedUp(uint160,uint48,uint48)",
            EventKind::UserSignedUp => "UserSignedUp(uint48,uint256,uint160,uint256,uint256)",
            EventKind::UserStateTransitioned => {
                "UserStateTransitioned(uint48,uint160,uint256,uint256,uint256)"
            }
            EventKind::Attestation => "Attestation(uint48,uint256,uint160,uint256,uint256)",
            EventKind::StateTreeLeaf => "StateTreeLeaf(uint48,uint160,uint256,uint256)",
            EventKind::EpochTreeLeaf => "EpochTreeLeaf(uint48,uint160,uint256,uint256)",
            EventKind::EpochEnded => "EpochEnded(uint48,uint160)",
            EventKind::HistoryTreeLeaf => "HistoryTreeLeaf(uint160,uint256)",
        }
    }

    /// Whether each signature argument is indexed, in signature order.
    fn indexed(self) -> &'static [bool] {
        match self {
            EventKind::AttesterSignedUp => &[true, false, false],
            EventKind::UserSignedUp
            | EventKind::UserStateTransitioned
            | EventKind::Attestation => &[true, true, true, false, false],
            EventKind::StateTreeLeaf | EventKind::EpochTreeLeaf => &[true, true, true, false],
            EventKind::EpochEnded => &[true, true],
            EventKind::HistoryTreeLeaf => &[true, false],
        }
    }

    /// Topic 0 of events of this kind.
    pub fn topic(self) -> Topic {
        static TOPICS: OnceLock<Vec<(EventKind, Topic)>> = OnceLock::new();
        let topics = TOPICS.get_or_init(|| {
            EventKind::ALL
                .iter()
                .map(|kind| (*kind, keccak256(kind.signature().as_bytes())))
                .collect()
        });
        topics
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, topic)| *topic)
            .unwrap_or_else(|| keccak256(self.signature().as_bytes()))
    }

    pub fn from_topic(topic: &Topic) -> Option<Self> {
        EventKind::ALL.into_iter().find(|kind| kind.topic() == *topic)
    }

    /// Topic filter covering every known kind.
    pub fn all_topics() -> Vec<Topic> {
        EventKind::ALL.iter().map(|kind| kind.topic()).collect()
    }
}

/// A decoded protocol event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    AttesterSignedUp {
        attester_id: Field,
        epoch_length: u64,
        timestamp: u64,
    },
    UserSignedUp {
        epoch: u64,
        identity_commitment: Field,
        attester_id: Field,
        leaf_index: u64,
        leaf: Field,
    },
    UserStateTransitioned {
        epoch: u64,
        attester_id: Field,
        leaf_index: u64,
        hashed_leaf: Field,
        nullifier: Field,
    },
    Attestation {
        epoch: u64,
        epoch_key: Field,
        attester_id: Field,
        field_index: u64,
        change: Field,
    },
    StateTreeLeaf {
        epoch: u64,
        attester_id: Field,
        index: u64,
        leaf: Field,
    },
    EpochTreeLeaf {
        epoch: u64,
        attester_id: Field,
        /// Epoch key value; range checked by the handler, not the decoder.
        index: Field,
        leaf: Field,
    },
    EpochEnded {
        epoch: u64,
        attester_id: Field,
    },
    HistoryTreeLeaf {
        attester_id: Field,
        leaf: Field,
    },
}

impl ProtocolEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProtocolEvent::AttesterSignedUp { .. } => EventKind::AttesterSignedUp,
            ProtocolEvent::UserSignedUp { .. } => EventKind::UserSignedUp,
            ProtocolEvent::UserStateTransitioned { .. } => EventKind::UserStateTransitioned,
            ProtocolEvent::Attestation { .. } => EventKind::Attestation,
            ProtocolEvent::StateTreeLeaf { .. } => EventKind::StateTreeLeaf,
            ProtocolEvent::EpochTreeLeaf { .. } => EventKind::EpochTreeLeaf,
            ProtocolEvent::EpochEnded { .. } => EventKind::EpochEnded,
            ProtocolEvent::HistoryTreeLeaf { .. } => EventKind::HistoryTreeLeaf,
        }
    }

    /// The attester scope the event belongs to.
    pub fn attester_id(&self) -> &Field {
        match self {
            ProtocolEvent::AttesterSignedUp { attester_id, .. }
            | ProtocolEvent::UserSignedUp { attester_id, .. }
            | ProtocolEvent::UserStateTransitioned { attester_id, .. }
            | ProtocolEvent::Attestation { attester_id, .. }
            | ProtocolEvent::StateTreeLeaf { attester_id, .. }
            | ProtocolEvent::EpochTreeLeaf { attester_id, .. }
            | ProtocolEvent::EpochEnded { attester_id, .. }
            | ProtocolEvent::HistoryTreeLeaf { attester_id, .. } => attester_id,
        }
    }

    /// Arguments in signature order.
    fn args(&self) -> Vec<Field> {
        match self {
            ProtocolEvent::AttesterSignedUp {
                attester_id,
                epoch_length,
                timestamp,
            } => vec![
                attester_id.clone(),
                Field::from(*epoch_length),
                Field::from(*timestamp),
            ],
            ProtocolEvent::UserSignedUp {
                epoch,
                identity_commitment,
                attester_id,
                leaf_index,
                leaf,
            } => vec![
                Field::from(*epoch),
                identity_commitment.clone(),
                attester_id.clone(),
                Field::from(*leaf_index),
                leaf.clone(),
            ],
            ProtocolEvent::UserStateTransitioned {
                epoch,
                attester_id,
                leaf_index,
                hashed_leaf,
                nullifier,
            } => vec![
                Field::from(*epoch),
                attester_id.clone(),
                Field::from(*leaf_index),
                hashed_leaf.clone(),
                nullifier.clone(),
            ],
            ProtocolEvent::Attestation {
                epoch,
                epoch_key,
                attester_id,
                field_index,
                change,
            } => vec![
                Field::from(*epoch),
                epoch_key.clone(),
                attester_id.clone(),
                Field::from(*field_index),
                change.clone(),
            ],
            ProtocolEvent::StateTreeLeaf {
                epoch,
                attester_id,
                index,
                leaf,
            } => vec![
                Field::from(*epoch),
                attester_id.clone(),
                Field::from(*index),
                leaf.clone(),
            ],
            ProtocolEvent::EpochTreeLeaf {
                epoch,
                attester_id,
                index,
                leaf,
            } => vec![
                Field::from(*epoch),
                attester_id.clone(),
                index.clone(),
                leaf.clone(),
            ],
            ProtocolEvent::EpochEnded { epoch, attester_id } => {
                vec![Field::from(*epoch), attester_id.clone()]
            }
            ProtocolEvent::HistoryTreeLeaf { attester_id, leaf } => {
                vec![attester_id.clone(), leaf.clone()]
            }
        }
    }

    /// Encode the event as the ledger would emit it at `position`.
    pub fn encode(&self, position: EventPosition) -> RawEvent {
        let kind = self.kind();
        let mut topics = vec![kind.topic()];
        let mut data = Vec::new();
        for (arg, indexed) in self.args().iter().zip(kind.indexed()) {
            if *indexed {
                topics.push(to_word(arg));
            } else {
                data.extend_from_slice(&to_word(arg));
            }
        }
        RawEvent {
            block_number: position.block_number,
            transaction_index: position.transaction_index,
            log_index: position.log_index,
            topics,
            data,
        }
    }

    /// Decode a raw ledger event.
    pub fn decode(raw: &RawEvent) -> Result<Self, SyncError> {
        let position = raw.position();
        let topic = raw.topics.first().ok_or_else(|| SyncError::DecodeError {
            position,
            reason: "event has no topics".to_string(),
        })?;
        let kind = EventKind::from_topic(topic).ok_or_else(|| SyncError::UnknownEvent {
            topic: hex::encode(topic),
            position,
        })?;

        let mut args = ArgReader::new(raw, kind)?;
        let event = match kind {
            EventKind::AttesterSignedUp => ProtocolEvent::AttesterSignedUp {
                attester_id: args.field(),
                epoch_length: args.small()?,
                timestamp: args.small()?,
            },
            EventKind::UserSignedUp => ProtocolEvent::UserSignedUp {
                epoch: args.small()?,
                identity_commitment: args.field(),
                attester_id: args.field(),
                leaf_index: args.small()?,
                leaf: args.field(),
            },
            EventKind::UserStateTransitioned => ProtocolEvent::UserStateTransitioned {
                epoch: args.small()?,
                attester_id: args.field(),
                leaf_index: args.small()?,
                hashed_leaf: args.field(),
                nullifier: args.field(),
            },
            EventKind::Attestation => ProtocolEvent::Attestation {
                epoch: args.small()?,
                epoch_key: args.field(),
                attester_id: args.field(),
                field_index: args.small()?,
                change: args.field(),
            },
            EventKind::StateTreeLeaf => ProtocolEvent::StateTreeLeaf {
                epoch: args.small()?,
                attester_id: args.field(),
                index: args.small()?,
                leaf: args.field(),
            },
            EventKind::EpochTreeLeaf => ProtocolEvent::EpochTreeLeaf {
                epoch: args.small()?,
                attester_id: args.field(),
                index: args.field(),
                leaf: args.field(),
            },
            EventKind::EpochEnded => ProtocolEvent::EpochEnded {
                epoch: args.small()?,
                attester_id: args.field(),
            },
            EventKind::HistoryTreeLeaf => ProtocolEvent::HistoryTreeLeaf {
                attester_id: args.field(),
                leaf: args.field(),
            },
        };
        Ok(event)
    }
}

/// Reads event arguments in signature order from topics and data words.
struct ArgReader {
    words: std::vec::IntoIter<Field>,
    position: EventPosition,
}

impl ArgReader {
    fn new(raw: &RawEvent, kind: EventKind) -> Result<Self, SyncError> {
        let position = raw.position();
        let indexed = kind.indexed();
        let topic_count = indexed.iter().filter(|i| **i).count();
        let data_count = indexed.len() - topic_count;

        if raw.topics.len() != topic_count + 1 {
            return Err(SyncError::DecodeError {
                position,
                reason: format!(
                    "{:?} expects {} topics, got {}",
                    kind,
                    topic_count + 1,
                    raw.topics.len()
                ),
            });
        }
        if raw.data.len() != data_count * 32 {
            return Err(SyncError::DecodeError {
                position,
                reason: format!(
                    "{:?} expects {} data bytes, got {}",
                    kind,
                    data_count * 32,
                    raw.data.len()
                ),
            });
        }

        let mut topics = raw.topics[1..].iter();
        let mut data = raw.data.chunks(32);
        let mut words = Vec::with_capacity(indexed.len());
        for is_indexed in indexed {
            let bytes = if *is_indexed {
                topics.next().map(|t| t.as_slice())
            } else {
                data.next()
            };
            words.push(BigUint::from_bytes_be(bytes.unwrap_or_default()));
        }

        Ok(Self {
            words: words.into_iter(),
            position,
        })
    }

    fn field(&mut self) -> Field {
        self.words.next().unwrap_or_default()
    }

    fn small(&mut self) -> Result<u64, SyncError> {
        let word = self.field();
        u64::try_from(&word).map_err(|_| SyncError::DecodeError {
            position: self.position,
            reason: format!("value {word} does not fit in 64 bits"),
        })
    }
}
