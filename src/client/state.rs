//! Immutable channel snapshots, and the pure transition between them.

use std::sync::Arc;

use super::value::{FieldDescriptor, ValueEnvelope};
use crate::config::EnumNamePolicy;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionReason {
    NeverConnected,
    Established,
    Lost,
    Restored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub reason: ConnectionReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    pub valid: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    ChannelCreated,
    ConnectionEstablished(FieldDescriptor),
    ConnectionLost,
    ConnectionRestored,
    ValueAcquired(ValueEnvelope),
    ValueChanged(ValueEnvelope),
    ValidityChanged { valid: bool, reason: String },
}

/// The variant of a [`StateChange`] without its data
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StateChangeKind {
    ChannelCreated,
    ConnectionEstablished,
    ConnectionLost,
    ConnectionRestored,
    ValueAcquired,
    ValueChanged,
    ValidityChanged,
}

impl StateChange {
    pub fn kind(&self) -> StateChangeKind {
        match self {
            StateChange::ChannelCreated => StateChangeKind::ChannelCreated,
            StateChange::ConnectionEstablished(_) => StateChangeKind::ConnectionEstablished,
            StateChange::ConnectionLost => StateChangeKind::ConnectionLost,
            StateChange::ConnectionRestored => StateChangeKind::ConnectionRestored,
            StateChange::ValueAcquired(_) => StateChangeKind::ValueAcquired,
            StateChange::ValueChanged(_) => StateChangeKind::ValueChanged,
            StateChange::ValidityChanged { .. } => StateChangeKind::ValidityChanged,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSnapshot {
    pub sequence_number: u64,
    pub connection: ConnectionState,
    pub validity: Validity,
    pub field_descriptor: Option<FieldDescriptor>,
    /// The last value received; kept across disconnection
    pub value: Option<ValueEnvelope>,
}

impl Default for ChannelSnapshot {
    fn default() -> Self {
        ChannelSnapshot {
            sequence_number: 0,
            connection: ConnectionState {
                connected: false,
                reason: ConnectionReason::NeverConnected,
            },
            validity: Validity {
                valid: true,
                reason: None,
            },
            field_descriptor: None,
            value: None,
        }
    }
}

impl ChannelSnapshot {
    pub fn is_connected(&self) -> bool {
        self.connection.connected
    }
    pub fn is_valid(&self) -> bool {
        self.validity.valid
    }
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }
    pub fn enum_names(&self) -> Option<&[String]> {
        self.field_descriptor.as_ref()?.enum_names.as_deref()
    }

    /// The snapshot that follows this one after `change`
    pub fn apply(&self, change: &StateChange, policy: EnumNamePolicy) -> ChannelSnapshot {
        let mut next = self.clone();
        next.sequence_number = self.sequence_number + 1;
        match change {
            StateChange::ChannelCreated => (),
            StateChange::ConnectionEstablished(descriptor) => {
                let mut descriptor = descriptor.clone();
                // Learned names survive reconnection to the same kind of field
                if descriptor.enum_names.is_none()
                    && let Some(old) = &self.field_descriptor
                    && old.field_type == descriptor.field_type
                {
                    descriptor.enum_names = old.enum_names.clone();
                }
                next.field_descriptor = Some(descriptor);
                next.connection = ConnectionState {
                    connected: true,
                    reason: ConnectionReason::Established,
                };
            }
            StateChange::ConnectionLost => {
                next.connection = ConnectionState {
                    connected: false,
                    reason: ConnectionReason::Lost,
                };
            }
            StateChange::ConnectionRestored => {
                next.connection = ConnectionState {
                    connected: true,
                    reason: ConnectionReason::Restored,
                };
            }
            StateChange::ValueAcquired(envelope) | StateChange::ValueChanged(envelope) => {
                let mut envelope = envelope.clone();
                if let Some(descriptor) = next.field_descriptor.as_mut()
                    && let Some(names) = &envelope.enum_names
                    && (descriptor.enum_names.is_none()
                        || policy == EnumNamePolicy::RefreshOnEveryControlResponse)
                {
                    descriptor.enum_names = Some(names.clone());
                }
                if envelope.enum_names.is_none() {
                    envelope.enum_names = next.enum_names().map(<[String]>::to_vec);
                }
                next.value = Some(envelope);
            }
            StateChange::ValidityChanged { valid, reason } => {
                // Invalid is terminal
                if self.validity.valid {
                    next.validity = Validity {
                        valid: *valid,
                        reason: (!valid).then(|| reason.clone()),
                    };
                }
            }
        }
        next
    }
}

/// A snapshot together with the one it replaced and the change between them
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    pub snapshot: Arc<ChannelSnapshot>,
    pub previous: Option<Arc<ChannelSnapshot>>,
    pub change: Option<StateChange>,
}

impl StateRecord {
    pub fn initial() -> Self {
        StateRecord {
            snapshot: Arc::new(ChannelSnapshot::default()),
            previous: None,
            change: None,
        }
    }

    pub fn next(&self, change: StateChange, policy: EnumNamePolicy) -> StateRecord {
        StateRecord {
            snapshot: Arc::new(self.snapshot.apply(&change, policy)),
            previous: Some(self.snapshot.clone()),
            change: Some(change),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbr::{DbrBasicType, DbrValue};

    fn enum_value(index: u16, names: Option<&[&str]>) -> ValueEnvelope {
        let mut envelope = ValueEnvelope::new(DbrValue::Enum(vec![index]));
        envelope.enum_names = names.map(|n| n.iter().map(|s| s.to_string()).collect());
        envelope
    }

    fn connected_enum() -> ChannelSnapshot {
        ChannelSnapshot::default().apply(
            &StateChange::ConnectionEstablished(FieldDescriptor::new(DbrBasicType::Enum, 1, true)),
            EnumNamePolicy::FirstResponseOnly,
        )
    }

    #[test]
    fn every_transition_advances_by_one() {
        let policy = EnumNamePolicy::FirstResponseOnly;
        let changes = [
            StateChange::ChannelCreated,
            StateChange::ConnectionEstablished(FieldDescriptor::new(DbrBasicType::Long, 1, true)),
            StateChange::ValueAcquired(ValueEnvelope::new(DbrValue::Long(vec![1]))),
            StateChange::ConnectionLost,
            StateChange::ConnectionRestored,
            StateChange::ValueChanged(ValueEnvelope::new(DbrValue::Long(vec![2]))),
        ];
        let mut record = StateRecord::initial();
        for (i, change) in changes.into_iter().enumerate() {
            record = record.next(change, policy);
            assert_eq!(record.snapshot.sequence_number, i as u64 + 1);
            assert_eq!(
                record.previous.as_ref().unwrap().sequence_number,
                i as u64
            );
        }
        assert_eq!(
            record.snapshot.value.as_ref().unwrap().value,
            DbrValue::Long(vec![2])
        );
        assert_eq!(record.snapshot.connection.reason, ConnectionReason::Restored);
    }

    #[test]
    fn disconnection_keeps_last_value() {
        let policy = EnumNamePolicy::FirstResponseOnly;
        let snapshot = connected_enum()
            .apply(&StateChange::ValueAcquired(enum_value(1, None)), policy)
            .apply(&StateChange::ConnectionLost, policy);
        assert!(!snapshot.is_connected());
        assert!(snapshot.has_value());
    }

    #[test]
    fn enum_names_set_once_and_never_cleared() {
        let policy = EnumNamePolicy::FirstResponseOnly;
        let snapshot = connected_enum()
            .apply(&StateChange::ValueAcquired(enum_value(0, Some(&["A", "B"]))), policy)
            .apply(&StateChange::ValueChanged(enum_value(1, Some(&["X", "Y"]))), policy)
            .apply(&StateChange::ValueChanged(enum_value(1, None)), policy);
        assert_eq!(
            snapshot.enum_names(),
            Some(&["A".to_string(), "B".to_string()][..])
        );
        // Values arriving without names still get a label
        assert_eq!(snapshot.value.as_ref().unwrap().enum_label(), Some("B"));

        let refreshed = snapshot.apply(
            &StateChange::ValueChanged(enum_value(0, Some(&["X", "Y"]))),
            EnumNamePolicy::RefreshOnEveryControlResponse,
        );
        assert_eq!(refreshed.value.unwrap().enum_label(), Some("X"));
    }

    #[test]
    fn invalid_is_terminal() {
        let policy = EnumNamePolicy::FirstResponseOnly;
        let snapshot = ChannelSnapshot::default()
            .apply(
                &StateChange::ValidityChanged {
                    valid: false,
                    reason: "bad name".into(),
                },
                policy,
            )
            .apply(
                &StateChange::ValidityChanged {
                    valid: true,
                    reason: String::new(),
                },
                policy,
            );
        assert!(!snapshot.is_valid());
        assert_eq!(snapshot.validity.reason.as_deref(), Some("bad name"));
        assert_eq!(snapshot.sequence_number, 2);
    }
}
