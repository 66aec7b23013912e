//! What a channel knows about its field, and the values read from it.

use std::{fmt, time::SystemTime};

use thiserror::Error;

use crate::dbr::{
    ControlInfo, Dbr, DbrBasicType, DbrDisplay, DbrType, DbrValue, DecodeError, Status,
};

/// Native type and shape of a connected channel's field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub field_type: DbrBasicType,
    /// Server-declared capacity; values may be shorter
    pub element_count: usize,
    pub is_writable: bool,
    /// Option names of an enum field, once learned from a control-level response
    pub enum_names: Option<Vec<String>>,
}

impl FieldDescriptor {
    pub fn new(field_type: DbrBasicType, element_count: usize, is_writable: bool) -> Self {
        FieldDescriptor {
            field_type,
            element_count,
            is_writable,
            enum_names: None,
        }
    }

    /// Same field as another, ignoring learned enum names
    pub fn same_field(&self, other: &FieldDescriptor) -> bool {
        self.field_type == other.field_type
            && self.element_count == other.element_count
            && self.is_writable == other.is_writable
    }
}

/// A decoded value with whatever metadata the record type carried
#[derive(Debug, Clone, PartialEq)]
pub struct ValueEnvelope {
    pub value: DbrValue,
    pub alarm: Option<Status>,
    pub control: Option<ControlInfo>,
    pub enum_names: Option<Vec<String>>,
    pub server_timestamp: Option<SystemTime>,
}

impl ValueEnvelope {
    pub fn new(value: DbrValue) -> Self {
        ValueEnvelope {
            value,
            alarm: None,
            control: None,
            enum_names: None,
            server_timestamp: None,
        }
    }

    /// First element converted to `T`, if it converts
    pub fn as_scalar<T>(&self) -> Option<T>
    where
        for<'a> Vec<T>: TryFrom<&'a DbrValue>,
    {
        self.value.first()
    }

    /// The option name of an enum value, when the names are known
    pub fn enum_label(&self) -> Option<&str> {
        let DbrValue::Enum(indices) = &self.value else {
            return None;
        };
        let index = *indices.first()? as usize;
        self.enum_names
            .as_ref()?
            .get(index)
            .map(String::as_str)
    }

    fn from_dbr(dbr: Dbr) -> Self {
        let alarm = dbr.status();
        let server_timestamp = dbr.timestamp();
        let (control, enum_names) = match dbr.display() {
            Some(DbrDisplay::Numeric(info)) => (Some(info.clone()), None),
            Some(DbrDisplay::EnumStrings(names)) if !names.is_empty() => {
                (None, Some(names.clone()))
            }
            _ => (None, None),
        };
        ValueEnvelope {
            value: dbr.take_value(),
            alarm,
            control,
            enum_names,
            server_timestamp,
        }
    }
}

impl fmt::Display for ValueEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.enum_label() {
            Some(label) => f.write_str(label)?,
            None => write!(f, "{}", self.value)?,
        }
        if let Some(units) = self.control.as_ref().map(|c| c.units.as_str())
            && !units.is_empty()
        {
            write!(f, " {units}")?;
        }
        if let Some(alarm) = self.alarm.filter(Status::is_alarm) {
            write!(f, " (status={} severity={})", alarm.status, alarm.severity)?;
        }
        Ok(())
    }
}

/// Decode a received payload into a value envelope
///
/// `Ok(None)` means the record carried no value.
pub fn decode(
    dbr_type: DbrType,
    element_count: usize,
    buffer: &[u8],
) -> Result<Option<ValueEnvelope>, DecodeError> {
    Ok(Dbr::from_bytes(dbr_type, element_count, buffer)?.map(ValueEnvelope::from_dbr))
}

/// Decode a payload whose record type is the raw protocol tag
///
/// # Panics
///
/// If `type_tag` is not a known DBR type.
pub fn decode_tagged(
    type_tag: u16,
    element_count: usize,
    buffer: &[u8],
) -> Result<Option<ValueEnvelope>, DecodeError> {
    Ok(Dbr::from_tagged_bytes(type_tag, element_count, buffer)?.map(ValueEnvelope::from_dbr))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Cannot convert {from} value to {to}")]
    NoConvert { from: DbrBasicType, to: DbrBasicType },
    #[error("'{0}' is not one of the enum option names")]
    UnknownEnumName(String),
    #[error("{count} elements do not fit in a field of {capacity}")]
    TooManyElements { count: usize, capacity: usize },
    #[error("Nothing to write")]
    Empty,
}

/// Convert a value to a field's native type, and pack it for writing
///
/// Returns the element count and a buffer of exactly `count` native elements.
pub fn encode_put(
    descriptor: &FieldDescriptor,
    value: &DbrValue,
) -> Result<(usize, Vec<u8>), EncodeError> {
    let target = descriptor.field_type;
    let no_convert = || EncodeError::NoConvert {
        from: value.get_type(),
        to: target,
    };
    let native = match (value, target) {
        (DbrValue::String(labels), DbrBasicType::Enum) => {
            DbrValue::Enum(enum_indices(labels, descriptor.enum_names.as_deref())?)
        }
        (DbrValue::String(_), DbrBasicType::String) => value.clone(),
        // A single string written to a character array is sent as its bytes
        (DbrValue::String(_), DbrBasicType::Byte) if value.get_count() == 1 => {
            match value.parse_into(DbrBasicType::Byte) {
                Ok(parsed) => parsed,
                Err(_) => value.convert_to(target).map_err(|_| no_convert())?,
            }
        }
        (DbrValue::String(_), _) => value.parse_into(target).map_err(|_| no_convert())?,
        _ => value.convert_to(target).map_err(|_| no_convert())?,
    };
    let count = native.get_count();
    if count == 0 {
        return Err(EncodeError::Empty);
    }
    if count > descriptor.element_count {
        return Err(EncodeError::TooManyElements {
            count,
            capacity: descriptor.element_count,
        });
    }
    Ok(native.to_bytes(None))
}

fn enum_indices(labels: &[String], names: Option<&[String]>) -> Result<Vec<u16>, EncodeError> {
    labels
        .iter()
        .map(|label| {
            names
                .and_then(|names| names.iter().position(|n| n == label))
                .and_then(|i| u16::try_from(i).ok())
                .or_else(|| label.trim().parse().ok())
                .ok_or_else(|| EncodeError::UnknownEnumName(label.clone()))
        })
        .collect()
}
