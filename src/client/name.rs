use std::{fmt, str::FromStr};

use thiserror::Error;

pub const MAX_NAME_LENGTH: usize = 60;
pub const DEFAULT_FIELD: &str = "VAL";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("Channel name is empty")]
    Empty,
    #[error("Channel name is longer than {MAX_NAME_LENGTH} bytes")]
    TooLong,
    #[error("Channel name contains invalid character {0:?}")]
    InvalidCharacter(char),
    #[error("Channel name has more than one field separator")]
    MultipleFields,
    #[error("Channel name has an empty record name")]
    EmptyBase,
    #[error("Invalid field name '{0}'")]
    InvalidField(String),
}

/// A validated PV name, split into record and field
///
/// `RECORD` and `RECORD.VAL` name the same field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName {
    base_name: String,
    field_name: String,
}

impl ChannelName {
    pub fn parse(name: &str) -> Result<Self, NameError> {
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(NameError::TooLong);
        }
        if let Some(c) = name.chars().find(|c| !c.is_ascii_graphic()) {
            return Err(NameError::InvalidCharacter(c));
        }
        let (base, field) = match name.split_once('.') {
            None => (name, DEFAULT_FIELD),
            Some((_, field)) if field.contains('.') => return Err(NameError::MultipleFields),
            Some((base, field)) => (base, field),
        };
        if base.is_empty() {
            return Err(NameError::EmptyBase);
        }
        if field.is_empty()
            || field.len() > 4
            || !field
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        {
            return Err(NameError::InvalidField(field.to_owned()));
        }
        Ok(ChannelName {
            base_name: base.to_owned(),
            field_name: field.to_owned(),
        })
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }
    pub fn field_name(&self) -> &str {
        &self.field_name
    }
    pub fn is_value_field(&self) -> bool {
        self.field_name == DEFAULT_FIELD
    }
    /// The explicit `RECORD.FIELD` form
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.base_name, self.field_name)
    }
}

impl FromStr for ChannelName {
    type Err = NameError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_value_field() {
            f.write_str(&self.base_name)
        } else {
            write!(f, "{}.{}", self.base_name, self.field_name)
        }
    }
}
