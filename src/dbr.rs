//! Represent CA DBR representations, for data interchange.
//!
//! CA defines thirty-five [DBR] kinds as special structures used to transfer data back
//! and forth. These can be broken down into seven basic array types, which define the
//! data, and five categories of attached metadata. This module models this, and
//! provides the byte-level codec used for every value that crosses the transport
//! boundary: decoding of received payloads, and packing of values for writes.
//!
//! The basic types are enumerated in [`DbrBasicType`] and are represented in
//! [`DbrValue`]. Every variant holds a vector, as any field may be an array on the
//! server; a scalar field simply has an element count of one:
//! - [`DbrValue::String`] - natively in CA this is a `[u8; 40]`, for interchange
//!   here it is a [`String`] per element, converted to and from the NUL-padded fixed
//!   width slot as required. At most 39 bytes survive encoding.
//! - [`DbrValue::Short`] ([`Vec<i16>`]), also known as `INT` in the protocol.
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Enum`] ([`Vec<u16>`]) - an index into a table of up to sixteen
//!   26-character option names, only delivered with [`DbrCategory::Graphics`] or
//!   [`DbrCategory::Control`] records.
//! - [`DbrValue::Byte`] ([`Vec<u8>`]), `CHAR` in the protocol.
//! - [`DbrValue::Long`] ([`Vec<i32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//!
//! In CA, these seven data types can be sent with five kinds of metadata attached.
//! These are enumerated by [`DbrCategory`] and represented by [`Dbr`]:
//! - [`Dbr::Basic`] - No extra metadata included, just the plain data value.
//! - [`Dbr::Status`] - Alarm status and severity in addition to the data.
//! - [`Dbr::Time`] - All of [`Dbr::Status`], with the server timestamp.
//! - [`Dbr::Graphics`] - Alarm status plus units, precision and display, warning and
//!   alarm limits, or the option names of an enum.
//! - [`Dbr::Control`] - All of [`Dbr::Graphics`] plus the drive (control) limits.
//!
//! The special `DBR_CLASS_NAME` request, returning the record type of the PV, is
//! represented by [`Dbr::ClassName`].
//!
//! Both [`DbrCategory`] and [`DbrBasicType`] are combined in the [`DbrType`] struct,
//! which provides interfaces to convert to/from the integer representation of types
//! used by the CA protocol.
//!
//! [DBR]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types
//!
use nom::{
    IResult, Parser,
    bytes::complete::take,
    multi::count,
    number::complete::{be_f32, be_f64, be_i16, be_i32, be_u8, be_u16, be_u32},
};
use num::{NumCast, cast::AsPrimitive};
use std::{
    cmp,
    convert::TryFrom,
    fmt,
    io::{self, Cursor},
    num::NonZeroUsize,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

use crate::transport::ErrorCondition;

// Constants from EPICS
pub const MAX_STRING_SIZE: usize = 40;
pub const MAX_UNITS_SIZE: usize = 8;
pub const MAX_ENUM_STRING_SIZE: usize = 26;
pub const MAX_ENUM_STATES: usize = 16;
/// Seconds between the UNIX epoch and the EPICS epoch, 1990-01-01 00:00 UTC
pub const EPICS_EPOCH_OFFSET: u64 = 631_152_000;

type NomError<'a> = nom::error::Error<&'a [u8]>;

/// Errors from decoding a received DBR payload
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Payload ended while reading {0}")]
    Truncated(&'static str),
}

/// Errors from the fixed-table conversions between wire tags and types
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Unknown DBR type tag: {0}")]
pub struct UnknownTypeTag(pub u16);

/// Encode a String to a fixed-width, NUL padded byte array
///
/// Problem: We want to convert a string to a byte sequence but never a length >=
/// `width` (there must always be a terminating NUL). But we can't convert and
/// truncate because although we don't _expect_ to ever handle non-ASCII it
/// technically isn't guaranteed. So, convert one-character-at-a-time until the
/// length would go over.
fn fixed_width_bytes(value: &str, width: usize) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(width);
    for c in value.chars() {
        if buffer.len() + c.len_utf8() < width {
            let mut char_buffer = [0u8; 4];
            buffer.extend_from_slice(c.encode_utf8(&mut char_buffer).as_bytes());
        } else {
            break;
        }
    }
    buffer.resize(width, 0u8);
    buffer
}

/// Read a NUL-terminated string out of a fixed-width slot
fn read_fixed_string(raw: &[u8]) -> String {
    let strlen = raw.iter().position(|&c| c == 0x00).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..strlen]).into_owned()
}

/// Represent actual data transferred over CA
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    String(Vec<String>),
    Short(Vec<i16>),
    Float(Vec<f32>),
    Enum(Vec<u16>),
    Byte(Vec<u8>),
    Long(Vec<i32>),
    Double(Vec<f64>),
}

/// Types of errors that can be returned from [`DbrValue::parse_into`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DbrParseError {
    #[error("Only string values can be parsed")]
    SelfIsNotString,
    #[error("Could not parse '{0}' as the requested type")]
    CannotParse(String),
}

impl DbrValue {
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::String(val) => val.len(),
            DbrValue::Short(val) => val.len(),
            DbrValue::Float(val) => val.len(),
            DbrValue::Enum(val) => val.len(),
            DbrValue::Byte(val) => val.len(),
            DbrValue::Long(val) => val.len(),
            DbrValue::Double(val) => val.len(),
        }
    }
    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Short(_) => DbrBasicType::Short,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::Byte(_) => DbrBasicType::Byte,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// The default EPICS record type a value of this kind is served from
    pub fn get_default_record_type(&self) -> &'static str {
        match self {
            DbrValue::Enum(_) => "mbbo",
            DbrValue::String(_) => "stringout",
            DbrValue::Byte(_) | DbrValue::Short(_) | DbrValue::Long(_) => "longout",
            DbrValue::Float(_) | DbrValue::Double(_) => "ao",
        }
    }

    /// Convert a DbrValue::String to another data type by parsing the numeric string
    ///
    /// Fails if the DbrValue is not String or if the value cannot be parsed. Asking
    /// for a convertion from String->String just copies without doing any extra parsing.
    pub fn parse_into(&self, basic_type: DbrBasicType) -> Result<DbrValue, DbrParseError> {
        fn _parse_all<T: FromStr>(from: &[String]) -> Result<Vec<T>, DbrParseError> {
            from.iter()
                .map(|s| {
                    s.trim()
                        .parse()
                        .map_err(|_| DbrParseError::CannotParse(s.clone()))
                })
                .collect()
        }
        let DbrValue::String(val) = self else {
            return Err(DbrParseError::SelfIsNotString);
        };
        Ok(match basic_type {
            DbrBasicType::String => self.clone(),
            DbrBasicType::Short => DbrValue::Short(_parse_all(val)?),
            DbrBasicType::Float => DbrValue::Float(_parse_all(val)?),
            DbrBasicType::Enum => DbrValue::Enum(_parse_all(val)?),
            DbrBasicType::Byte => DbrValue::Byte(_parse_all(val)?),
            DbrBasicType::Long => DbrValue::Long(_parse_all(val)?),
            DbrBasicType::Double => DbrValue::Double(_parse_all(val)?),
        })
    }

    /// Convert to another basic type, failing if any element is not representable
    ///
    /// Numeric types convert between each other as long as the value fits (floats
    /// are truncated towards zero). Numbers become their decimal string form. A
    /// single string converts to a [`DbrValue::Byte`] array of its characters, and
    /// back, which is the way long strings are carried in CA.
    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ErrorCondition> {
        /// Utility function so that we don't have to repeat the map iter conversion
        fn _try_convert_vec<T, U>(from: &[T]) -> Result<Vec<U>, ErrorCondition>
        where
            T: Copy + NumCast,
            U: NumCast,
        {
            from.iter()
                .map(|n| NumCast::from(*n).ok_or(ErrorCondition::NoConvert))
                .collect()
        }
        /// Convert a single-item string to a character array
        fn _encode_string<T>(from: &[String]) -> Result<Vec<T>, ErrorCondition>
        where
            T: Copy + 'static,
            u8: AsPrimitive<T>,
        {
            Ok(match from {
                [] => Vec::new(),
                [val] => val.as_bytes().iter().map(|c| c.as_()).collect(),
                _ => Err(ErrorCondition::NoConvert)?,
            })
        }
        fn _stringify<T: ToString>(from: &[T]) -> Vec<String> {
            from.iter().map(|v| v.to_string()).collect()
        }
        macro_rules! numeric_into {
            ($variant:ident) => {
                match self {
                    DbrValue::Short(val) => DbrValue::$variant(_try_convert_vec(val)?),
                    DbrValue::Float(val) => DbrValue::$variant(_try_convert_vec(val)?),
                    DbrValue::Enum(val) => DbrValue::$variant(_try_convert_vec(val)?),
                    DbrValue::Byte(val) => DbrValue::$variant(_try_convert_vec(val)?),
                    DbrValue::Long(val) => DbrValue::$variant(_try_convert_vec(val)?),
                    DbrValue::Double(val) => DbrValue::$variant(_try_convert_vec(val)?),
                    DbrValue::String(_) => return Err(ErrorCondition::NoConvert),
                }
            };
        }

        if self.get_type() == basic_type {
            return Ok(self.clone());
        }
        Ok(match basic_type {
            DbrBasicType::Byte => match self {
                DbrValue::String(val) => DbrValue::Byte(_encode_string(val)?),
                _ => numeric_into!(Byte),
            },
            DbrBasicType::Short => numeric_into!(Short),
            DbrBasicType::Long => numeric_into!(Long),
            DbrBasicType::Float => numeric_into!(Float),
            DbrBasicType::Double => numeric_into!(Double),
            DbrBasicType::Enum => numeric_into!(Enum),
            DbrBasicType::String => match self {
                DbrValue::Byte(val) => DbrValue::String(vec![read_fixed_string(val)]),
                DbrValue::Short(val) => DbrValue::String(_stringify(val)),
                DbrValue::Float(val) => DbrValue::String(_stringify(val)),
                DbrValue::Enum(val) => DbrValue::String(_stringify(val)),
                DbrValue::Long(val) => DbrValue::String(_stringify(val)),
                DbrValue::Double(val) => DbrValue::String(_stringify(val)),
                DbrValue::String(_) => unreachable!("same-type conversion returned above"),
            },
        })
    }

    /// Encode the value contents of a DBR into a byte vector
    ///
    /// If max_elems is `None`, then all elements available will be returned.
    ///
    /// Returns the number of elements along with the bytes
    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let elements = if let Some(max_elem) = max_elems {
            cmp::min(max_elem.into(), self.get_count())
        } else {
            self.get_count()
        };

        (
            elements,
            match self {
                DbrValue::String(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| fixed_width_bytes(v, MAX_STRING_SIZE))
                    .collect(),
                DbrValue::Short(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Float(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Enum(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Byte(val) => val.iter().take(elements).copied().collect(),
                DbrValue::Long(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Double(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
            },
        )
    }

    /// Decode `item_count` elements of a basic type from the start of `data`
    ///
    /// If the buffer holds fewer complete elements than requested, only the
    /// elements actually present are decoded; this never reads past the buffer.
    pub fn decode_value(
        data_type: DbrBasicType,
        item_count: usize,
        data: &[u8],
    ) -> Result<DbrValue, DecodeError> {
        let available = data.len() / data_type.element_size();
        let n = cmp::min(item_count, available);
        let err = |_| DecodeError::Truncated("value");
        Ok(match data_type {
            DbrBasicType::String => DbrValue::String(
                data.chunks_exact(MAX_STRING_SIZE)
                    .take(n)
                    .map(read_fixed_string)
                    .collect(),
            ),
            DbrBasicType::Short => {
                DbrValue::Short(count(be_i16::<&[u8], NomError>, n).parse(data).map_err(err)?.1)
            }
            DbrBasicType::Float => {
                DbrValue::Float(count(be_f32::<&[u8], NomError>, n).parse(data).map_err(err)?.1)
            }
            DbrBasicType::Enum => {
                DbrValue::Enum(count(be_u16::<&[u8], NomError>, n).parse(data).map_err(err)?.1)
            }
            DbrBasicType::Byte => DbrValue::Byte(data[..n].to_vec()),
            DbrBasicType::Long => {
                DbrValue::Long(count(be_i32::<&[u8], NomError>, n).parse(data).map_err(err)?.1)
            }
            DbrBasicType::Double => {
                DbrValue::Double(count(be_f64::<&[u8], NomError>, n).parse(data).map_err(err)?.1)
            }
        })
    }

    /// Fetch the first element, converted to the requested scalar type
    pub fn first<T>(&self) -> Option<T>
    where
        for<'a> Vec<T>: TryFrom<&'a DbrValue>,
    {
        let values: Vec<T> = self.try_into().ok()?;
        values.into_iter().next()
    }
}

impl fmt::Display for DbrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn _join<T: fmt::Display>(values: &[T]) -> String {
            values
                .iter()
                .map(|v| format!("{v}"))
                .collect::<Vec<String>>()
                .join(" ")
        }
        let display = match self {
            DbrValue::String(s) => s.join(" "),
            DbrValue::Short(v) => _join(v),
            DbrValue::Float(v) => _join(v),
            DbrValue::Enum(v) => _join(v),
            DbrValue::Byte(v) => _join(v),
            DbrValue::Long(v) => _join(v),
            DbrValue::Double(v) => _join(v),
        };
        f.write_str(&display)
    }
}

/// Implement a From<datatype> for a specific dbrvalue kind
macro_rules! impl_dbrvalue_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl From<&$typ> for DbrValue {
            fn from(value: &$typ) -> Self {
                DbrValue::$variant(vec![value.clone()])
            }
        }
        impl TryFrom<&DbrValue> for Vec<$typ> {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                Ok(match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => v,
                    _ => unreachable!(),
                })
            }
        }
    };
}
impl_dbrvalue_conversions_between!(Short, i16);
impl_dbrvalue_conversions_between!(Float, f32);
impl_dbrvalue_conversions_between!(Enum, u16);
impl_dbrvalue_conversions_between!(Byte, u8);
impl_dbrvalue_conversions_between!(Long, i32);
impl_dbrvalue_conversions_between!(Double, f64);
impl_dbrvalue_conversions_between!(String, String);

macro_rules! impl_dbrvalue_copy_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
    };
}
impl_dbrvalue_copy_conversions_between!(Short, i16);
impl_dbrvalue_copy_conversions_between!(Float, f32);
impl_dbrvalue_copy_conversions_between!(Enum, u16);
impl_dbrvalue_copy_conversions_between!(Byte, u8);
impl_dbrvalue_copy_conversions_between!(Long, i32);
impl_dbrvalue_copy_conversions_between!(Double, f64);
impl_dbrvalue_copy_conversions_between!(String, String);

impl From<&str> for DbrValue {
    fn from(value: &str) -> Self {
        DbrValue::String(vec![value.to_owned()])
    }
}

/// A lower/upper pair of limits, widened to f64 whatever the field type
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Limits {
    pub lower: f64,
    pub upper: f64,
}

impl Limits {
    pub fn new(lower: f64, upper: f64) -> Self {
        Limits { lower, upper }
    }
}

/// Units, precision and limits of a numeric field
///
/// `precision` is only carried by Float and Double fields, `drive_limits` only
/// by [`DbrCategory::Control`] records.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlInfo {
    pub units: String,
    pub precision: Option<i16>,
    pub display_limits: Limits,
    pub warning_limits: Limits,
    pub alarm_limits: Limits,
    pub drive_limits: Option<Limits>,
}

/// Metadata carried by Graphics and Control records
#[derive(Clone, Debug, PartialEq)]
pub enum DbrDisplay {
    /// String fields have no display metadata
    Plain,
    /// Option names of an enum field, exactly as many as the server reported
    EnumStrings(Vec<String>),
    Numeric(ControlInfo),
}

impl DbrDisplay {
    pub fn default_for(kind: DbrBasicType) -> Self {
        match kind {
            DbrBasicType::String => DbrDisplay::Plain,
            DbrBasicType::Enum => DbrDisplay::EnumStrings(Vec::new()),
            DbrBasicType::Float | DbrBasicType::Double => DbrDisplay::Numeric(ControlInfo {
                precision: Some(0),
                ..Default::default()
            }),
            _ => DbrDisplay::Numeric(ControlInfo::default()),
        }
    }

    /// Read the metadata block of a Graphics/Control record
    fn parse(
        kind: DbrBasicType,
        with_drive_limits: bool,
        input: &[u8],
    ) -> IResult<&[u8], DbrDisplay> {
        match kind {
            DbrBasicType::String => Ok((input, DbrDisplay::Plain)),
            DbrBasicType::Enum => {
                let (input, no_str) = be_i16::<&[u8], NomError>(input)?;
                let (input, table) =
                    take::<_, &[u8], NomError>(MAX_ENUM_STATES * MAX_ENUM_STRING_SIZE)
                        .parse(input)?;
                let used = (no_str.max(0) as usize).min(MAX_ENUM_STATES);
                let names = table
                    .chunks_exact(MAX_ENUM_STRING_SIZE)
                    .take(used)
                    .map(read_fixed_string)
                    .collect();
                Ok((input, DbrDisplay::EnumStrings(names)))
            }
            _ => {
                let (input, precision) = if kind.has_precision() {
                    let (input, (precision, _pad)) =
                        (be_i16::<&[u8], NomError>, be_i16).parse(input)?;
                    (input, Some(precision))
                } else {
                    (input, None)
                };
                let (input, units) = take::<_, &[u8], NomError>(MAX_UNITS_SIZE).parse(input)?;
                let n_limits = if with_drive_limits { 8 } else { 6 };
                let (input, l) = count(|i| kind.parse_limit(i), n_limits).parse(input)?;
                // Order on the wire: upper display, lower display, upper alarm,
                // upper warning, lower warning, lower alarm, upper ctrl, lower ctrl
                Ok((
                    input,
                    DbrDisplay::Numeric(ControlInfo {
                        units: read_fixed_string(units),
                        precision,
                        display_limits: Limits::new(l[1], l[0]),
                        alarm_limits: Limits::new(l[5], l[2]),
                        warning_limits: Limits::new(l[4], l[3]),
                        drive_limits: with_drive_limits.then(|| Limits::new(l[7], l[6])),
                    }),
                ))
            }
        }
    }

    fn to_bytes(&self, kind: DbrBasicType, with_drive_limits: bool) -> Vec<u8> {
        match self {
            DbrDisplay::Plain => Vec::new(),
            DbrDisplay::EnumStrings(names) => {
                let used = names.len().min(MAX_ENUM_STATES);
                let mut out = (used as i16).to_be_bytes().to_vec();
                for i in 0..MAX_ENUM_STATES {
                    let name = names.get(i).map(String::as_str).unwrap_or("");
                    out.extend(fixed_width_bytes(name, MAX_ENUM_STRING_SIZE));
                }
                out
            }
            DbrDisplay::Numeric(info) => {
                let mut out = Vec::new();
                if kind.has_precision() {
                    out.extend(info.precision.unwrap_or(0).to_be_bytes());
                    out.extend(0i16.to_be_bytes());
                }
                out.extend(fixed_width_bytes(&info.units, MAX_UNITS_SIZE));
                let mut limits = vec![
                    info.display_limits.upper,
                    info.display_limits.lower,
                    info.alarm_limits.upper,
                    info.warning_limits.upper,
                    info.warning_limits.lower,
                    info.alarm_limits.lower,
                ];
                if with_drive_limits {
                    let drive = info.drive_limits.unwrap_or_default();
                    limits.extend([drive.upper, drive.lower]);
                }
                for limit in limits {
                    out.extend(kind.limit_to_bytes(limit));
                }
                out
            }
        }
    }
}

/// Basic DBR Data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrBasicType {
    String = 0,
    Short = 1,
    Float = 2,
    Enum = 3,
    Byte = 4,
    Long = 5,
    Double = 6,
}

impl TryFrom<u16> for DbrBasicType {
    type Error = UnknownTypeTag;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::String as u16 => Ok(Self::String),
            x if x == Self::Short as u16 => Ok(Self::Short),
            x if x == Self::Float as u16 => Ok(Self::Float),
            x if x == Self::Enum as u16 => Ok(Self::Enum),
            x if x == Self::Byte as u16 => Ok(Self::Byte),
            x if x == Self::Long as u16 => Ok(Self::Long),
            x if x == Self::Double as u16 => Ok(Self::Double),
            _ => Err(UnknownTypeTag(value)),
        }
    }
}

impl DbrBasicType {
    /// Size in bytes of a single element of this type on the wire
    pub fn element_size(&self) -> usize {
        match self {
            DbrBasicType::String => MAX_STRING_SIZE,
            DbrBasicType::Short | DbrBasicType::Enum => 2,
            DbrBasicType::Float | DbrBasicType::Long => 4,
            DbrBasicType::Byte => 1,
            DbrBasicType::Double => 8,
        }
    }
    fn has_precision(&self) -> bool {
        matches!(self, DbrBasicType::Float | DbrBasicType::Double)
    }
    fn parse_limit<'a>(&self, input: &'a [u8]) -> IResult<&'a [u8], f64> {
        match self {
            DbrBasicType::Short => be_i16(input).map(|(i, v)| (i, <f64 as From<_>>::from(v))),
            DbrBasicType::Float => be_f32(input).map(|(i, v)| (i, <f64 as From<_>>::from(v))),
            DbrBasicType::Byte => be_u8(input).map(|(i, v)| (i, <f64 as From<_>>::from(v))),
            DbrBasicType::Long => be_i32(input).map(|(i, v)| (i, <f64 as From<_>>::from(v))),
            DbrBasicType::Double => be_f64(input),
            DbrBasicType::String | DbrBasicType::Enum => {
                unreachable!("{self:?} fields carry no numeric limits")
            }
        }
    }
    fn limit_to_bytes(&self, value: f64) -> Vec<u8> {
        match self {
            DbrBasicType::Short => (value as i16).to_be_bytes().to_vec(),
            DbrBasicType::Float => (value as f32).to_be_bytes().to_vec(),
            DbrBasicType::Byte => vec![value as u8],
            DbrBasicType::Long => (value as i32).to_be_bytes().to_vec(),
            DbrBasicType::Double => value.to_be_bytes().to_vec(),
            DbrBasicType::String | DbrBasicType::Enum => Vec::new(),
        }
    }
}

impl fmt::Display for DbrBasicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DbrBasicType::String => "STRING",
            DbrBasicType::Short => "SHORT",
            DbrBasicType::Float => "FLOAT",
            DbrBasicType::Enum => "ENUM",
            DbrBasicType::Byte => "CHAR",
            DbrBasicType::Long => "LONG",
            DbrBasicType::Double => "DOUBLE",
        })
    }
}

/// Mapping of DBR categories
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
    /// The special single-valued DBR_CLASS_NAME
    ClassName = 8,
}
impl TryFrom<u16> for DbrCategory {
    type Error = UnknownTypeTag;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::Basic as u16 => Ok(Self::Basic),
            x if x == Self::Status as u16 => Ok(Self::Status),
            x if x == Self::Time as u16 => Ok(Self::Time),
            x if x == Self::Graphics as u16 => Ok(Self::Graphics),
            x if x == Self::Control as u16 => Ok(Self::Control),
            _ => Err(UnknownTypeTag(value)),
        }
    }
}

/// How much metadata a caller wants alongside the value
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ValueAccessMode {
    #[default]
    ValueOnly,
    /// Alarm status and severity
    WithStatus,
    /// Alarm status and server timestamp
    WithTimestamp,
    /// Alarm status, units, precision and limits (or enum option names)
    WithControl,
}

impl ValueAccessMode {
    pub fn category(&self) -> DbrCategory {
        match self {
            ValueAccessMode::ValueOnly => DbrCategory::Basic,
            ValueAccessMode::WithStatus => DbrCategory::Status,
            ValueAccessMode::WithTimestamp => DbrCategory::Time,
            ValueAccessMode::WithControl => DbrCategory::Control,
        }
    }
}

impl FromStr for ValueAccessMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "value" | "basic" => ValueAccessMode::ValueOnly,
            "status" | "sts" => ValueAccessMode::WithStatus,
            "time" => ValueAccessMode::WithTimestamp,
            "control" | "ctrl" => ValueAccessMode::WithControl,
            other => return Err(format!("Unknown access mode '{other}'")),
        })
    }
}

/// Represent and translate from ID every possible combination of `DBR_*_*`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

pub const DBR_CLASS_NAME: DbrType = DbrType {
    basic_type: DbrBasicType::String,
    category: DbrCategory::ClassName,
};

impl TryFrom<u16> for DbrType {
    type Error = UnknownTypeTag;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            38 => Ok(DBR_CLASS_NAME),
            value if value < 35 => Ok(Self {
                basic_type: (value % 7).try_into().map_err(|_| UnknownTypeTag(value))?,
                category: (value / 7).try_into().map_err(|_| UnknownTypeTag(value))?,
            }),
            _ => Err(UnknownTypeTag(value)),
        }
    }
}

impl From<DbrType> for u16 {
    fn from(value: DbrType) -> Self {
        match value {
            DBR_CLASS_NAME => 38,
            value => value.category as u16 * 7 + value.basic_type as u16,
        }
    }
}

impl DbrType {
    pub fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }

    /// Give the lookup for the padding for each DBR type
    ///
    /// When encoding a return packet, there is a datatype-specific
    /// padding to be inserted between the metadata about the value and
    /// the actual value itself. This is given as a lookup table rather
    /// than a calculations. The precision padding of Graphics/Control
    /// floating point records sits inside the metadata block, and is
    /// handled there.
    ///
    /// See <https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types>
    pub fn get_metadata_padding(&self) -> usize {
        match (self.category, self.basic_type) {
            (DbrCategory::Status, DbrBasicType::Byte) => 1,
            (DbrCategory::Status, DbrBasicType::Double) => 4,
            (DbrCategory::Time, DbrBasicType::Short) => 2,
            (DbrCategory::Time, DbrBasicType::Enum) => 2,
            (DbrCategory::Time, DbrBasicType::Byte) => 3,
            (DbrCategory::Time, DbrBasicType::Double) => 4,
            (DbrCategory::Graphics, DbrBasicType::Byte) => 1,
            (DbrCategory::Control, DbrBasicType::Byte) => 1,
            _ => 0,
        }
    }

    /// Size of everything in front of the first value element
    pub fn header_size(&self) -> usize {
        let metadata = match self.category {
            DbrCategory::Basic | DbrCategory::ClassName => 0,
            DbrCategory::Status => 4,
            DbrCategory::Time => 12,
            DbrCategory::Graphics | DbrCategory::Control => {
                let drive = self.category == DbrCategory::Control;
                4 + DbrDisplay::default_for(self.basic_type)
                    .to_bytes(self.basic_type, drive)
                    .len()
            }
        };
        metadata + self.get_metadata_padding()
    }

    /// Exact payload size for `element_count` elements of this type
    pub fn payload_size(&self, element_count: usize) -> usize {
        self.header_size() + element_count * self.basic_type.element_size()
    }
}

impl FromStr for DbrType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        let mut s: &str = &upper;
        if s.starts_with("DBR_") {
            s = &s[4..];
        };
        let category = if let Some(split) = s.find("_") {
            let cats = &s[..split];
            s = &s[split + 1..];
            match cats {
                "BASIC" => DbrCategory::Basic,
                "STS" => DbrCategory::Status,
                "TIME" => DbrCategory::Time,
                "GR" => DbrCategory::Graphics,
                "CTRL" => DbrCategory::Control,
                "CLASS" => DbrCategory::ClassName,
                _ => return Err(()),
            }
        } else {
            DbrCategory::Basic
        };
        let kind = match s {
            "STRING" => DbrBasicType::String,
            "INT" => DbrBasicType::Short,
            "SHORT" => DbrBasicType::Short,
            "FLOAT" => DbrBasicType::Float,
            "ENUM" => DbrBasicType::Enum,
            "CHAR" => DbrBasicType::Byte,
            "LONG" => DbrBasicType::Long,
            "DOUBLE" => DbrBasicType::Double,
            "NAME" if category == DbrCategory::ClassName => DbrBasicType::String,
            _ => return Err(()),
        };
        if matches!(category, DbrCategory::ClassName) && !matches!(kind, DbrBasicType::String) {
            // Class name is _only_ CLASS_NAME
            return Err(());
        }
        Ok(DbrType {
            basic_type: kind,
            category,
        })
    }
}

impl fmt::Display for DbrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let category = match self.category {
            DbrCategory::Basic => "",
            DbrCategory::Status => "STS_",
            DbrCategory::Time => "TIME_",
            DbrCategory::Graphics => "GR_",
            DbrCategory::Control => "CTRL_",
            DbrCategory::ClassName => return f.write_str("DBR_CLASS_NAME"),
        };
        write!(f, "DBR_{category}{}", self.basic_type)
    }
}

/// Represent alarm status of the record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

impl Status {
    /// Is the record in any alarm state (severity MINOR or worse)?
    pub fn is_alarm(&self) -> bool {
        self.severity > 0
    }
    fn parse(input: &[u8]) -> IResult<&[u8], Status> {
        let (input, (status, severity)) = (be_i16::<&[u8], NomError>, be_i16).parse(input)?;
        Ok((input, Status { status, severity }))
    }
}

fn parse_timestamp(input: &[u8]) -> IResult<&[u8], SystemTime> {
    let (input, (time_s, time_ns)) = (be_u32::<&[u8], NomError>, be_u32).parse(input)?;
    let since_unix = Duration::from_secs(time_s as u64 + EPICS_EPOCH_OFFSET)
        + Duration::from_nanos(time_ns as u64);
    Ok((input, UNIX_EPOCH + since_unix))
}

/// Structured unit of exchange for records in the CA protocol
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(DbrValue),
    /// Alarm status metadata alongside the record value
    Status { status: Status, value: DbrValue },
    /// Timestamp, alarm status, and value
    Time {
        status: Status,
        timestamp: SystemTime,
        value: DbrValue,
    },
    /// Alarm status, display metadata, and value
    Graphics {
        status: Status,
        display: DbrDisplay,
        value: DbrValue,
    },
    /// Alarm status, display metadata including drive limits, and value
    Control {
        status: Status,
        display: DbrDisplay,
        value: DbrValue,
    },
    ClassName(DbrValue),
}

impl Dbr {
    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
            Dbr::ClassName(value) => value,
        }
    }
    /// Retrieve the [`DbrValue`] contained by this DBR
    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
            Dbr::ClassName(value) => value,
        }
    }
    /// If a DBR type encoding alarm status, fetch that
    pub fn status(&self) -> Option<Status> {
        match self {
            Dbr::Basic(_) | Dbr::ClassName(_) => None,
            Dbr::Status { status, .. } => Some(*status),
            Dbr::Time { status, .. } => Some(*status),
            Dbr::Graphics { status, .. } => Some(*status),
            Dbr::Control { status, .. } => Some(*status),
        }
    }
    pub fn timestamp(&self) -> Option<SystemTime> {
        match self {
            Dbr::Time { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }
    pub fn display(&self) -> Option<&DbrDisplay> {
        match self {
            Dbr::Graphics { display, .. } | Dbr::Control { display, .. } => Some(display),
            _ => None,
        }
    }
    pub fn data_type(&self) -> DbrType {
        let category = match self {
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Status { .. } => DbrCategory::Status,
            Dbr::Time { .. } => DbrCategory::Time,
            Dbr::Graphics { .. } => DbrCategory::Graphics,
            Dbr::Control { .. } => DbrCategory::Control,
            Dbr::ClassName(_) => return DBR_CLASS_NAME,
        };
        DbrType::new(self.value().get_type(), category)
    }

    /// Build a record of the requested type from a value and its metadata
    ///
    /// The value is converted to the basic type of `dbr_type`; metadata that the
    /// requested category does not carry is dropped.
    pub fn assemble(
        dbr_type: DbrType,
        value: &DbrValue,
        status: Status,
        timestamp: SystemTime,
        display: Option<&DbrDisplay>,
    ) -> Result<Dbr, ErrorCondition> {
        let value = value.convert_to(dbr_type.basic_type)?;
        let display = || {
            display
                .filter(|d| {
                    matches!(
                        (d, dbr_type.basic_type),
                        (DbrDisplay::Plain, DbrBasicType::String)
                            | (DbrDisplay::EnumStrings(_), DbrBasicType::Enum)
                            | (
                                DbrDisplay::Numeric(_),
                                DbrBasicType::Short
                                    | DbrBasicType::Float
                                    | DbrBasicType::Byte
                                    | DbrBasicType::Long
                                    | DbrBasicType::Double
                            )
                    )
                })
                .cloned()
                .unwrap_or_else(|| DbrDisplay::default_for(dbr_type.basic_type))
        };
        Ok(match dbr_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp,
                value,
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status,
                display: display(),
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status,
                display: display(),
                value,
            },
            DbrCategory::ClassName => Dbr::ClassName(value),
        })
    }

    /// Decode a received payload
    ///
    /// Returns `Ok(None)` if the record carries no value at all (a zero
    /// element count, or a buffer with no complete element after the header):
    /// this is the "unavailable" case, not a decoding failure.
    pub fn from_bytes(
        data_type: DbrType,
        data_count: usize,
        data: &[u8],
    ) -> Result<Option<Dbr>, DecodeError> {
        if data_count == 0 {
            return Ok(None);
        }
        let category = data_type.category;
        let (data, status) = match category {
            DbrCategory::Basic | DbrCategory::ClassName => (data, None),
            _ => {
                let (d, status) =
                    Status::parse(data).map_err(|_| DecodeError::Truncated("alarm status"))?;
                (d, Some(status))
            }
        };
        let (data, timestamp) = if category == DbrCategory::Time {
            let (d, ts) =
                parse_timestamp(data).map_err(|_| DecodeError::Truncated("timestamp"))?;
            (d, Some(ts))
        } else {
            (data, None)
        };
        let (data, display) = match category {
            DbrCategory::Graphics | DbrCategory::Control => {
                let with_drive = category == DbrCategory::Control;
                let (d, display) = DbrDisplay::parse(data_type.basic_type, with_drive, data)
                    .map_err(|_| DecodeError::Truncated("display metadata"))?;
                (d, Some(display))
            }
            _ => (data, None),
        };

        // Offset the read buffer to account for metadata padding
        let data = data
            .get(data_type.get_metadata_padding()..)
            .ok_or(DecodeError::Truncated("metadata padding"))?;
        let value = DbrValue::decode_value(data_type.basic_type, data_count, data)?;
        if value.get_count() == 0 {
            return Ok(None);
        }

        // The options above are only populated for the categories that need them
        let status = status.unwrap_or_default();
        Ok(Some(match category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp: timestamp.unwrap_or(UNIX_EPOCH),
                value,
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status,
                display: display.unwrap_or(DbrDisplay::Plain),
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status,
                display: display.unwrap_or(DbrDisplay::Plain),
                value,
            },
            DbrCategory::ClassName => Dbr::ClassName(value),
        }))
    }

    /// Decode a payload whose type is given as the raw protocol tag
    ///
    /// # Panics
    ///
    /// An unknown tag here means a request was issued for a record type this
    /// crate cannot represent, which is a programming error rather than a
    /// condition to recover from.
    pub fn from_tagged_bytes(
        type_tag: u16,
        data_count: usize,
        data: &[u8],
    ) -> Result<Option<Dbr>, DecodeError> {
        let data_type = match DbrType::try_from(type_tag) {
            Ok(t) => t,
            Err(e) => panic!("Decoder asked to handle unsupported record type: {e}"),
        };
        Self::from_bytes(data_type, data_count, data)
    }

    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let mut buffer = Cursor::new(Vec::new());
        let real_count = self
            .write_be(&mut buffer, max_elems)
            .expect("Writing to an in-memory buffer cannot fail");
        (real_count, buffer.into_inner())
    }

    /// Write a requested number of elements to a stream
    ///
    /// Return the actual number of elements written
    pub fn write_be<W: io::Write>(
        &self,
        writer: &mut W,
        max_elems: Option<NonZeroUsize>,
    ) -> io::Result<usize> {
        let (real_elems, data) = self.value().to_bytes(max_elems);
        // All except Basic write status/severity
        if let Some(status) = self.status() {
            writer.write_all(&status.status.to_be_bytes())?;
            writer.write_all(&status.severity.to_be_bytes())?;
        }
        let basic_type = self.value().get_type();
        match self {
            Dbr::Time { timestamp, .. } => {
                let since_epics = timestamp
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .saturating_sub(Duration::from_secs(EPICS_EPOCH_OFFSET));
                let time_s = since_epics.as_secs().min(u32::MAX as u64) as u32;
                let time_ns = since_epics.subsec_nanos();
                writer.write_all(&time_s.to_be_bytes())?;
                writer.write_all(&time_ns.to_be_bytes())?;
            }
            Dbr::Graphics { display, .. } => {
                writer.write_all(&display.to_bytes(basic_type, false))?;
            }
            Dbr::Control { display, .. } => {
                writer.write_all(&display.to_bytes(basic_type, true))?;
            }
            _ => (),
        }

        writer.write_all(&vec![0u8; self.data_type().get_metadata_padding()])?;
        writer.write_all(&data)?;
        Ok(real_elems)
    }
}
