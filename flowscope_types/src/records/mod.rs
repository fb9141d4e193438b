//! The structured output of a dissector: typed fields over byte ranges, free text, and
//! severity-tagged expert notes. Rendering these into a tree or a table is left to the caller.
//!
//! Byte ranges are relative to the buffer handed to the dissector that produced the record.
//! A child [`Dissection`] (a tunnelled or delegated payload) carries ranges relative to its
//! own payload.
use crate::proto::{FrameId, ProtocolId};
use serde::Serialize;
use std::net::IpAddr;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I64(i64),
    Bool(bool),
    Ip(IpAddr),
    Ether([u8; 6]),
    Str(String),
    Bytes(Vec<u8>),
    Frame(FrameId),
}

impl FieldValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::U8(v) => Some(*v as u64),
            FieldValue::U16(v) => Some(*v as u64),
            FieldValue::U32(v) => Some(*v as u64),
            FieldValue::U64(v) => Some(*v),
            FieldValue::Frame(v) => Some(v.0 as u64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

macro_rules! impl_field_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(value: $ty) -> Self {
                    FieldValue::$variant(value)
                }
            }
        )*
    };
}

impl_field_value_from! {
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    i64 => I64,
    bool => Bool,
    IpAddr => Ip,
    [u8; 6] => Ether,
    String => Str,
    Vec<u8> => Bytes,
    FrameId => Frame,
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<&[u8]> for FieldValue {
    fn from(value: &[u8]) -> Self {
        FieldValue::Bytes(value.to_vec())
    }
}

impl From<std::net::Ipv4Addr> for FieldValue {
    fn from(value: std::net::Ipv4Addr) -> Self {
        FieldValue::Ip(IpAddr::V4(value))
    }
}

impl From<std::net::Ipv6Addr> for FieldValue {
    fn from(value: std::net::Ipv6Addr) -> Self {
        FieldValue::Ip(IpAddr::V6(value))
    }
}

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, strum::Display,
)]
pub enum Severity {
    Chat,
    Note,
    Warn,
    Error,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, strum::Display)]
pub enum ExpertGroup {
    /// The bytes violate the wire format
    Malformed,
    /// A protocol-level anomaly such as an unexpected command
    Protocol,
    /// A state machine saw input out of order
    Sequence,
    Checksum,
    /// Known or unknown content that was not decoded
    Undecoded,
    Comment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Record {
    Field {
        field: &'static str,
        range: Range<usize>,
        value: FieldValue,
    },
    Text {
        range: Range<usize>,
        text: String,
    },
    Expert {
        severity: Severity,
        group: ExpertGroup,
        message: String,
        range: Range<usize>,
    },
}

/// Everything one dissector said about one PDU
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dissection {
    pub protocol: ProtocolId,
    /// Summary-column fragments, in the order they were appended
    pub info: Vec<String>,
    pub records: Vec<Record>,
    pub children: Vec<Dissection>,
    /// How many bytes of the input this dissection accounted for
    pub consumed: usize,
}

impl Dissection {
    pub fn new(protocol: ProtocolId) -> Self {
        Self {
            protocol,
            info: Vec::new(),
            records: Vec::new(),
            children: Vec::new(),
            consumed: 0,
        }
    }

    pub fn info_line(&self) -> String {
        self.info.join(", ")
    }

    /// The first value recorded under `field` in this dissection or any of its children
    pub fn field(&self, field: &str) -> Option<&FieldValue> {
        self.records
            .iter()
            .find_map(|record| match record {
                Record::Field {
                    field: name, value, ..
                } if *name == field => Some(value),
                _ => None,
            })
            .or_else(|| self.children.iter().find_map(|child| child.field(field)))
    }

    /// Every value recorded under `field`, depth first
    pub fn fields(&self, field: &str) -> Vec<&FieldValue> {
        let mut ret = Vec::new();
        self.collect_fields(field, &mut ret);
        ret
    }

    fn collect_fields<'a>(&'a self, field: &str, out: &mut Vec<&'a FieldValue>) {
        for record in &self.records {
            if let Record::Field {
                field: name, value, ..
            } = record
            {
                if *name == field {
                    out.push(value);
                }
            }
        }

        for child in &self.children {
            child.collect_fields(field, out);
        }
    }

    /// Free-text annotations, depth first
    pub fn texts(&self) -> Vec<&str> {
        let mut ret: Vec<&str> = self
            .records
            .iter()
            .filter_map(|record| match record {
                Record::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();

        for child in &self.children {
            ret.extend(child.texts());
        }

        ret
    }

    /// All expert notes in this dissection and its children
    pub fn experts(&self) -> Vec<(Severity, ExpertGroup, &str)> {
        let mut ret: Vec<(Severity, ExpertGroup, &str)> = self
            .records
            .iter()
            .filter_map(|record| match record {
                Record::Expert {
                    severity,
                    group,
                    message,
                    ..
                } => Some((*severity, *group, message.as_str())),
                _ => None,
            })
            .collect();

        for child in &self.children {
            ret.extend(child.experts());
        }

        ret
    }

    pub fn has_expert(&self, group: ExpertGroup) -> bool {
        self.experts().iter().any(|(_, g, _)| *g == group)
    }

    /// The highest severity of any expert note, if any were emitted
    pub fn max_severity(&self) -> Option<Severity> {
        self.experts().iter().map(|(s, _, _)| *s).max()
    }

    /// The protocols of this dissection and its descendants, outermost first
    pub fn protocol_stack(&self) -> Vec<ProtocolId> {
        let mut ret = vec![self.protocol];
        for child in &self.children {
            ret.extend(child.protocol_stack());
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_lookup_descends_into_children() {
        let mut outer = Dissection::new(ProtocolId::Socks);
        outer.records.push(Record::Field {
            field: "socks.version",
            range: 0..1,
            value: FieldValue::U8(5),
        });
        let mut inner = Dissection::new(ProtocolId::Data);
        inner.records.push(Record::Field {
            field: "data.data",
            range: 0..2,
            value: FieldValue::Bytes(vec![1, 2]),
        });
        inner.records.push(Record::Expert {
            severity: Severity::Warn,
            group: ExpertGroup::Undecoded,
            message: "opaque".to_string(),
            range: 0..2,
        });
        outer.children.push(inner);

        assert_eq!(outer.field("socks.version"), Some(&FieldValue::U8(5)));
        assert_eq!(
            outer.field("data.data"),
            Some(&FieldValue::Bytes(vec![1, 2]))
        );
        assert_eq!(outer.max_severity(), Some(Severity::Warn));
        assert_eq!(
            outer.protocol_stack(),
            vec![ProtocolId::Socks, ProtocolId::Data]
        );
    }
}
