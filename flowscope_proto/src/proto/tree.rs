use flowscope_types::prelude::{
    Dissection, ExpertGroup, FieldValue, ProtocolId, Record, Severity,
};
use std::ops::Range;

/// Collects the records of one dissector invocation. Ranges are relative to the bytes that
/// dissector was handed
#[derive(Debug)]
pub struct ProtoTree {
    inner: Dissection,
}

impl ProtoTree {
    pub fn new(protocol: ProtocolId) -> Self {
        Self {
            inner: Dissection::new(protocol),
        }
    }

    pub fn protocol(&self) -> ProtocolId {
        self.inner.protocol
    }

    pub fn field<V: Into<FieldValue>>(
        &mut self,
        field: &'static str,
        range: Range<usize>,
        value: V,
    ) -> &mut Self {
        self.inner.records.push(Record::Field {
            field,
            range,
            value: value.into(),
        });
        self
    }

    pub fn text<T: Into<String>>(&mut self, range: Range<usize>, text: T) -> &mut Self {
        self.inner.records.push(Record::Text {
            range,
            text: text.into(),
        });
        self
    }

    pub fn expert<T: Into<String>>(
        &mut self,
        severity: Severity,
        group: ExpertGroup,
        range: Range<usize>,
        message: T,
    ) -> &mut Self {
        self.inner.records.push(Record::Expert {
            severity,
            group,
            message: message.into(),
            range,
        });
        self
    }

    /// Appends a fragment to the summary line
    pub fn info<T: Into<String>>(&mut self, text: T) -> &mut Self {
        self.inner.info.push(text.into());
        self
    }

    pub fn child(&mut self, child: Dissection) -> &mut Self {
        self.inner.children.push(child);
        self
    }

    /// Renders `bytes[offset..]` as opaque data when anything is left over
    pub fn undecoded(&mut self, bytes: &[u8], offset: usize, field: &'static str) -> &mut Self {
        if let Some(rest) = bytes.get(offset..).filter(|rest| !rest.is_empty()) {
            self.field(field, offset..bytes.len(), rest);
        }
        self
    }

    pub fn set_consumed(&mut self, consumed: usize) {
        self.inner.consumed = consumed;
    }

    pub fn finish(self) -> Dissection {
        self.inner
    }
}
