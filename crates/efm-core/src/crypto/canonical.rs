//! Deterministic canonical encoding for signed records.
//!
//! Signatures and content hashes must be computed over a byte encoding that
//! is identical on every node and every run. JSON serialization does not
//! guarantee that, so signed records (genesis, pulse, message, audit entry)
//! build their signing bytes with this writer: a domain prefix followed by
//! length-prefixed fields in a fixed order.

/// Field separator written after the domain prefix.
const DOMAIN_SEPARATOR: u8 = 0x1f;

/// Builds a deterministic byte encoding of a record.
#[derive(Debug)]
pub struct CanonicalWriter {
    buf: Vec<u8>,
}

impl CanonicalWriter {
    /// Starts an encoding under the given domain prefix.
    ///
    /// The domain prefix makes encodings of different record types
    /// non-interchangeable even when their field bytes coincide.
    #[must_use]
    pub fn new(domain: &str) -> Self {
        let mut buf = Vec::with_capacity(64 + domain.len());
        buf.extend_from_slice(domain.as_bytes());
        buf.push(DOMAIN_SEPARATOR);
        Self { buf }
    }

    /// Appends a length-prefixed byte field.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Appends a length-prefixed UTF-8 string field.
    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_bytes(value.as_bytes())
    }

    /// Appends a fixed-width u64 field.
    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Appends an f64 field by its IEEE-754 bit pattern.
    pub fn put_f64(&mut self, value: f64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_bits().to_le_bytes());
        self
    }

    /// Appends an optional byte field with a presence marker.
    pub fn put_opt_bytes(&mut self, value: Option<&[u8]>) -> &mut Self {
        match value {
            Some(bytes) => {
                self.buf.push(1);
                self.put_bytes(bytes)
            },
            None => {
                self.buf.push(0);
                self
            },
        }
    }

    /// Finishes the encoding and returns the bytes.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
