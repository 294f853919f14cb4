use bytes::{Bytes, BytesMut};
use lapin::types::{AMQPValue, FieldTable};
use std::fmt;

/// Accumulates the reply a handler builds for one delivery.
///
/// Implements [`std::fmt::Write`] so handlers can use `write!` directly:
///
/// ```
/// use std::fmt::Write;
/// # let mut rw = amqp_rpc::ResponseWriter::default();
/// write!(rw, "Got message: {}", "hello").ok();
/// ```
///
/// The dispatcher publishes the accumulated body and headers back to the
/// requester's reply queue once the handler chain returns, provided the
/// request asked for a reply.
#[derive(Debug, Default)]
pub struct ResponseWriter {
    body: BytesMut,
    headers: FieldTable,
    written: bool,
}

impl ResponseWriter {
    /// Appends raw bytes to the reply body.
    pub fn write(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
        self.written = true;
    }

    /// Sets a header on the reply. Later writes with the same key win.
    pub fn write_header<K: Into<String>>(&mut self, key: K, value: AMQPValue) {
        self.headers.insert(key.into().into(), value);
    }

    /// Whether the handler chain wrote anything to the body.
    pub fn written(&self) -> bool {
        self.written
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn headers(&self) -> &FieldTable {
        &self.headers
    }

    pub(crate) fn into_parts(self) -> (Bytes, FieldTable) {
        (self.body.freeze(), self.headers)
    }
}

impl fmt::Write for ResponseWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write(s.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;

    #[test]
    fn accumulates_sequential_writes() {
        let mut rw = ResponseWriter::default();
        assert!(!rw.written());

        rw.write(b"Got message: ");
        write!(rw, "{}", "this is a message").unwrap();

        assert!(rw.written());
        assert_eq!(rw.body(), b"Got message: this is a message");
    }

    #[test]
    fn headers_do_not_mark_the_body_written() {
        let mut rw = ResponseWriter::default();
        rw.write_header("password", AMQPValue::LongString("secret".into()));

        assert!(!rw.written());
        let (body, headers) = rw.into_parts();
        assert!(body.is_empty());
        assert!(headers
            .inner()
            .contains_key(&lapin::types::ShortString::from("password")));
    }
}
