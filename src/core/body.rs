//! Lazy message-body handle.
//!
//! A [`Body`] holds at most one of: an unread byte stream, a cached byte
//! buffer, or a typed parsed value, behind one interface. Parsing runs at
//! most once per byte assignment and its error is cached; mutating the
//! parsed value raises a dirty flag so the next [`Body::bytes`] call
//! re-serializes. A body is single-owner within one stage boundary and is
//! handed off, never shared.

use crate::error::ProxyError;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::io::Cursor;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

/// Type-erased parsed payload. Stages downcast at their boundaries.
pub type ParsedBody = Box<dyn Any + Send + Sync>;

/// Byte source a body can be constructed over before it is drained.
pub type ByteStream =
    Pin<Box<dyn futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Parses and serializes body payloads. Serialize must round-trip with
/// parse on the parsed form; byte-level identity is not required.
pub trait BodyParser: Send + Sync {
    fn parse(&self, data: &[u8]) -> Result<ParsedBody, ProxyError>;
    fn serialize(&self, value: &ParsedBody) -> Result<Bytes, ProxyError>;
}

/// JSON parser for any serde-typed payload. A `[DONE]` frame parses to
/// the dedicated [`ProxyError::StreamDone`] marker instead of a value.
pub struct JsonParser<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonParser<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonParser<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonParser<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn arc() -> Arc<dyn BodyParser> {
        Arc::new(Self::new())
    }
}

impl<T> BodyParser for JsonParser<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn parse(&self, data: &[u8]) -> Result<ParsedBody, ProxyError> {
        match serde_json::from_slice::<T>(data) {
            Ok(value) => Ok(Box::new(value)),
            Err(err) => {
                if data.trim_ascii() == b"[DONE]" {
                    Err(ProxyError::StreamDone)
                } else {
                    Err(ProxyError::Internal(format!("parse body error: {err}")))
                }
            }
        }
    }

    fn serialize(&self, value: &ParsedBody) -> Result<Bytes, ProxyError> {
        let typed = value
            .downcast_ref::<T>()
            .ok_or_else(|| ProxyError::Internal("serialize: unexpected body type".to_string()))?;
        let bytes = serde_json::to_vec(typed)
            .map_err(|err| ProxyError::Internal(format!("serialize body error: {err}")))?;
        Ok(Bytes::from(bytes))
    }
}

/// Lazy parse/serialize body. See the module docs for the contract.
pub struct Body {
    stream: Option<ByteStream>,
    bytes: Option<Bytes>,
    parsed: Option<ParsedBody>,
    parse_err: Option<ProxyError>,
    parser: Option<Arc<dyn BodyParser>>,
    dirty: bool,
}

impl Body {
    pub fn from_bytes(bytes: impl Into<Bytes>, parser: Option<Arc<dyn BodyParser>>) -> Self {
        Self {
            stream: None,
            bytes: Some(bytes.into()),
            parsed: None,
            parse_err: None,
            parser,
            dirty: false,
        }
    }

    pub fn from_stream(stream: ByteStream, parser: Option<Arc<dyn BodyParser>>) -> Self {
        Self {
            stream: Some(stream),
            bytes: None,
            parsed: None,
            parse_err: None,
            parser,
            dirty: false,
        }
    }

    /// Body over an already-parsed value; dirty, so the first `bytes()`
    /// call serializes it.
    pub fn from_parsed(value: ParsedBody, parser: Arc<dyn BodyParser>) -> Self {
        Self {
            stream: None,
            bytes: None,
            parsed: Some(value),
            parse_err: None,
            parser: Some(parser),
            dirty: true,
        }
    }

    /// Stable byte view. Re-serializes when the parsed value is dirty,
    /// otherwise drains the stream once and caches.
    pub async fn bytes(&mut self) -> Result<Bytes, ProxyError> {
        if self.dirty {
            let parsed = self
                .parsed
                .as_ref()
                .ok_or_else(|| ProxyError::Internal("dirty body without parsed value".into()))?;
            let parser = self.parser()?;
            let bytes = parser.serialize(parsed)?;
            self.bytes = Some(bytes.clone());
            self.dirty = false;
            return Ok(bytes);
        }
        if let Some(bytes) = &self.bytes {
            return Ok(bytes.clone());
        }
        let bytes = self.drain_stream().await?;
        self.bytes = Some(bytes.clone());
        Ok(bytes)
    }

    /// Typed view. Parses at most once per byte assignment; a parse
    /// error is cached and returned on every later call.
    pub async fn parsed(&mut self) -> Result<&(dyn Any + Send + Sync), ProxyError> {
        if let Some(err) = &self.parse_err {
            return Err(err.clone());
        }
        if self.parsed.is_none() {
            if self.bytes.is_none() {
                let bytes = self.drain_stream().await?;
                self.bytes = Some(bytes);
            }
            let parser = self.parser()?;
            let data = self.bytes.as_ref().expect("bytes cached above");
            match parser.parse(data) {
                Ok(value) => self.parsed = Some(value),
                Err(err) => {
                    self.parse_err = Some(err.clone());
                    return Err(err);
                }
            }
        }
        Ok(self.parsed.as_ref().expect("parsed cached above").as_ref())
    }

    /// Typed view downcast to a concrete payload type.
    pub async fn parsed_as<T: 'static>(&mut self) -> Result<&T, ProxyError> {
        self.parsed().await?;
        self.parsed
            .as_ref()
            .and_then(|value| value.downcast_ref::<T>())
            .ok_or_else(|| ProxyError::Internal("unexpected parsed body type".to_string()))
    }

    /// Replace the parsed value and mark the byte view stale.
    pub fn set_parsed(&mut self, value: ParsedBody) {
        self.parsed = Some(value);
        self.parse_err = None;
        self.dirty = true;
        self.stream = None;
    }

    /// Replace raw bytes, discarding any cached parsed state.
    pub fn set_bytes(&mut self, bytes: impl Into<Bytes>) {
        self.bytes = Some(bytes.into());
        self.parsed = None;
        self.parse_err = None;
        self.dirty = false;
        self.stream = None;
    }

    /// Swap the parser. Invalidates parsed state but not bytes.
    pub fn set_parser(&mut self, parser: Arc<dyn BodyParser>) {
        self.parser = Some(parser);
        self.parsed = None;
        self.parse_err = None;
        self.dirty = false;
    }

    /// Fresh readable view over the (materialized) byte form.
    pub async fn reader(&mut self) -> Result<Cursor<Bytes>, ProxyError> {
        let bytes = self.bytes().await?;
        Ok(Cursor::new(bytes))
    }

    fn parser(&self) -> Result<Arc<dyn BodyParser>, ProxyError> {
        self.parser
            .clone()
            .ok_or_else(|| ProxyError::Internal("body parser is not set".to_string()))
    }

    async fn drain_stream(&mut self) -> Result<Bytes, ProxyError> {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| ProxyError::Internal("body has no content source".to_string()))?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|err| ProxyError::Internal(format!("read body error: {err}")))?;
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body")
            .field("has_stream", &self.stream.is_some())
            .field("bytes_len", &self.bytes.as_ref().map(Bytes::len))
            .field("has_parsed", &self.parsed.is_some())
            .field("dirty", &self.dirty)
            .finish()
    }
}
