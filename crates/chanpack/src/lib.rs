//! # Chanpack
//!
//! A bounded, schema-agnostic codec for the dynamically shaped values that
//! cross a channel: scalars, strings, byte blobs, lists, string-keyed maps
//! and marshalled (type-tagged) references.
//!
//! ## Format
//!
//! - **Scalars**: `[Tag: 1b][Data: N]`
//! - **Blobs**: `[Tag: 1b][Len: 4b][Data: Len]`
//! - **Containers**: `[Tag: 1b][Len: 4b][Body: Len]`
//! - **Entries**: `[Tag::Entry][Len][String name][one item]`
//! - **Marshalled**: `[Tag::Marshalled][Len][String type tag][one item]`
//!
//! All integers are Little-Endian.

mod convert;
mod marshal;
mod uri;
mod value;


pub use convert::ByteBuf;
pub use convert::FromValue;
pub use convert::IntoValue;
pub use marshal::Marshal;
pub use marshal::MarshalRegistry;
pub use marshal::Marshalled;
pub use marshal::Opaque;
pub use marshal::Unmarshal;
pub use uri::Uri;
pub use uri::UriError;
pub use value::MAX_DEPTH;
pub use value::Value;
pub use value::decode_value;
pub use value::deserialize;
pub use value::encode_value;
pub use value::serialize;

/// Chanpack serialization and deserialization errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Byte does not correspond to a valid `Tag`, or the tag is not allowed here.
    InvalidTag(u8),
    /// String data is not valid UTF-8.
    InvalidUtf8,
    /// Closing a scope that does not match the active scope stack.
    ScopeMismatch { expected: Scope, actual: Scope },
    /// Attempted to close a scope when only the Root remains.
    ScopeUnderflow,
    /// Attempted to finalize the buffer with open scopes.
    ScopeStillOpen,
    /// Buffer exhausted while reading.
    UnexpectedEnd,
    /// Bytes left over after the top-level item.
    TrailingBytes(usize),
    /// Blob or container length exceeds `u32::MAX`.
    BlobTooLarge(usize),
    /// Attempted to write >1 item into a strict scope (Entry/Marshalled).
    TooManyItems(Scope),
    /// Attempted to close a strict scope (Entry/Marshalled) without a value.
    EmptyScope(Scope),
    /// Attempted to write a non-Entry directly into a Map.
    InvalidMapEntry,
    /// Values nested deeper than `MAX_DEPTH`.
    DepthExceeded,
    /// A registered unmarshaller rejected its payload.
    Marshal { tag: String, reason: String },
    /// A value had a different shape than the requested Rust type.
    TypeMismatch { expected: &'static str, found: &'static str },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidTag(b) => write!(f, "Invalid Tag byte: {:#04x}", b),
            Error::ScopeMismatch { expected, actual } => {
                write!(f, "Scope Mismatch: expected {:?}, found {:?}", expected, actual)
            }
            Error::TrailingBytes(n) => write!(f, "{} trailing bytes after value", n),
            Error::TooManyItems(s) => write!(f, "Too many items in scope {:?}; expected exactly 1", s),
            Error::EmptyScope(s) => write!(f, "Empty scope {:?}; expected exactly 1 item", s),
            Error::Marshal { tag, reason } => write!(f, "Cannot unmarshal '{}': {}", tag, reason),
            Error::TypeMismatch { expected, found } => {
                write!(f, "Type mismatch: expected {}, found {}", expected, found)
            }
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for Chanpack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Identifies the type of the encoded item.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    // Unit-like scalars
    Undefined = 0x01,
    Null = 0x02,
    True = 0x03,
    False = 0x04,

    // Fixed-width scalars
    Int = 0x05,
    UInt = 0x06,
    Float = 0x07,

    // Blobs (Tag + u32 Len + Bytes)
    String = 0x10,
    Bytes = 0x11,

    // Containers (Tag + u32 Len + Body)
    List = 0x20,
    Map = 0x21,

    // Named single-item scopes (Tag + u32 Len + String + Item)
    Entry = 0x30,
    Marshalled = 0x31,
}

impl Tag {
    /// Returns the Tag variant for a given byte, or `None` if invalid.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Tag::Undefined),
            0x02 => Some(Tag::Null),
            0x03 => Some(Tag::True),
            0x04 => Some(Tag::False),
            0x05 => Some(Tag::Int),
            0x06 => Some(Tag::UInt),
            0x07 => Some(Tag::Float),
            0x10 => Some(Tag::String),
            0x11 => Some(Tag::Bytes),
            0x20 => Some(Tag::List),
            0x21 => Some(Tag::Map),
            0x30 => Some(Tag::Entry),
            0x31 => Some(Tag::Marshalled),
            _ => None,
        }
    }
}

/// Internal state tracking for the `Encoder` stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The virtual root; allows any item.
    Root,
    /// Ordered sequence; allows any number of items.
    List,
    /// Key-Value container; strictly allows only `Tag::Entry` items.
    Map,
    /// Named payload; allows exactly one item after the name.
    Entry,
    /// Type-tagged payload; allows exactly one item after the tag.
    Marshalled,
}

/// An active container scope on the `Encoder` stack.
struct Frame {
    start: usize,
    scope: Scope,
    count: usize,
}

/// A bounded, state-machine driven encoder.
///
/// The Encoder maintains a stack of open scopes to enforce structural strictness
/// and back-patch length headers.
///
/// # Structural Invariants
///
/// 1.  **Map Scopes**: Only `Tag::Entry` items may be written.
/// 2.  **Entry and Marshalled Scopes**: Exactly one item must be written after the name.
/// 3.  **Root Scope**: The encoder must end in the Root scope to finalize bytes.
pub struct Encoder {
    buf: Vec<u8>,
    /// Bottom is always `Scope::Root`.
    stack: Vec<Frame>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// Creates a new encoder with default capacity.
    pub fn new() -> Self {
        let mut enc = Self {
            buf: Vec::with_capacity(256),
            stack: Vec::with_capacity(8),
        };
        enc.stack.push(Frame { start: 0, scope: Scope::Root, count: 0 });
        enc
    }

    /// Consumes the encoder and returns the final byte vector.
    ///
    /// # Errors
    /// Returns `Error::ScopeStillOpen` if the stack depth > 1.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if self.stack.len() > 1 {
            return Err(Error::ScopeStillOpen);
        }
        Ok(self.buf)
    }

    fn current_frame(&mut self) -> &mut Frame {
        let top = self.stack.len() - 1;
        &mut self.stack[top]
    }

    fn check_write(&mut self, tag: Tag) -> Result<()> {
        let frame = self.current_frame();
        match frame.scope {
            Scope::Root | Scope::List => Ok(()),
            Scope::Map => {
                if tag != Tag::Entry {
                    Err(Error::InvalidMapEntry)
                } else {
                    Ok(())
                }
            }
            Scope::Entry | Scope::Marshalled => {
                if frame.count >= 1 {
                    Err(Error::TooManyItems(frame.scope))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn on_item_written(&mut self) {
        self.current_frame().count += 1;
    }

    fn write_scalar(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(data);
        self.on_item_written();
        Ok(())
    }

    fn write_blob(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        let len = data.len();
        if len > u32::MAX as usize {
            return Err(Error::BlobTooLarge(len));
        }
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&(len as u32).to_le_bytes());
        self.buf.extend_from_slice(data);
        self.on_item_written();
        Ok(())
    }

    fn begin_scope(&mut self, tag: Tag, scope: Scope) -> Result<()> {
        self.check_write(tag)?;

        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&[0, 0, 0, 0]); // Length placeholder

        self.stack.push(Frame {
            start: self.buf.len(),
            scope,
            count: 0,
        });
        Ok(())
    }

    fn begin_named_scope(&mut self, tag: Tag, scope: Scope, name: &str) -> Result<()> {
        self.begin_scope(tag, scope)?;
        self.str(name)?;
        // The name is metadata; exactly one payload item must follow.
        self.current_frame().count = 0;
        Ok(())
    }

    fn end_scope(&mut self, expected: Scope) -> Result<()> {
        if self.stack.len() <= 1 {
            return Err(Error::ScopeUnderflow);
        }

        {
            let frame = self.current_frame();
            if frame.scope != expected {
                return Err(Error::ScopeMismatch { expected, actual: frame.scope });
            }
            if matches!(frame.scope, Scope::Entry | Scope::Marshalled) && frame.count == 0 {
                return Err(Error::EmptyScope(frame.scope));
            }
        }

        let Some(frame) = self.stack.pop() else {
            return Err(Error::ScopeUnderflow);
        };
        let body_len = self.buf.len() - frame.start;
        if body_len > u32::MAX as usize {
            return Err(Error::BlobTooLarge(body_len));
        }

        let len_pos = frame.start - 4;
        self.buf[len_pos..frame.start].copy_from_slice(&(body_len as u32).to_le_bytes());

        self.on_item_written();
        Ok(())
    }

    /// Encodes the absence of a value.
    pub fn undefined(&mut self) -> Result<()> { self.write_scalar(Tag::Undefined, &[]) }
    /// Encodes an explicit null.
    pub fn null(&mut self) -> Result<()> { self.write_scalar(Tag::Null, &[]) }

    /// Encodes a boolean value.
    pub fn bool(&mut self, v: bool) -> Result<()> {
        self.write_scalar(if v { Tag::True } else { Tag::False }, &[])
    }

    /// Encodes a signed 64-bit integer (LE).
    pub fn int(&mut self, v: i64) -> Result<()> { self.write_scalar(Tag::Int, &v.to_le_bytes()) }
    /// Encodes an unsigned 64-bit integer (LE).
    pub fn uint(&mut self, v: u64) -> Result<()> { self.write_scalar(Tag::UInt, &v.to_le_bytes()) }
    /// Encodes a 64-bit float (LE).
    pub fn float(&mut self, v: f64) -> Result<()> { self.write_scalar(Tag::Float, &v.to_le_bytes()) }

    /// Encodes a UTF-8 string blob.
    pub fn str(&mut self, v: &str) -> Result<()> { self.write_blob(Tag::String, v.as_bytes()) }
    /// Encodes a raw byte blob.
    pub fn bytes(&mut self, v: &[u8]) -> Result<()> { self.write_blob(Tag::Bytes, v) }

    /// Begins a List container. Allows any number of items.
    pub fn list_begin(&mut self) -> Result<()> { self.begin_scope(Tag::List, Scope::List) }
    /// Ends a List container.
    pub fn list_end(&mut self) -> Result<()> { self.end_scope(Scope::List) }

    /// Begins a Map container. Only `entry_begin()` is allowed as a direct child.
    pub fn map_begin(&mut self) -> Result<()> { self.begin_scope(Tag::Map, Scope::Map) }
    /// Ends a Map container.
    pub fn map_end(&mut self) -> Result<()> { self.end_scope(Scope::Map) }

    /// Begins a named Entry. Exactly one payload item must follow.
    pub fn entry_begin(&mut self, name: &str) -> Result<()> {
        self.begin_named_scope(Tag::Entry, Scope::Entry, name)
    }
    /// Ends an Entry.
    pub fn entry_end(&mut self) -> Result<()> { self.end_scope(Scope::Entry) }

    /// Begins a Marshalled value tagged with `type_tag`. Exactly one payload item must follow.
    pub fn marshalled_begin(&mut self, type_tag: &str) -> Result<()> {
        self.begin_named_scope(Tag::Marshalled, Scope::Marshalled, type_tag)
    }
    /// Ends a Marshalled value.
    pub fn marshalled_end(&mut self) -> Result<()> { self.end_scope(Scope::Marshalled) }
}

/// A zero-copy, bounds-checked cursor over a byte slice.
///
/// Reading advances the cursor. Container reads return new `Decoder`s
/// restricted to the container's body.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over the slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Returns the remaining bytes in the view.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Peeks the next Tag without advancing.
    pub fn peek_tag(&self) -> Result<Tag> {
        let Some(&b) = self.buf.first() else {
            return Err(Error::UnexpectedEnd);
        };
        Tag::from_u8(b).ok_or(Error::InvalidTag(b))
    }

    fn consume(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.read_bytes(N)?.try_into().map_err(|_| Error::UnexpectedEnd)
    }

    fn read_len(&mut self) -> Result<usize> {
        Ok(u32::from_le_bytes(self.read_array()?) as usize)
    }

    fn check_tag(&mut self, expected: Tag) -> Result<()> {
        let tag = self.peek_tag()?;
        if tag == expected {
            self.consume(1)
        } else {
            Err(Error::InvalidTag(tag as u8))
        }
    }

    /// Skips the next item and its nested children.
    pub fn skip(&mut self) -> Result<()> {
        let tag = self.peek_tag()?;
        self.consume(1)?;

        match tag {
            Tag::Undefined | Tag::Null | Tag::True | Tag::False => {}
            Tag::Int | Tag::UInt | Tag::Float => self.consume(8)?,
            Tag::String | Tag::Bytes | Tag::List | Tag::Map | Tag::Entry | Tag::Marshalled => {
                let len = self.read_len()?;
                self.consume(len)?;
            }
        }
        Ok(())
    }

    /// Decodes `undefined`.
    pub fn undefined(&mut self) -> Result<()> { self.check_tag(Tag::Undefined) }
    /// Decodes `null`.
    pub fn null(&mut self) -> Result<()> { self.check_tag(Tag::Null) }

    /// Decodes a bool.
    pub fn bool(&mut self) -> Result<bool> {
        match self.peek_tag()? {
            Tag::True => { self.consume(1)?; Ok(true) }
            Tag::False => { self.consume(1)?; Ok(false) }
            tag => Err(Error::InvalidTag(tag as u8)),
        }
    }

    /// Decodes a signed 64-bit integer.
    pub fn int(&mut self) -> Result<i64> { self.check_tag(Tag::Int)?; Ok(i64::from_le_bytes(self.read_array()?)) }
    /// Decodes an unsigned 64-bit integer.
    pub fn uint(&mut self) -> Result<u64> { self.check_tag(Tag::UInt)?; Ok(u64::from_le_bytes(self.read_array()?)) }
    /// Decodes a 64-bit float.
    pub fn float(&mut self) -> Result<f64> { self.check_tag(Tag::Float)?; Ok(f64::from_le_bytes(self.read_array()?)) }

    /// Decodes a string slice (UTF-8).
    pub fn str(&mut self) -> Result<&'a str> {
        self.check_tag(Tag::String)?;
        let len = self.read_len()?;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }

    /// Decodes a byte slice.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        self.check_tag(Tag::Bytes)?;
        let len = self.read_len()?;
        self.read_bytes(len)
    }

    fn enter_container(&mut self, expected: Tag) -> Result<Decoder<'a>> {
        self.check_tag(expected)?;
        let len = self.read_len()?;
        Ok(Decoder::new(self.read_bytes(len)?))
    }

    /// Decodes a List into an iterator.
    pub fn list(&mut self) -> Result<ListIter<'a>> {
        Ok(ListIter { dec: self.enter_container(Tag::List)? })
    }

    /// Decodes a Map into an iterator.
    pub fn map(&mut self) -> Result<MapIter<'a>> {
        Ok(MapIter { dec: self.enter_container(Tag::Map)? })
    }

    /// Decodes an Entry. Returns `(Name, PayloadDecoder)`.
    pub fn entry(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut inner = self.enter_container(Tag::Entry)?;
        let name = inner.str()?;
        Ok((name, inner))
    }

    /// Decodes a Marshalled value header. Returns `(TypeTag, PayloadDecoder)`.
    pub fn marshalled(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut inner = self.enter_container(Tag::Marshalled)?;
        let tag = inner.str()?;
        Ok((tag, inner))
    }

    /// Fails unless every byte of this view has been consumed.
    pub fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(Error::TrailingBytes(n)),
        }
    }
}

/// Iterator for items within a List.
#[derive(Debug)]
pub struct ListIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> ListIter<'a> {
    /// Returns a Decoder scoped to the next item, or `None` at the end.
    pub fn next(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        let mut probe = self.dec.clone();
        probe.skip()?;
        let len = self.dec.remaining() - probe.remaining();
        Ok(Some(Decoder::new(self.dec.read_bytes(len)?)))
    }
}

/// Iterator for Key-Value pairs (Entries) within a Map.
#[derive(Debug)]
pub struct MapIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> MapIter<'a> {
    /// Returns `(Key, ValueDecoder)` for the next item, or `None`.
    pub fn next(&mut self) -> Result<Option<(&'a str, Decoder<'a>)>> {
        if self.dec.remaining() == 0 {
            return Ok(None);
        }
        let tag = self.dec.peek_tag()?;
        if tag != Tag::Entry {
            return Err(Error::InvalidTag(tag as u8));
        }
        Ok(Some(self.dec.entry()?))
    }
}
