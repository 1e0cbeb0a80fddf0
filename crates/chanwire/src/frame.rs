//! # Protocol Frames
//!
//! Every frame is an entry named after its kind, wrapping a map of fields:
//! `Entry("Call") { Map { "id": UInt, "channel": String, ... } }`.
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Forward Compatibility**: Unknown fields are skipped.
//! - **Routability**: `decode_header` recovers the kind and id even when a payload is corrupt.

use chanpack::Decoder;
use chanpack::Encoder;
use chanpack::MarshalRegistry;
use chanpack::Value;
use chanpack::decode_value;
use chanpack::encode_value;

use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;

/// The kind of a frame, without its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Hello,
    Call,
    CallOk,
    CallErr,
    Cancel,
    Listen,
    Fire,
    Dispose,
}

impl FrameKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            FrameKind::Hello => "Hello",
            FrameKind::Call => "Call",
            FrameKind::CallOk => "CallOk",
            FrameKind::CallErr => "CallErr",
            FrameKind::Cancel => "Cancel",
            FrameKind::Listen => "Listen",
            FrameKind::Fire => "Fire",
            FrameKind::Dispose => "Dispose",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        Ok(match tag {
            "Hello" => FrameKind::Hello,
            "Call" => FrameKind::Call,
            "CallOk" => FrameKind::CallOk,
            "CallErr" => FrameKind::CallErr,
            "Cancel" => FrameKind::Cancel,
            "Listen" => FrameKind::Listen,
            "Fire" => FrameKind::Fire,
            "Dispose" => FrameKind::Dispose,
            _ => return Err(Error::UnknownVariant(format!("Top-level frame: {}", tag))),
        })
    }
}

/// One message on the wire.
///
/// `Call`, `CallOk`, `CallErr` and `Cancel` carry a request id. `Listen`,
/// `Fire` and `Dispose` carry a subscription id. The two id spaces are
/// independent.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// First frame on a connection; announces the sender's context name.
    Hello { ctx: String },
    Call { id: u64, channel: String, command: String, arg: Value },
    CallOk { id: u64, value: Value },
    CallErr { id: u64, kind: ErrorKind, message: String },
    Cancel { id: u64 },
    Listen { id: u64, channel: String, event: String, arg: Value },
    Fire { id: u64, value: Value },
    Dispose { id: u64 },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Hello { .. } => FrameKind::Hello,
            Frame::Call { .. } => FrameKind::Call,
            Frame::CallOk { .. } => FrameKind::CallOk,
            Frame::CallErr { .. } => FrameKind::CallErr,
            Frame::Cancel { .. } => FrameKind::Cancel,
            Frame::Listen { .. } => FrameKind::Listen,
            Frame::Fire { .. } => FrameKind::Fire,
            Frame::Dispose { .. } => FrameKind::Dispose,
        }
    }

    /// The request or subscription id, if this kind carries one.
    pub fn id(&self) -> Option<u64> {
        match *self {
            Frame::Hello { .. } => None,
            Frame::Call { id, .. }
            | Frame::CallOk { id, .. }
            | Frame::CallErr { id, .. }
            | Frame::Cancel { id }
            | Frame::Listen { id, .. }
            | Frame::Fire { id, .. }
            | Frame::Dispose { id } => Some(id),
        }
    }

    /// Encode this frame into a standalone buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        enc.entry_begin(self.kind().as_tag())?;
        enc.map_begin()?;

        match self {
            Frame::Hello { ctx } => {
                write_map_str(&mut enc, "ctx", ctx)?;
            }
            Frame::Call { id, channel, command, arg } => {
                write_map_u64(&mut enc, "id", *id)?;
                write_map_str(&mut enc, "channel", channel)?;
                write_map_str(&mut enc, "command", command)?;
                write_map_value(&mut enc, "arg", arg)?;
            }
            Frame::CallOk { id, value } => {
                write_map_u64(&mut enc, "id", *id)?;
                write_map_value(&mut enc, "value", value)?;
            }
            Frame::CallErr { id, kind, message } => {
                write_map_u64(&mut enc, "id", *id)?;
                write_map_str(&mut enc, "kind", kind.as_tag())?;
                write_map_str(&mut enc, "message", message)?;
            }
            Frame::Listen { id, channel, event, arg } => {
                write_map_u64(&mut enc, "id", *id)?;
                write_map_str(&mut enc, "channel", channel)?;
                write_map_str(&mut enc, "event", event)?;
                write_map_value(&mut enc, "arg", arg)?;
            }
            Frame::Fire { id, value } => {
                write_map_u64(&mut enc, "id", *id)?;
                write_map_value(&mut enc, "value", value)?;
            }
            Frame::Cancel { id } | Frame::Dispose { id } => {
                write_map_u64(&mut enc, "id", *id)?;
            }
        }

        enc.map_end()?;
        enc.entry_end()?;
        Ok(enc.into_bytes()?)
    }

    /// Decode a frame, rebuilding marshalled values through `registry`.
    ///
    /// # Errors
    /// Fails on codec errors, trailing bytes, an unknown kind, or a missing field.
    pub fn decode(bytes: &[u8], registry: &MarshalRegistry) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let (tag, mut body) = dec.entry()?;
        dec.finish()?;
        let kind = FrameKind::from_tag(tag)?;

        let mut fields = Fields::default();
        let mut map = body.map()?;
        while let Some((key, mut val)) = map.next()? {
            match key {
                "id" => fields.id = Some(val.uint()?),
                "ctx" => fields.ctx = Some(val.str()?),
                "channel" => fields.channel = Some(val.str()?),
                "command" => fields.command = Some(val.str()?),
                "event" => fields.event = Some(val.str()?),
                "kind" => fields.kind = Some(ErrorKind::from_tag(val.str()?)?),
                "message" => fields.message = Some(val.str()?),
                "arg" => fields.arg = Some(decode_value(&mut val, registry)?),
                "value" => fields.value = Some(decode_value(&mut val, registry)?),
                _ => val.skip()?,
            }
            // Each entry holds exactly one item.
            val.finish()?;
        }
        body.finish()?;

        Ok(match kind {
            FrameKind::Hello => Frame::Hello { ctx: required(fields.ctx, "ctx")?.to_string() },
            FrameKind::Call => Frame::Call {
                id: required(fields.id, "id")?,
                channel: required(fields.channel, "channel")?.to_string(),
                command: required(fields.command, "command")?.to_string(),
                arg: fields.arg.unwrap_or_default(),
            },
            FrameKind::CallOk => Frame::CallOk {
                id: required(fields.id, "id")?,
                value: fields.value.unwrap_or_default(),
            },
            FrameKind::CallErr => Frame::CallErr {
                id: required(fields.id, "id")?,
                kind: fields.kind.unwrap_or(ErrorKind::Failure),
                message: fields.message.unwrap_or_default().to_string(),
            },
            FrameKind::Cancel => Frame::Cancel { id: required(fields.id, "id")? },
            FrameKind::Listen => Frame::Listen {
                id: required(fields.id, "id")?,
                channel: required(fields.channel, "channel")?.to_string(),
                event: required(fields.event, "event")?.to_string(),
                arg: fields.arg.unwrap_or_default(),
            },
            FrameKind::Fire => Frame::Fire {
                id: required(fields.id, "id")?,
                value: fields.value.unwrap_or_default(),
            },
            FrameKind::Dispose => Frame::Dispose { id: required(fields.id, "id")? },
        })
    }
}

#[derive(Default)]
struct Fields<'a> {
    id: Option<u64>,
    ctx: Option<&'a str>,
    channel: Option<&'a str>,
    command: Option<&'a str>,
    event: Option<&'a str>,
    kind: Option<ErrorKind>,
    message: Option<&'a str>,
    arg: Option<Value>,
    value: Option<Value>,
}

fn required<T>(field: Option<T>, name: &str) -> Result<T> {
    field.ok_or_else(|| Error::ProtocolViolation(format!("Missing {}", name)))
}

/// Decodes just the kind and id from a raw frame, skipping payload values.
///
/// Lets a receiver answer or settle a request whose payload failed to decode.
pub fn decode_header(bytes: &[u8]) -> Result<(FrameKind, Option<u64>)> {
    let mut dec = Decoder::new(bytes);
    let (tag, mut body) = dec.entry()?;
    let kind = FrameKind::from_tag(tag)?;

    let mut map = body.map()?;
    while let Some((key, mut val)) = map.next()? {
        if key == "id" {
            return Ok((kind, Some(val.uint()?)));
        }
        val.skip()?;
    }
    Ok((kind, None))
}

// Helper functions

fn write_map_u64(enc: &mut Encoder, key: &str, val: u64) -> Result<()> {
    enc.entry_begin(key)?;
    enc.uint(val)?;
    enc.entry_end()?;
    Ok(())
}

fn write_map_str(enc: &mut Encoder, key: &str, val: &str) -> Result<()> {
    enc.entry_begin(key)?;
    enc.str(val)?;
    enc.entry_end()?;
    Ok(())
}

fn write_map_value(enc: &mut Encoder, key: &str, val: &Value) -> Result<()> {
    enc.entry_begin(key)?;
    encode_value(enc, val)?;
    enc.entry_end()?;
    Ok(())
}
