// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Body encoding of remote messages.
//!
//! Frames are length prefixed by the transport, this module only deals with what is
//! inside a frame. All integers are big endian.
//!
//! ```text
//! u8    version
//! u16   kind id
//! u16   entity id length, then UTF-8 bytes
//! i64   time bucket
//! u8    0 = no partition key, 1 = u16 length then UTF-8 bytes follow
//! u64   field mask, bit i set when field i carries a delta
//! u32   string count,  then per string u32 length + UTF-8 bytes
//! u32   int count,     then i32 each
//! u32   long count,    then i64 each
//! u32   double count,  then f64 bits each
//! u32   bool count,    then u8 each
//! u32   bytes count,   then per blob u32 length + bytes
//! ```

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tally_core::{Event, Identity, KindId, Payload, TimeBucket};

use crate::{
    CodecError,
    schema::{RemoteData, RemoteSchemas},
};

pub const WIRE_VERSION: u8 = 1;

/// One decoded frame, before it is matched against a schema.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteMessage {
    pub identity: Identity,
    pub partition_key: Option<Arc<str>>,
    pub mask: u64,
    pub data: RemoteData,
}

impl RemoteMessage {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u8(WIRE_VERSION);
        buf.put_u16(self.identity.kind().0);
        put_short_str(buf, self.identity.entity_id(), "entity id")?;
        buf.put_i64(self.identity.bucket().raw());
        match &self.partition_key {
            Some(key) => {
                buf.put_u8(1);
                put_short_str(buf, key, "partition key")?;
            }
            None => buf.put_u8(0),
        }
        buf.put_u64(self.mask);

        let data = &self.data;
        put_count(buf, data.strings.len(), "string list")?;
        for s in &data.strings {
            put_blob(buf, s.as_bytes(), "string field")?;
        }
        put_count(buf, data.ints.len(), "int list")?;
        data.ints.iter().for_each(|v| buf.put_i32(*v));
        put_count(buf, data.longs.len(), "long list")?;
        data.longs.iter().for_each(|v| buf.put_i64(*v));
        put_count(buf, data.doubles.len(), "double list")?;
        data.doubles.iter().for_each(|v| buf.put_f64(*v));
        put_count(buf, data.bools.len(), "bool list")?;
        data.bools.iter().for_each(|v| buf.put_u8(u8::from(*v)));
        put_count(buf, data.bytes.len(), "bytes list")?;
        for b in &data.bytes {
            put_blob(buf, b, "bytes field")?;
        }
        Ok(())
    }

    /// Decode a whole frame. Trailing bytes are an error.
    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        let version = get_u8(&mut buf, "version")?;
        if version != WIRE_VERSION {
            return Err(CodecError::BadVersion(version));
        }
        let kind = KindId(get_u16(&mut buf, "kind id")?);
        let entity_id = get_short_str(&mut buf, "entity id")?;
        let bucket = TimeBucket::from_raw(get_i64(&mut buf, "time bucket")?)?;
        let partition_key = match get_flag(&mut buf, "partition key")? {
            false => None,
            true => Some(Arc::from(get_short_str(&mut buf, "partition key")?)),
        };
        let mask = get_u64(&mut buf, "field mask")?;

        let mut data = RemoteData::default();
        for _ in 0..get_count(&mut buf, "string list")? {
            let raw = get_blob(&mut buf, "string field")?;
            data.strings.push(
                String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8("string field"))?,
            );
        }
        for _ in 0..get_count(&mut buf, "int list")? {
            data.ints.push(get_i32(&mut buf, "int field")?);
        }
        for _ in 0..get_count(&mut buf, "long list")? {
            data.longs.push(get_i64(&mut buf, "long field")?);
        }
        for _ in 0..get_count(&mut buf, "double list")? {
            data.doubles.push(f64::from_bits(get_u64(&mut buf, "double field")?));
        }
        for _ in 0..get_count(&mut buf, "bool list")? {
            data.bools.push(get_flag(&mut buf, "bool field")?);
        }
        for _ in 0..get_count(&mut buf, "bytes list")? {
            data.bytes.push(get_blob(&mut buf, "bytes field")?);
        }
        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes(buf.remaining()));
        }
        Ok(Self {
            identity: Identity::new(kind, entity_id, bucket),
            partition_key,
            mask,
            data,
        })
    }
}

/// Converts events to and from frame bodies through per-kind remote schemas.
///
/// An event's payload is folded into a delta record first, so several deltas for the same
/// field arrive as one.
#[derive(Clone, Debug)]
pub struct EventCodec {
    schemas: Arc<RemoteSchemas>,
}

impl EventCodec {
    pub fn new(schemas: impl Into<Arc<RemoteSchemas>>) -> Self {
        Self {
            schemas: schemas.into(),
        }
    }

    pub fn schemas(&self) -> &RemoteSchemas {
        &self.schemas
    }

    pub fn to_message(&self, event: &Event) -> Result<RemoteMessage, CodecError> {
        let schema = self.schemas.get(event.identity().kind())?;
        let merge_schema = schema.merge_schema();
        let mut delta = merge_schema.new_record();
        merge_schema.apply(&mut delta, event.payload())?;
        let mask = (0..delta.len())
            .filter(|&i| delta.is_set(i))
            .fold(0u64, |mask, i| mask | 1 << i);
        Ok(RemoteMessage {
            identity: event.identity().clone(),
            partition_key: event.partition_key().map(Arc::from),
            mask,
            data: schema.encode(&delta)?,
        })
    }

    pub fn from_message(&self, message: RemoteMessage) -> Result<Event, CodecError> {
        let schema = self.schemas.get(message.identity.kind())?;
        let values = schema.decode(&message.data)?;
        let len = values.len();
        if len < 64 && message.mask >> len != 0 {
            return Err(CodecError::BadMask {
                mask: message.mask,
                len,
            });
        }
        let payload: Payload = values
            .into_iter()
            .enumerate()
            .filter(|(i, _)| message.mask & (1 << i) != 0)
            .collect();
        Ok(Event::from_parts(
            message.identity,
            payload,
            message.partition_key,
        ))
    }

    pub fn encode_event(&self, event: &Event) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(64);
        self.to_message(event)?.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode_event(&self, frame: &[u8]) -> Result<Event, CodecError> {
        self.from_message(RemoteMessage::decode(frame)?)
    }
}

fn put_short_str(buf: &mut BytesMut, s: &str, what: &'static str) -> Result<(), CodecError> {
    let len = u16::try_from(s.len()).map_err(|_| CodecError::TooLong(what))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_count(buf: &mut BytesMut, count: usize, what: &'static str) -> Result<(), CodecError> {
    buf.put_u32(u32::try_from(count).map_err(|_| CodecError::TooLong(what))?);
    Ok(())
}

fn put_blob(buf: &mut BytesMut, blob: &[u8], what: &'static str) -> Result<(), CodecError> {
    put_count(buf, blob.len(), what)?;
    buf.put_slice(blob);
    Ok(())
}

macro_rules! getter {
    ($name:ident, $ty:ty, $get:ident) => {
        fn $name(buf: &mut &[u8], what: &'static str) -> Result<$ty, CodecError> {
            if buf.remaining() < size_of::<$ty>() {
                return Err(CodecError::Truncated(what));
            }
            Ok(buf.$get())
        }
    };
}

getter!(get_u8, u8, get_u8);
getter!(get_u16, u16, get_u16);
getter!(get_u32, u32, get_u32);
getter!(get_i32, i32, get_i32);
getter!(get_i64, i64, get_i64);
getter!(get_u64, u64, get_u64);

fn get_flag(buf: &mut &[u8], what: &'static str) -> Result<bool, CodecError> {
    match get_u8(buf, what)? {
        0 => Ok(false),
        1 => Ok(true),
        value => Err(CodecError::BadFlag { what, value }),
    }
}

fn get_count(buf: &mut &[u8], what: &'static str) -> Result<u32, CodecError> {
    get_u32(buf, what)
}

fn get_bytes(buf: &mut &[u8], len: usize, what: &'static str) -> Result<Vec<u8>, CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Truncated(what));
    }
    let (head, tail) = buf.split_at(len);
    let out = head.to_vec();
    *buf = tail;
    Ok(out)
}

fn get_blob(buf: &mut &[u8], what: &'static str) -> Result<Vec<u8>, CodecError> {
    let len = get_u32(buf, what)? as usize;
    get_bytes(buf, len, what)
}

fn get_short_str(buf: &mut &[u8], what: &'static str) -> Result<String, CodecError> {
    let len = usize::from(get_u16(buf, what)?);
    String::from_utf8(get_bytes(buf, len, what)?).map_err(|_| CodecError::InvalidUtf8(what))
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};
    use tally_core::{FieldDef, FieldType, FieldValue, MergeSchema};

    use super::*;

    const SERVICE: KindId = KindId(1);

    fn codec() -> EventCodec {
        let schema = MergeSchema::new([
            FieldDef::identity("name", FieldType::Str),
            FieldDef::sum("calls", FieldType::Long),
            FieldDef::sum("latency", FieldType::Double),
            FieldDef::overwrite("healthy", FieldType::Bool),
            FieldDef::overwrite("trace", FieldType::Bytes),
        ])
        .unwrap();
        EventCodec::new(RemoteSchemas::new().with(SERVICE, schema))
    }

    fn event() -> Event {
        Event::for_entity(SERVICE, "svc-42", TimeBucket::from_raw(202401010930).unwrap())
            .with(0, "checkout")
            .with(1, 3i64)
            .with(3, true)
    }

    #[test]
    fn only_set_fields_come_back() {
        let codec = codec();
        let frame = codec.encode_event(&event()).unwrap();
        let decoded = codec.decode_event(&frame).unwrap();
        check!(decoded.identity() == event().identity());
        check!(decoded.partition_key() == Some("svc-42"));
        check!(
            decoded.payload()
                == &[
                    (0, FieldValue::Str("checkout".into())),
                    (1, FieldValue::Long(3)),
                    (3, FieldValue::Bool(true)),
                ][..]
        );
    }

    #[test]
    fn repeated_deltas_are_folded() {
        let codec = codec();
        let event = event().with(1, 4i64).with_partition_key(None::<&str>);
        let decoded = codec.decode_event(&codec.encode_event(&event).unwrap()).unwrap();
        check!(decoded.payload()[1] == (1, FieldValue::Long(7)));
        check!(decoded.partition_key() == None);
    }

    #[test]
    fn every_truncation_is_rejected() {
        let codec = codec();
        let frame = codec.encode_event(&event()).unwrap();
        for cut in 0..frame.len() {
            let_assert!(Err(CodecError::Truncated(_)) = codec.decode_event(&frame[..cut]));
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let codec = codec();
        let mut frame = BytesMut::from(&codec.encode_event(&event()).unwrap()[..]);
        frame.put_u8(0);
        check!(codec.decode_event(&frame) == Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn flags_must_be_zero_or_one() {
        let message = RemoteMessage {
            identity: event().identity().clone(),
            partition_key: None,
            mask: 0,
            data: RemoteData {
                bools: vec![true],
                ..RemoteData::default()
            },
        };
        let mut frame = BytesMut::new();
        message.encode(&mut frame).unwrap();
        check!(RemoteMessage::decode(&frame).is_ok());

        // version, kind, entity id, bucket
        let key_flag = 1 + 2 + 2 + "svc-42".len() + 8;
        let mut bad_key = frame.clone();
        check!(bad_key[key_flag] == 0);
        bad_key[key_flag] = 2;
        check!(
            RemoteMessage::decode(&bad_key).err()
                == Some(CodecError::BadFlag { what: "partition key", value: 2 })
        );

        // the bool is followed only by the empty bytes list
        let bool_at = frame.len() - 5;
        let mut bad_bool = frame.clone();
        check!(bad_bool[bool_at] == 1);
        bad_bool[bool_at] = 0xff;
        check!(
            RemoteMessage::decode(&bad_bool).err()
                == Some(CodecError::BadFlag { what: "bool field", value: 0xff })
        );
    }

    #[test]
    fn version_and_kind_are_checked() {
        let codec = codec();
        let mut frame = BytesMut::from(&codec.encode_event(&event()).unwrap()[..]);
        frame[0] = 9;
        check!(codec.decode_event(&frame) == Err(CodecError::BadVersion(9)));

        let unknown = Event::for_entity(KindId(7), "x", TimeBucket::from_raw(20240101).unwrap());
        check!(codec.encode_event(&unknown) == Err(CodecError::UnknownKind(KindId(7))));
    }

    #[test]
    fn mask_beyond_schema_is_rejected() {
        let codec = codec();
        let mut message = codec.to_message(&event()).unwrap();
        message.mask |= 1 << 10;
        let_assert!(Err(CodecError::BadMask { len: 5, .. }) = codec.from_message(message));
    }

    #[test]
    fn mistyped_payload_fails_to_encode() {
        let codec = codec();
        let event = event().with(1, "three");
        let_assert!(Err(CodecError::Merge(_)) = codec.encode_event(&event));
    }
}
