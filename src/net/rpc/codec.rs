//! Binary remote-call frame codec
//!
//! Frame layout after the REMOTE_CALL tag byte:
//!
//! ```text
//! meta(u8)      bits 0..1 node compression (1/2/4/4 bytes)
//!               bit  2    name compression (1 or 2 byte method id)
//!               bit  3    byte_only argument layout
//! node_target   sized per node compression
//! method_id     sized per name compression
//! arguments     normal: count(u8) then typed variants
//!               byte_only: padded f32 samples with trailing type tags
//! ```
//!
//! All integers are little-endian. The byte_only layout is what compact
//! clients emit for movement-style calls and has to be parsed exactly as
//! they produce it, including the padding-skip lookahead.

use super::RpcError;

/// Variant type tags on the wire
pub const TAG_NIL: u8 = 0;
pub const TAG_BOOL: u8 = 1;
pub const TAG_INT: u8 = 2;
pub const TAG_FLOAT: u8 = 3;
pub const TAG_STRING: u8 = 4;
pub const TAG_VECTOR3: u8 = 5;
pub const TAG_ARRAY: u8 = 6;
pub const TAG_DICT: u8 = 7;

/// Dynamically typed RPC argument
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Vector3 { x: f64, y: f64, z: f64 },
    Array(Vec<Variant>),
    /// Key/value pairs in wire order
    Dict(Vec<(String, Variant)>),
}

impl Variant {
    fn tag(&self) -> u8 {
        match self {
            Variant::Nil => TAG_NIL,
            Variant::Bool(_) => TAG_BOOL,
            Variant::Int(_) => TAG_INT,
            Variant::Float(_) => TAG_FLOAT,
            Variant::Str(_) => TAG_STRING,
            Variant::Vector3 { .. } => TAG_VECTOR3,
            Variant::Array(_) => TAG_ARRAY,
            Variant::Dict(_) => TAG_DICT,
        }
    }
}

/// A decoded remote call
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub node_target: u32,
    pub method_id: u16,
    pub byte_only: bool,
    pub args: Vec<Variant>,
}

// ---------------------------------------------------------------------------
// Cursor over a frame body
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Byte `offset` positions ahead of the cursor, without advancing
    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.data.get(self.pos + offset).copied()
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], RpcError> {
        if self.remaining() < n {
            return Err(RpcError::BadFrame(what));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self, what: &'static str) -> Result<u8, RpcError> {
        Ok(self.take(1, what)?[0])
    }

    fn read_u16(&mut self, what: &'static str) -> Result<u16, RpcError> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, RpcError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self, what: &'static str) -> Result<i64, RpcError> {
        let b = self.take(8, what)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_f32(&mut self, what: &'static str) -> Result<f32, RpcError> {
        let b = self.take(4, what)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_f64(&mut self, what: &'static str) -> Result<f64, RpcError> {
        let b = self.take(8, what)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_string(&mut self) -> Result<String, RpcError> {
        let len = self.read_u32("string length")? as usize;
        if len > self.remaining() {
            return Err(RpcError::BadFrame("string length overruns buffer"));
        }
        let bytes = self.take(len, "string data")?;
        String::from_utf8(bytes.to_vec()).map_err(|_| RpcError::BadFrame("string is not UTF-8"))
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a frame body (everything after the REMOTE_CALL tag byte)
pub fn decode_frame(body: &[u8]) -> Result<RemoteCall, RpcError> {
    let mut cur = Cursor::new(body);

    let meta = cur.read_u8("meta byte")?;
    let node_comp = meta & 0x03;
    let name_comp = (meta >> 2) & 0x01;
    let byte_only = (meta >> 3) & 0x01 != 0;

    let node_target = match node_comp {
        0 => cur.read_u8("node target")? as u32,
        1 => cur.read_u16("node target")? as u32,
        _ => cur.read_u32("node target")?,
    };

    let method_id = match name_comp {
        0 => cur.read_u8("method id")? as u16,
        _ => cur.read_u16("method id")?,
    };

    let args = if byte_only {
        read_args_byte_only(&mut cur)
    } else {
        read_args_normal(&mut cur)?
    };

    Ok(RemoteCall {
        node_target,
        method_id,
        byte_only,
        args,
    })
}

fn read_args_normal(cur: &mut Cursor<'_>) -> Result<Vec<Variant>, RpcError> {
    let arg_count = cur.read_u8("argument count")?;
    let mut args = Vec::new();

    for _ in 0..arg_count {
        if cur.remaining() == 0 {
            break;
        }
        args.push(read_variant(cur)?);
    }

    Ok(args)
}

fn read_variant(cur: &mut Cursor<'_>) -> Result<Variant, RpcError> {
    let tag = cur.read_u8("variant tag")?;

    let variant = match tag {
        TAG_NIL => Variant::Nil,
        TAG_BOOL => Variant::Bool(cur.read_u8("bool payload")? != 0),
        TAG_INT => Variant::Int(cur.read_i64("int payload")?),
        TAG_FLOAT => Variant::Float(cur.read_f64("float payload")?),
        TAG_STRING => Variant::Str(cur.read_string()?),
        TAG_VECTOR3 => Variant::Vector3 {
            x: cur.read_f64("vector3 x")?,
            y: cur.read_f64("vector3 y")?,
            z: cur.read_f64("vector3 z")?,
        },
        TAG_ARRAY => {
            let count = cur.read_u32("array count")?;
            let mut items = Vec::new();
            for _ in 0..count {
                items.push(read_variant(cur)?);
            }
            Variant::Array(items)
        }
        TAG_DICT => {
            let count = cur.read_u32("dict count")?;
            let mut entries = Vec::new();
            for _ in 0..count {
                let key = cur.read_string()?;
                let value = read_variant(cur)?;
                entries.push((key, value));
            }
            Variant::Dict(entries)
        }
        // Unknown tags carry no payload and collapse to nil
        _ => Variant::Nil,
    };

    Ok(variant)
}

/// Parse the compact byte_only layout.
///
/// A sample is 3 padding bytes, a little-endian f32, and an optional type tag
/// in 0..=7. A missing tag means FLOAT. After a typed sample, 3 more padding
/// bytes are skipped when the byte 3 positions ahead is still a valid tag.
/// A type-slot byte above 7 but below 0x20 terminates the run; anything else
/// folds into the next sample. Truncated trailing bytes end parsing rather
/// than failing the frame.
fn read_args_byte_only(cur: &mut Cursor<'_>) -> Vec<Variant> {
    let mut args = Vec::new();

    if cur.remaining() >= 3 {
        cur.skip(3);
    }

    while cur.remaining() >= 4 {
        let Ok(sample) = cur.read_f32("byte_only sample") else {
            break;
        };

        let variant = match cur.peek() {
            Some(tag) if tag <= 7 => {
                cur.skip(1);
                let v = match tag {
                    TAG_FLOAT => Variant::Float(sample as f64),
                    TAG_INT => Variant::Int(sample as i64),
                    TAG_BOOL => Variant::Bool(sample != 0.0),
                    _ => Variant::Nil,
                };
                if cur.remaining() > 3 && cur.peek_at(3).is_some_and(|b| b <= 7) {
                    cur.skip(3);
                }
                v
            }
            _ => Variant::Float(sample as f64),
        };

        args.push(variant);

        match cur.peek() {
            None => break,
            Some(b) if b > 7 && b < 0x20 => break,
            _ => {}
        }
    }

    args
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a call into a frame body (REMOTE_CALL tag not included)
pub fn encode_frame(call: &RemoteCall) -> Result<Vec<u8>, RpcError> {
    let mut buf = Vec::with_capacity(16);

    let node_comp: u8 = if call.node_target <= 0xFF {
        0
    } else if call.node_target <= 0xFFFF {
        1
    } else {
        2
    };
    let name_comp: u8 = if call.method_id <= 0xFF { 0 } else { 1 };

    let mut meta = node_comp | (name_comp << 2);
    if call.byte_only {
        meta |= 1 << 3;
    }
    buf.push(meta);

    match node_comp {
        0 => buf.push(call.node_target as u8),
        1 => buf.extend_from_slice(&(call.node_target as u16).to_le_bytes()),
        _ => buf.extend_from_slice(&call.node_target.to_le_bytes()),
    }

    match name_comp {
        0 => buf.push(call.method_id as u8),
        _ => buf.extend_from_slice(&call.method_id.to_le_bytes()),
    }

    if call.byte_only {
        write_args_byte_only(&mut buf, &call.args)?;
    } else {
        if call.args.len() > u8::MAX as usize {
            return Err(RpcError::Encode("more than 255 arguments"));
        }
        buf.push(call.args.len() as u8);
        for arg in &call.args {
            write_variant(&mut buf, arg);
        }
    }

    Ok(buf)
}

fn write_variant(buf: &mut Vec<u8>, variant: &Variant) {
    buf.push(variant.tag());

    match variant {
        Variant::Nil => {}
        Variant::Bool(b) => buf.push(u8::from(*b)),
        Variant::Int(i) => buf.extend_from_slice(&i.to_le_bytes()),
        Variant::Float(f) => buf.extend_from_slice(&f.to_le_bytes()),
        Variant::Str(s) => write_string(buf, s),
        Variant::Vector3 { x, y, z } => {
            buf.extend_from_slice(&x.to_le_bytes());
            buf.extend_from_slice(&y.to_le_bytes());
            buf.extend_from_slice(&z.to_le_bytes());
        }
        Variant::Array(items) => {
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                write_variant(buf, item);
            }
        }
        Variant::Dict(entries) => {
            buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for (key, value) in entries {
                write_string(buf, key);
                write_variant(buf, value);
            }
        }
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// The compact layout only frames one scalar sample unambiguously; the
/// padding-skip lookahead makes multi-sample framing depend on the float
/// bytes themselves, so encoding is limited to what decodes back losslessly.
fn write_args_byte_only(buf: &mut Vec<u8>, args: &[Variant]) -> Result<(), RpcError> {
    if args.len() > 1 {
        return Err(RpcError::Encode("byte_only frames carry one scalar"));
    }

    buf.extend_from_slice(&[0, 0, 0]);

    if let Some(arg) = args.first() {
        let (value, tag) = match arg {
            Variant::Float(f) => (*f as f32, TAG_FLOAT),
            Variant::Int(i) => (*i as f32, TAG_INT),
            Variant::Bool(b) => (if *b { 1.0 } else { 0.0 }, TAG_BOOL),
            _ => return Err(RpcError::Encode("byte_only frames carry one scalar")),
        };
        buf.extend_from_slice(&value.to_le_bytes());
        buf.push(tag);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(method_id: u16, args: Vec<Variant>) -> RemoteCall {
        RemoteCall {
            node_target: 0,
            method_id,
            byte_only: false,
            args,
        }
    }

    #[test]
    fn test_round_trip_scalars() {
        let original = call(
            5,
            vec![
                Variant::Nil,
                Variant::Bool(true),
                Variant::Int(-42),
                Variant::Float(2.5),
                Variant::Str("hello".to_string()),
            ],
        );

        let body = encode_frame(&original).unwrap();
        assert_eq!(decode_frame(&body).unwrap(), original);
    }

    #[test]
    fn test_round_trip_shoot_call() {
        // method "shoot" pinned at id 5 with an int and a vector
        let original = call(
            5,
            vec![
                Variant::Int(3),
                Variant::Vector3 { x: 1.0, y: 2.0, z: 3.0 },
            ],
        );

        let body = encode_frame(&original).unwrap();
        let decoded = decode_frame(&body).unwrap();
        assert_eq!(decoded.method_id, 5);
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_round_trip_nested() {
        let original = call(
            300,
            vec![
                Variant::Array(vec![
                    Variant::Int(1),
                    Variant::Array(vec![Variant::Str("deep".to_string())]),
                ]),
                Variant::Dict(vec![
                    ("pos".to_string(), Variant::Vector3 { x: 0.5, y: 0.0, z: -0.5 }),
                    ("alive".to_string(), Variant::Bool(false)),
                ]),
            ],
        );

        let body = encode_frame(&original).unwrap();
        let decoded = decode_frame(&body).unwrap();
        // Method id above 255 forces 2-byte name compression
        assert_eq!(body[0] & 0x04, 0x04);
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_round_trip_float_bits_exact() {
        let exact = f64::from_bits(0x400921FB54442D18);
        let original = call(1, vec![Variant::Float(exact)]);
        let decoded = decode_frame(&encode_frame(&original).unwrap()).unwrap();
        match &decoded.args[0] {
            Variant::Float(f) => assert_eq!(f.to_bits(), exact.to_bits()),
            other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn test_node_compression_widths() {
        for (target, expected_comp) in [(0u32, 0u8), (255, 0), (256, 1), (65535, 1), (65536, 2)] {
            let original = RemoteCall {
                node_target: target,
                method_id: 1,
                byte_only: false,
                args: vec![],
            };
            let body = encode_frame(&original).unwrap();
            assert_eq!(body[0] & 0x03, expected_comp, "target {}", target);
            assert_eq!(decode_frame(&body).unwrap().node_target, target);
        }
    }

    #[test]
    fn test_byte_only_reference_frame() {
        // 20 08 00 05 | 00 00 00 | 00 00 80 3F | 03
        // meta=0x08 (byte_only), node=0, method=5, pad, f32 1.0, FLOAT tag
        let body = [
            0x08, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x80, 0x3F, 0x03,
        ];
        let decoded = decode_frame(&body).unwrap();

        assert!(decoded.byte_only);
        assert_eq!(decoded.method_id, 5);
        assert_eq!(decoded.args, vec![Variant::Float(1.0)]);
    }

    #[test]
    fn test_byte_only_implied_float() {
        // No trailing tag byte: the sample is FLOAT by default
        let mut body = vec![0x08, 0x00, 0x07, 0, 0, 0];
        body.extend_from_slice(&2.5f32.to_le_bytes());
        let decoded = decode_frame(&body).unwrap();
        assert_eq!(decoded.args, vec![Variant::Float(2.5)]);
    }

    #[test]
    fn test_byte_only_int_and_bool_conversion() {
        let mut body = vec![0x08, 0x00, 0x07, 0, 0, 0];
        body.extend_from_slice(&3.9f32.to_le_bytes());
        body.push(TAG_INT);
        let decoded = decode_frame(&body).unwrap();
        assert_eq!(decoded.args, vec![Variant::Int(3)]);

        let mut body = vec![0x08, 0x00, 0x07, 0, 0, 0];
        body.extend_from_slice(&1.0f32.to_le_bytes());
        body.push(TAG_BOOL);
        let decoded = decode_frame(&body).unwrap();
        assert_eq!(decoded.args, vec![Variant::Bool(true)]);
    }

    #[test]
    fn test_byte_only_terminator_byte_stops_parsing() {
        let mut body = vec![0x08, 0x00, 0x07, 0, 0, 0];
        body.extend_from_slice(&1.0f32.to_le_bytes());
        body.push(TAG_FLOAT);
        // 0x10 sits in the terminator range (> 7, < 0x20)
        body.push(0x10);
        body.extend_from_slice(&9.0f32.to_le_bytes());

        let decoded = decode_frame(&body).unwrap();
        assert_eq!(decoded.args, vec![Variant::Float(1.0)]);
    }

    #[test]
    fn test_byte_only_empty_args() {
        let body = [0x08, 0x00, 0x07];
        let decoded = decode_frame(&body).unwrap();
        assert!(decoded.args.is_empty());
    }

    #[test]
    fn test_byte_only_single_scalar_round_trip() {
        for arg in [Variant::Float(1.0), Variant::Int(7), Variant::Bool(true)] {
            let original = RemoteCall {
                node_target: 0,
                method_id: 5,
                byte_only: true,
                args: vec![arg.clone()],
            };
            let body = encode_frame(&original).unwrap();
            assert_eq!(decode_frame(&body).unwrap().args, vec![arg]);
        }
    }

    #[test]
    fn test_byte_only_encode_rejects_multiple_args() {
        let bad = RemoteCall {
            node_target: 0,
            method_id: 5,
            byte_only: true,
            args: vec![Variant::Float(1.0), Variant::Float(2.0)],
        };
        assert!(matches!(encode_frame(&bad), Err(RpcError::Encode(_))));
    }

    #[test]
    fn test_truncated_frames_rejected() {
        // Empty body
        assert!(decode_frame(&[]).is_err());
        // Meta but no node target
        assert!(decode_frame(&[0x00]).is_err());
        // Missing argument count
        assert!(decode_frame(&[0x00, 0x00]).is_err());
        // Int argument cut short
        let mut body = vec![0x00, 0x00, 0x05, 0x01, TAG_INT];
        body.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            decode_frame(&body),
            Err(RpcError::BadFrame(_))
        ));
    }

    #[test]
    fn test_string_length_overrun_rejected() {
        let mut body = vec![0x00, 0x00, 0x05, 0x01, TAG_STRING];
        body.extend_from_slice(&1000u32.to_le_bytes());
        body.extend_from_slice(b"short");
        assert!(matches!(
            decode_frame(&body),
            Err(RpcError::BadFrame("string length overruns buffer"))
        ));
    }

    #[test]
    fn test_fewer_args_than_count_tolerated() {
        // Count says 3 but the buffer ends cleanly after one variant
        let body = vec![0x00, 0x00, 0x05, 0x03, TAG_BOOL, 0x01];
        let decoded = decode_frame(&body).unwrap();
        assert_eq!(decoded.args, vec![Variant::Bool(true)]);
    }

    #[test]
    fn test_unknown_variant_tag_becomes_nil() {
        let body = vec![0x00, 0x00, 0x05, 0x01, 0x63];
        let decoded = decode_frame(&body).unwrap();
        assert_eq!(decoded.args, vec![Variant::Nil]);
    }

    #[test]
    fn test_dict_preserves_wire_order() {
        let original = call(
            9,
            vec![Variant::Dict(vec![
                ("zeta".to_string(), Variant::Int(1)),
                ("alpha".to_string(), Variant::Int(2)),
            ])],
        );
        let decoded = decode_frame(&encode_frame(&original).unwrap()).unwrap();
        match &decoded.args[0] {
            Variant::Dict(entries) => {
                assert_eq!(entries[0].0, "zeta");
                assert_eq!(entries[1].0, "alpha");
            }
            other => panic!("expected dict, got {:?}", other),
        }
    }
}
