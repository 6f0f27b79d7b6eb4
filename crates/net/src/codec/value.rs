use super::{CodecError, Decoder, Encoder};

/// A decoded (or to-be-encoded) value tree. Command handlers receive and
/// return these; the codec moves them across the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i32),
    UInt(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Str(String),
    Bin(Vec<u8>),
    Seq(Vec<Value>),
    Struct(Vec<(String, Value)>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uint64(&self) -> Option<u64> {
        match self {
            Value::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Field lookup on a struct value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Struct(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

/// Structural schema for one command argument or result. Declared on both
/// peers; its field names feed the shared dictionary, and it drives typed
/// decode of incoming payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDesc {
    Bool,
    Int,
    UInt,
    UInt64,
    Float,
    Double,
    Str,
    Bin,
    Seq(Box<TypeDesc>),
    Struct(Vec<(String, TypeDesc)>),
}

impl TypeDesc {
    /// Every struct field name reachable from this descriptor, depth first.
    pub fn gather_field_names(&self, out: &mut Vec<String>) {
        match self {
            TypeDesc::Seq(inner) => inner.gather_field_names(out),
            TypeDesc::Struct(fields) => {
                for (name, desc) in fields {
                    out.push(name.clone());
                    desc.gather_field_names(out);
                }
            }
            _ => {}
        }
    }
}

pub fn encode_value(enc: &mut Encoder<'_>, value: &Value) -> Result<(), CodecError> {
    match value {
        Value::Bool(v) => enc.write_bool(*v),
        Value::Int(v) => enc.write_int(*v),
        Value::UInt(v) => enc.write_uint(*v),
        Value::UInt64(v) => enc.write_uint64(*v),
        Value::Float(v) => enc.write_float(*v),
        Value::Double(v) => enc.write_double(*v),
        Value::Str(v) => enc.write_str(v)?,
        Value::Bin(v) => enc.write_bin(v)?,
        Value::Seq(items) => {
            enc.begin_sequence();
            for item in items {
                encode_value(enc, item)?;
            }
            enc.end_sequence()?;
        }
        Value::Struct(fields) => {
            enc.begin_struct();
            for (name, item) in fields {
                enc.push_key(name);
                encode_value(enc, item)?;
                enc.pop_key();
            }
            enc.end_struct()?;
        }
    }
    Ok(())
}

pub fn decode_value(dec: &mut Decoder<'_, '_>, desc: &TypeDesc) -> Result<Value, CodecError> {
    Ok(match desc {
        TypeDesc::Bool => Value::Bool(dec.read_bool()?),
        TypeDesc::Int => Value::Int(dec.read_int()?),
        TypeDesc::UInt => Value::UInt(dec.read_uint()?),
        TypeDesc::UInt64 => Value::UInt64(dec.read_uint64()?),
        TypeDesc::Float => Value::Float(dec.read_float()?),
        TypeDesc::Double => Value::Double(dec.read_double()?),
        TypeDesc::Str => Value::Str(dec.read_str()?.to_owned()),
        TypeDesc::Bin => Value::Bin(dec.read_bin()?.to_vec()),
        TypeDesc::Seq(inner) => {
            let len = dec.begin_sequence()?;
            let mut items = Vec::with_capacity(len);
            for i in 0..len {
                items.push(decode_value(dec, inner)?);
                if i + 1 < len {
                    dec.next_element()?;
                }
            }
            dec.end_sequence()?;
            Value::Seq(items)
        }
        TypeDesc::Struct(fields) => {
            dec.begin_struct()?;
            let mut out = Vec::with_capacity(fields.len());
            for (name, field_desc) in fields {
                dec.push_key(name)?;
                out.push((name.clone(), decode_value(dec, field_desc)?));
                dec.pop_key()?;
            }
            dec.end_struct()?;
            Value::Struct(out)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ReadArena;
    use crate::mphf::StringMphf;

    fn dictionary() -> StringMphf {
        StringMphf::build(&[
            "moving", "position", "direction", "x", "y", "z", "name", "tags", "payload", "inner",
            "leaf", "depth",
        ])
        .unwrap()
    }

    fn round_trip(mphf: &StringMphf, desc: &TypeDesc, value: &Value) -> Value {
        let mut enc = Encoder::new(mphf);
        encode_value(&mut enc, value).unwrap();
        let bytes = enc.finish();

        let mut arena = ReadArena::new();
        let mut dec = Decoder::new(&mut arena, mphf, &bytes).unwrap();
        decode_value(&mut dec, desc).unwrap()
    }

    #[test]
    fn scalar_round_trips() {
        let mphf = dictionary();
        let cases = [
            (TypeDesc::Bool, Value::Bool(true)),
            (TypeDesc::Int, Value::Int(-41)),
            (TypeDesc::UInt, Value::UInt(0xdead_beef)),
            (TypeDesc::UInt64, Value::UInt64(u64::MAX - 1)),
            (TypeDesc::Float, Value::Float(1.5)),
            (TypeDesc::Double, Value::Double(-0.125)),
            (TypeDesc::Str, Value::Str("hello".into())),
            (TypeDesc::Bin, Value::Bin(vec![0, 1, 2, 255])),
        ];
        for (desc, value) in cases {
            assert_eq!(round_trip(&mphf, &desc, &value), value);
        }
    }

    #[test]
    fn deep_nesting_round_trips() {
        let mphf = dictionary();

        // 9 levels: struct > seq > struct > seq > struct > seq > struct >
        // seq > scalar.
        let mut desc = TypeDesc::Int;
        let mut value = Value::Int(7);
        for _ in 0..4 {
            desc = TypeDesc::Struct(vec![
                ("inner".into(), TypeDesc::Seq(Box::new(desc))),
                ("depth".into(), TypeDesc::Int),
            ]);
            value = Value::Struct(vec![
                ("inner".into(), Value::Seq(vec![value.clone(), value])),
                ("depth".into(), Value::Int(4)),
            ]);
        }
        assert_eq!(round_trip(&mphf, &desc, &value), value);
    }

    #[test]
    fn empty_and_nested_sequences() {
        let mphf = dictionary();
        let desc = TypeDesc::Seq(Box::new(TypeDesc::Seq(Box::new(TypeDesc::Int))));

        let empty = Value::Seq(vec![]);
        assert_eq!(round_trip(&mphf, &desc, &empty), empty);

        let mixed = Value::Seq(vec![
            Value::Seq(vec![]),
            Value::Seq(vec![Value::Int(1), Value::Int(2)]),
            Value::Seq(vec![]),
        ]);
        assert_eq!(round_trip(&mphf, &desc, &mixed), mixed);
    }

    #[test]
    fn struct_field_order_drift() {
        let mphf = dictionary();
        let value = Value::Struct(vec![
            ("x".into(), Value::Float(1.0)),
            ("y".into(), Value::Float(2.0)),
            ("z".into(), Value::Float(3.0)),
        ]);

        let mut enc = Encoder::new(&mphf);
        encode_value(&mut enc, &value).unwrap();
        let bytes = enc.finish();

        // Reader declares the fields in a different order.
        let drifted = TypeDesc::Struct(vec![
            ("z".into(), TypeDesc::Float),
            ("x".into(), TypeDesc::Float),
            ("y".into(), TypeDesc::Float),
        ]);
        let mut arena = ReadArena::new();
        let mut dec = Decoder::new(&mut arena, &mphf, &bytes).unwrap();
        let out = decode_value(&mut dec, &drifted).unwrap();
        assert_eq!(out.get("x"), Some(&Value::Float(1.0)));
        assert_eq!(out.get("y"), Some(&Value::Float(2.0)));
        assert_eq!(out.get("z"), Some(&Value::Float(3.0)));
    }

    #[test]
    fn oversize_payloads_rejected_at_encode() {
        let mphf = dictionary();

        let mut enc = Encoder::new(&mphf);
        let long = "x".repeat(256);
        assert_eq!(enc.write_str(&long), Err(CodecError::StringTooLong(256)));

        let mut enc = Encoder::new(&mphf);
        let blob = vec![0u8; 4096];
        assert_eq!(enc.write_bin(&blob), Err(CodecError::BinaryTooLong(4096)));

        // Limits themselves are fine.
        let mut enc = Encoder::new(&mphf);
        enc.write_str(&"x".repeat(255)).unwrap();
        enc.write_bin(&vec![0u8; 4095]).unwrap();
    }

    #[test]
    fn arena_reuse_is_stateless() {
        let mphf = dictionary();
        let mut arena = ReadArena::new();

        let first = Value::Seq(vec![Value::Str("abc".into()), Value::Str("def".into())]);
        let desc_a = TypeDesc::Seq(Box::new(TypeDesc::Str));
        let mut enc = Encoder::new(&mphf);
        encode_value(&mut enc, &first).unwrap();
        let bytes_a = enc.finish();
        let mut dec = Decoder::new(&mut arena, &mphf, &bytes_a).unwrap();
        assert_eq!(decode_value(&mut dec, &desc_a).unwrap(), first);

        let second = Value::Struct(vec![("leaf".into(), Value::Int(9))]);
        let desc_b = TypeDesc::Struct(vec![("leaf".into(), TypeDesc::Int)]);
        let mut enc = Encoder::new(&mphf);
        encode_value(&mut enc, &second).unwrap();
        let bytes_b = enc.finish();
        let mut dec = Decoder::new(&mut arena, &mphf, &bytes_b).unwrap();
        assert_eq!(decode_value(&mut dec, &desc_b).unwrap(), second);
    }

    #[test]
    fn runaway_nesting_fails_instead_of_recursing() {
        let mphf = dictionary();
        let mut arena = ReadArena::new();

        // 0xdd is two Sequence tags per byte; a large blob of them would
        // otherwise nest one parser frame per tag.
        let hostile = vec![0xddu8; 60_000];
        let result = Decoder::new(&mut arena, &mphf, &hostile).err();
        assert_eq!(result, Some(CodecError::NestingTooDeep));
    }

    #[test]
    fn truncated_stream_fails_whole_decode() {
        let mphf = dictionary();
        let mut enc = Encoder::new(&mphf);
        enc.write_str("truncate me").unwrap();
        let mut bytes = enc.finish();
        bytes.truncate(bytes.len() - 4);

        let mut arena = ReadArena::new();
        assert!(Decoder::new(&mut arena, &mphf, &bytes).is_err());
    }
}
