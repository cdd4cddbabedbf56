//! Replicable values. A [`Value`] wraps its current data together with the data last written to
//!  the wire, which is the reference for deciding whether a change is big enough to be replicated.

use crate::buf_ext::{BufExt, BufMutExt};
use crate::math::{Point2, Point3, Quaternion, Vector2, Vector3};
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Maximum length of string and data values. Any single value fits into one `LinkUpdate`
///  datagram together with its headers.
pub const MAX_VARIABLE_LEN: usize = 65_000;

/// Type tag of a value on the wire, used to verify that both sides of a link agree on the
///  layout of a state
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ValueType {
    SInt8 = 0,
    UInt8 = 1,
    SInt16 = 2,
    UInt16 = 3,
    SInt32 = 4,
    UInt32 = 5,
    SInt64 = 6,
    UInt64 = 7,
    Float16 = 8,
    Float32 = 9,
    Float64 = 10,
    String = 11,
    Data = 12,
    Point2S8 = 13,
    Point2U8 = 14,
    Point2S16 = 15,
    Point2U16 = 16,
    Point2S32 = 17,
    Point2U32 = 18,
    Point2S64 = 19,
    Point2U64 = 20,
    Point3S8 = 21,
    Point3U8 = 22,
    Point3S16 = 23,
    Point3U16 = 24,
    Point3S32 = 25,
    Point3U32 = 26,
    Point3S64 = 27,
    Point3U64 = 28,
    Vector2F16 = 29,
    Vector2F32 = 30,
    Vector2F64 = 31,
    Vector3F16 = 32,
    Vector3F32 = 33,
    Vector3F64 = 34,
    QuaternionF16 = 35,
    QuaternionF32 = 36,
    QuaternionF64 = 37,
}

/// Wire width of integer values and integer point components. Values are held as `i64`; `U64`
///  values above `i64::MAX` are held by their bit pattern.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum IntegerFormat {
    S8,
    U8,
    S16,
    U16,
    S32,
    U32,
    S64,
    U64,
}

impl IntegerFormat {
    fn tag_offset(&self) -> u8 {
        match self {
            IntegerFormat::S8 => 0,
            IntegerFormat::U8 => 1,
            IntegerFormat::S16 => 2,
            IntegerFormat::U16 => 3,
            IntegerFormat::S32 => 4,
            IntegerFormat::U32 => 5,
            IntegerFormat::S64 => 6,
            IntegerFormat::U64 => 7,
        }
    }

    /// wraps a value to the format's width, the way the peer will see it after a round trip
    pub fn normalize(&self, value: i64) -> i64 {
        match self {
            IntegerFormat::S8 => value as i8 as i64,
            IntegerFormat::U8 => value as u8 as i64,
            IntegerFormat::S16 => value as i16 as i64,
            IntegerFormat::U16 => value as u16 as i64,
            IntegerFormat::S32 => value as i32 as i64,
            IntegerFormat::U32 => value as u32 as i64,
            IntegerFormat::S64 | IntegerFormat::U64 => value,
        }
    }

    fn write(&self, value: i64, buf: &mut BytesMut) {
        match self {
            IntegerFormat::S8 => buf.put_i8(value as i8),
            IntegerFormat::U8 => buf.put_u8(value as u8),
            IntegerFormat::S16 => buf.put_i16_le(value as i16),
            IntegerFormat::U16 => buf.put_u16_le(value as u16),
            IntegerFormat::S32 => buf.put_i32_le(value as i32),
            IntegerFormat::U32 => buf.put_u32_le(value as u32),
            IntegerFormat::S64 => buf.put_i64_le(value),
            IntegerFormat::U64 => buf.put_u64_le(value as u64),
        }
    }

    fn read(&self, buf: &mut impl Buf) -> anyhow::Result<i64> {
        Ok(match self {
            IntegerFormat::S8 => buf.try_get_i8()? as i64,
            IntegerFormat::U8 => buf.try_get_u8()? as i64,
            IntegerFormat::S16 => buf.try_get_i16_le()? as i64,
            IntegerFormat::U16 => buf.try_get_u16_le()? as i64,
            IntegerFormat::S32 => buf.try_get_i32_le()? as i64,
            IntegerFormat::U32 => buf.try_get_u32_le()? as i64,
            IntegerFormat::S64 => buf.try_get_i64_le()?,
            IntegerFormat::U64 => buf.try_get_u64_le()? as i64,
        })
    }
}

/// Wire width of floating point values and vector / quaternion components
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FloatFormat {
    F16,
    F32,
    F64,
}

impl FloatFormat {
    fn tag_offset(&self) -> u8 {
        match self {
            FloatFormat::F16 => 0,
            FloatFormat::F32 => 1,
            FloatFormat::F64 => 2,
        }
    }

    /// the smallest precision a value of this format can be configured with
    pub fn precision_floor(&self) -> f64 {
        match self {
            FloatFormat::F16 => 1e-3,
            FloatFormat::F32 => 1e-7,
            FloatFormat::F64 => 1e-15,
        }
    }

    pub fn normalize(&self, value: f64) -> f64 {
        match self {
            FloatFormat::F16 => crate::buf_ext::half_to_f32(crate::buf_ext::f32_to_half(value as f32)) as f64,
            FloatFormat::F32 => value as f32 as f64,
            FloatFormat::F64 => value,
        }
    }

    fn write(&self, value: f64, buf: &mut BytesMut) {
        match self {
            FloatFormat::F16 => buf.put_f16_le(value as f32),
            FloatFormat::F32 => buf.put_f32_le(value as f32),
            FloatFormat::F64 => buf.put_f64_le(value),
        }
    }

    fn read(&self, buf: &mut impl Buf) -> anyhow::Result<f64> {
        Ok(match self {
            FloatFormat::F16 => buf.try_get_f16_le()? as f64,
            FloatFormat::F32 => buf.try_get_f32_le()? as f64,
            FloatFormat::F64 => buf.try_get_f64_le()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
    Integer(IntegerFormat, i64),
    Float(FloatFormat, f64),
    String(String),
    Data(Bytes),
    Point2(IntegerFormat, Point2),
    Point3(IntegerFormat, Point3),
    Vector2(FloatFormat, Vector2),
    Vector3(FloatFormat, Vector3),
    Quaternion(FloatFormat, Quaternion),
}

impl ValueData {
    /// A zero / empty value for a wire type tag, i.e. the value a state has before anything was
    ///  received for a slot
    pub fn default_for(value_type: ValueType) -> ValueData {
        const INTEGER_FORMATS: [IntegerFormat; 8] = [
            IntegerFormat::S8, IntegerFormat::U8, IntegerFormat::S16, IntegerFormat::U16,
            IntegerFormat::S32, IntegerFormat::U32, IntegerFormat::S64, IntegerFormat::U64,
        ];
        const FLOAT_FORMATS: [FloatFormat; 3] = [FloatFormat::F16, FloatFormat::F32, FloatFormat::F64];

        let tag: u8 = value_type.into();
        let int_format = |offset: u8| INTEGER_FORMATS[offset as usize];
        let float_format = |offset: u8| FLOAT_FORMATS[offset as usize];

        match tag {
            0..=7 => ValueData::Integer(int_format(tag), 0),
            8..=10 => ValueData::Float(float_format(tag - 8), 0.0),
            11 => ValueData::String(String::new()),
            12 => ValueData::Data(Bytes::new()),
            13..=20 => ValueData::Point2(int_format(tag - 13), Point2::default()),
            21..=28 => ValueData::Point3(int_format(tag - 21), Point3::default()),
            29..=31 => ValueData::Vector2(float_format(tag - 29), Vector2::default()),
            32..=34 => ValueData::Vector3(float_format(tag - 32), Vector3::default()),
            _ => ValueData::Quaternion(float_format(tag - 35), Quaternion::default()),
        }
    }

    pub fn type_tag(&self) -> u8 {
        match self {
            ValueData::Integer(f, _) => f.tag_offset(),
            ValueData::Float(f, _) => 8 + f.tag_offset(),
            ValueData::String(_) => 11,
            ValueData::Data(_) => 12,
            ValueData::Point2(f, _) => 13 + f.tag_offset(),
            ValueData::Point3(f, _) => 21 + f.tag_offset(),
            ValueData::Vector2(f, _) => 29 + f.tag_offset(),
            ValueData::Vector3(f, _) => 32 + f.tag_offset(),
            ValueData::Quaternion(f, _) => 35 + f.tag_offset(),
        }
    }

    pub fn value_type(&self) -> ValueType {
        ValueType::try_from(self.type_tag())
            .unwrap_or_else(|_| unreachable!("every variant maps to a known type tag"))
    }

    fn float_format(&self) -> Option<FloatFormat> {
        match self {
            ValueData::Float(f, _)
            | ValueData::Vector2(f, _)
            | ValueData::Vector3(f, _)
            | ValueData::Quaternion(f, _) => Some(*f),
            _ => None,
        }
    }

    /// rounds the data to what survives the wire, and rejects data that does not fit the wire
    ///  format at all
    fn normalized(self) -> anyhow::Result<ValueData> {
        Ok(match self {
            ValueData::Integer(f, v) => ValueData::Integer(f, f.normalize(v)),
            ValueData::Float(f, v) => ValueData::Float(f, f.normalize(v)),
            ValueData::String(s) => {
                if s.len() > MAX_VARIABLE_LEN {
                    bail!("string value of {} bytes exceeds the maximum of {}", s.len(), MAX_VARIABLE_LEN);
                }
                ValueData::String(s)
            }
            ValueData::Data(d) => {
                if d.len() > MAX_VARIABLE_LEN {
                    bail!("data value of {} bytes exceeds the maximum of {}", d.len(), MAX_VARIABLE_LEN);
                }
                ValueData::Data(d)
            }
            ValueData::Point2(f, p) => ValueData::Point2(f, Point2::new(f.normalize(p.x), f.normalize(p.y))),
            ValueData::Point3(f, p) => ValueData::Point3(f, Point3::new(f.normalize(p.x), f.normalize(p.y), f.normalize(p.z))),
            ValueData::Vector2(f, v) => ValueData::Vector2(f, Vector2::new(f.normalize(v.x), f.normalize(v.y))),
            ValueData::Vector3(f, v) => ValueData::Vector3(f, Vector3::new(f.normalize(v.x), f.normalize(v.y), f.normalize(v.z))),
            ValueData::Quaternion(f, q) => ValueData::Quaternion(f, Quaternion::new(f.normalize(q.x), f.normalize(q.y), f.normalize(q.z), f.normalize(q.w))),
        })
    }

    fn components(&self) -> Vec<f64> {
        match self {
            ValueData::Float(_, v) => vec![*v],
            ValueData::Vector2(_, v) => vec![v.x, v.y],
            ValueData::Vector3(_, v) => vec![v.x, v.y, v.z],
            ValueData::Quaternion(_, q) => vec![q.x, q.y, q.z, q.w],
            _ => vec![],
        }
    }

    /// Exact comparison for discrete data, component-wise absolute difference for floating
    ///  point data
    pub fn differs_from(&self, other: &ValueData, precision: f64) -> bool {
        if self.type_tag() != other.type_tag() {
            return true;
        }
        if self.float_format().is_none() {
            return self != other;
        }

        self.components().iter()
            .zip(other.components())
            .any(|(&a, b)| {
                if a.is_nan() || b.is_nan() {
                    a.is_nan() != b.is_nan()
                }
                else {
                    (a - b).abs() > precision
                }
            })
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        match self {
            ValueData::Integer(f, v) => f.write(*v, buf),
            ValueData::Float(f, v) => f.write(*v, buf),
            ValueData::String(s) => buf.put_string16(s)?,
            ValueData::Data(d) => buf.put_data16(d)?,
            ValueData::Point2(f, p) => {
                f.write(p.x, buf);
                f.write(p.y, buf);
            }
            ValueData::Point3(f, p) => {
                f.write(p.x, buf);
                f.write(p.y, buf);
                f.write(p.z, buf);
            }
            ValueData::Vector2(f, v) => {
                f.write(v.x, buf);
                f.write(v.y, buf);
            }
            ValueData::Vector3(f, v) => {
                f.write(v.x, buf);
                f.write(v.y, buf);
                f.write(v.z, buf);
            }
            ValueData::Quaternion(f, q) => {
                f.write(q.x, buf);
                f.write(q.y, buf);
                f.write(q.z, buf);
                f.write(q.w, buf);
            }
        }
        Ok(())
    }

    /// reads data of the same type as `self` from the buffer
    /// Reads a value of this value's type. Values that could not have been set locally, e.g.
    ///  strings beyond [`MAX_VARIABLE_LEN`], are rejected.
    pub fn deser_same_type(&self, buf: &mut impl Buf) -> anyhow::Result<ValueData> {
        let data = match self {
            ValueData::Integer(f, _) => ValueData::Integer(*f, f.read(buf)?),
            ValueData::Float(f, _) => ValueData::Float(*f, f.read(buf)?),
            ValueData::String(_) => ValueData::String(buf.try_get_string16()?),
            ValueData::Data(_) => ValueData::Data(buf.try_get_data16()?),
            ValueData::Point2(f, _) => ValueData::Point2(*f, Point2::new(f.read(buf)?, f.read(buf)?)),
            ValueData::Point3(f, _) => ValueData::Point3(*f, Point3::new(f.read(buf)?, f.read(buf)?, f.read(buf)?)),
            ValueData::Vector2(f, _) => ValueData::Vector2(*f, Vector2::new(f.read(buf)?, f.read(buf)?)),
            ValueData::Vector3(f, _) => ValueData::Vector3(*f, Vector3::new(f.read(buf)?, f.read(buf)?, f.read(buf)?)),
            ValueData::Quaternion(f, _) => ValueData::Quaternion(*f, Quaternion::new(f.read(buf)?, f.read(buf)?, f.read(buf)?, f.read(buf)?)),
        };
        data.normalized()
    }
}

/// One slot of a [`crate::state::State`]
#[derive(Debug, Clone)]
pub struct Value {
    data: ValueData,
    last_synced: ValueData,
    precision: f64,
}

impl Value {
    pub fn new(data: ValueData) -> anyhow::Result<Value> {
        let data = data.normalized()?;
        let precision = data.float_format()
            .map(|f| f.precision_floor())
            .unwrap_or(0.0);

        Ok(Value {
            last_synced: data.clone(),
            data,
            precision,
        })
    }

    pub fn data(&self) -> &ValueData {
        &self.data
    }

    pub fn type_tag(&self) -> u8 {
        self.data.type_tag()
    }

    pub fn precision(&self) -> f64 {
        self.precision
    }

    /// Sets the precision for change detection, never below the format's floor. Has no effect
    ///  on discrete values.
    pub fn set_precision(&mut self, precision: f64) {
        if let Some(format) = self.data.float_format() {
            self.precision = precision.max(format.precision_floor());
        }
    }

    /// Replaces the data, returning `true` if it moved away from the last synchronized data by
    ///  more than the precision
    pub fn set(&mut self, data: ValueData) -> anyhow::Result<bool> {
        if data.type_tag() != self.type_tag() {
            bail!("cannot change value type from {:?} to {:?}", self.data.value_type(), data.value_type());
        }
        self.data = data.normalized()?;
        Ok(self.needs_sync())
    }

    pub fn needs_sync(&self) -> bool {
        self.data.differs_from(&self.last_synced, self.precision)
    }

    pub(crate) fn mark_synced(&mut self) {
        self.last_synced = self.data.clone();
    }

    pub(crate) fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        self.data.ser(buf)
    }

    /// data as read from the peer, without applying it
    pub(crate) fn deser_data(&self, buf: &mut impl Buf) -> anyhow::Result<ValueData> {
        self.data.deser_same_type(buf)
    }

    /// applies data received from the peer: it is the synchronized state from now on
    pub(crate) fn apply_received(&mut self, data: ValueData) {
        self.data = data;
        self.last_synced = self.data.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::sint8(ValueData::Integer(IntegerFormat::S8, -3), ValueType::SInt8, vec![0xfd])]
    #[case::uint16(ValueData::Integer(IntegerFormat::U16, 0x1234), ValueType::UInt16, vec![0x34, 0x12])]
    #[case::sint16(ValueData::Integer(IntegerFormat::S16, 30), ValueType::SInt16, vec![30, 0])]
    #[case::uint64(ValueData::Integer(IntegerFormat::U64, -1), ValueType::UInt64, vec![0xff; 8])]
    #[case::float16(ValueData::Float(FloatFormat::F16, 1.0), ValueType::Float16, vec![0x00, 0x3c])]
    #[case::float32(ValueData::Float(FloatFormat::F32, 1.0), ValueType::Float32, vec![0, 0, 0x80, 0x3f])]
    #[case::string(ValueData::String("time".to_string()), ValueType::String, vec![4, 0, b't', b'i', b'm', b'e'])]
    #[case::data(ValueData::Data(Bytes::from_static(&[9, 8])), ValueType::Data, vec![2, 0, 9, 8])]
    #[case::point2(ValueData::Point2(IntegerFormat::S8, Point2::new(1, -1)), ValueType::Point2S8, vec![1, 0xff])]
    #[case::point3(ValueData::Point3(IntegerFormat::U16, Point3::new(1, 2, 3)), ValueType::Point3U16, vec![1, 0, 2, 0, 3, 0])]
    #[case::vector2(ValueData::Vector2(FloatFormat::F16, Vector2::new(1.0, -2.0)), ValueType::Vector2F16, vec![0x00, 0x3c, 0x00, 0xc0])]
    #[case::vector3(ValueData::Vector3(FloatFormat::F64, Vector3::new(0.0, 0.0, 0.0)), ValueType::Vector3F64, vec![0; 24])]
    #[case::quaternion(ValueData::Quaternion(FloatFormat::F16, Quaternion::IDENTITY), ValueType::QuaternionF16, vec![0, 0, 0, 0, 0, 0, 0x00, 0x3c])]
    fn test_ser_deser(#[case] data: ValueData, #[case] value_type: ValueType, #[case] expected: Vec<u8>) {
        assert_eq!(data.value_type(), value_type);

        let mut buf = BytesMut::new();
        data.ser(&mut buf).unwrap();
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut b: &[u8] = &buf;
        let deser = ValueData::default_for(value_type).deser_same_type(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, data);
    }

    #[test]
    fn test_default_for_every_tag() {
        for tag in 0..=37u8 {
            let value_type = ValueType::try_from(tag).unwrap();
            assert_eq!(ValueData::default_for(value_type).type_tag(), tag);
        }
        assert!(ValueType::try_from(38).is_err());
    }

    #[rstest]
    #[case::u8_wraps(IntegerFormat::U8, 256 + 7, 7)]
    #[case::s8_wraps(IntegerFormat::S8, 200, -56)]
    #[case::s16_keeps(IntegerFormat::S16, 45, 45)]
    #[case::u32_wraps(IntegerFormat::U32, -1, 0xffff_ffff)]
    fn test_integer_normalize(#[case] format: IntegerFormat, #[case] value: i64, #[case] expected: i64) {
        let value = Value::new(ValueData::Integer(format, value)).unwrap();
        assert_eq!(value.data(), &ValueData::Integer(format, expected));
    }

    #[rstest]
    #[case::equal(1.0, 1.0, 0.01, false)]
    #[case::within(1.0, 1.005, 0.01, false)]
    #[case::at_precision(1.0, 1.5, 0.5, false)]
    #[case::beyond(1.0, 1.02, 0.01, true)]
    #[case::negative(1.0, 0.98, 0.01, true)]
    fn test_float_change_detection(#[case] old: f64, #[case] new: f64, #[case] precision: f64, #[case] expected: bool) {
        let mut value = Value::new(ValueData::Float(FloatFormat::F64, old)).unwrap();
        value.set_precision(precision);
        assert_eq!(value.set(ValueData::Float(FloatFormat::F64, new)).unwrap(), expected);
    }

    #[test]
    fn test_vector_change_detection_is_component_wise() {
        let mut value = Value::new(ValueData::Vector3(FloatFormat::F64, Vector3::default())).unwrap();
        value.set_precision(0.1);
        assert!(!value.set(ValueData::Vector3(FloatFormat::F64, Vector3::new(0.05, 0.05, 0.05))).unwrap());
        assert!(value.set(ValueData::Vector3(FloatFormat::F64, Vector3::new(0.05, 0.05, 0.2))).unwrap());
    }

    #[rstest]
    #[case::f16(FloatFormat::F16, 1e-9, 1e-3)]
    #[case::f32(FloatFormat::F32, 1e-9, 1e-7)]
    #[case::f64(FloatFormat::F64, 0.0, 1e-15)]
    #[case::relaxed(FloatFormat::F64, 0.25, 0.25)]
    fn test_precision_floor(#[case] format: FloatFormat, #[case] requested: f64, #[case] expected: f64) {
        let mut value = Value::new(ValueData::Float(format, 0.0)).unwrap();
        value.set_precision(requested);
        assert_eq!(value.precision(), expected);
    }

    #[test]
    fn test_discrete_change_detection() {
        let mut value = Value::new(ValueData::String("a".to_string())).unwrap();
        assert!(!value.set(ValueData::String("a".to_string())).unwrap());
        assert!(value.set(ValueData::String("b".to_string())).unwrap());
        value.mark_synced();
        assert!(!value.needs_sync());
    }

    #[test]
    fn test_set_rejects_type_change() {
        let mut value = Value::new(ValueData::Integer(IntegerFormat::S16, 1)).unwrap();
        assert!(value.set(ValueData::Integer(IntegerFormat::S32, 1)).is_err());
    }

    #[test]
    fn test_oversized_string_from_peer_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16_le((MAX_VARIABLE_LEN + 1) as u16);
        buf.put_slice(&vec![b'x'; MAX_VARIABLE_LEN + 1]);
        let mut b: &[u8] = &buf;
        assert!(ValueData::String(String::new()).deser_same_type(&mut b).is_err());
    }

    #[test]
    fn test_oversized_string_rejected() {
        assert!(Value::new(ValueData::String("x".repeat(70_000))).is_err());
        assert!(Value::new(ValueData::String("x".repeat(MAX_VARIABLE_LEN + 1))).is_err());
        assert!(Value::new(ValueData::Data(Bytes::from(vec![0u8; MAX_VARIABLE_LEN + 1]))).is_err());
        assert!(Value::new(ValueData::String("x".repeat(MAX_VARIABLE_LEN))).is_ok());
    }

    #[test]
    fn test_apply_received_is_synced() {
        let mut value = Value::new(ValueData::Integer(IntegerFormat::S16, 30)).unwrap();
        value.apply_received(ValueData::Integer(IntegerFormat::S16, 45));
        assert_eq!(value.data(), &ValueData::Integer(IntegerFormat::S16, 45));
        assert!(!value.needs_sync());
    }

    #[test]
    fn test_deser_truncated() {
        let mut b: &[u8] = &[1, 2, 3];
        assert!(ValueData::default_for(ValueType::Float64).deser_same_type(&mut b).is_err());
    }
}
