//! Encoding helpers on top of `bytes` for the parts of the wire format that are not plain
//!  little-endian scalars: length-prefixed strings and blobs, and half-precision floats.

use anyhow::{anyhow, bail};
use bytes::Bytes;

pub trait BufExt: bytes::Buf {
    fn try_get_bytes(&mut self, len: usize) -> anyhow::Result<Bytes> {
        if self.remaining() < len {
            bail!("buffer underflow: {} bytes requested, {} available", len, self.remaining());
        }
        Ok(self.copy_to_bytes(len))
    }

    /// a blob with a u16 length prefix
    fn try_get_data16(&mut self) -> anyhow::Result<Bytes> {
        let len = self.try_get_u16_le()?;
        self.try_get_bytes(len as usize)
    }

    fn try_get_string8(&mut self) -> anyhow::Result<String> {
        let len = self.try_get_u8()?;
        let raw = self.try_get_bytes(len as usize)?;
        Ok(String::from_utf8(raw.to_vec())?)
    }

    fn try_get_string16(&mut self) -> anyhow::Result<String> {
        let raw = self.try_get_data16()?;
        Ok(String::from_utf8(raw.to_vec())?)
    }

    fn try_get_f16_le(&mut self) -> anyhow::Result<f32> {
        Ok(half_to_f32(self.try_get_u16_le()?))
    }
}
impl <T: bytes::Buf> BufExt for T {}

pub trait BufMutExt: bytes::BufMut {
    fn put_data16(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let len: u16 = data.len().try_into()
            .map_err(|_| anyhow!("blob of {} bytes exceeds the u16 length prefix", data.len()))?;
        self.put_u16_le(len);
        self.put_slice(data);
        Ok(())
    }

    fn put_string8(&mut self, s: &str) -> anyhow::Result<()> {
        let len: u8 = s.len().try_into()
            .map_err(|_| anyhow!("string of {} bytes exceeds the u8 length prefix", s.len()))?;
        self.put_u8(len);
        self.put_slice(s.as_bytes());
        Ok(())
    }

    fn put_string16(&mut self, s: &str) -> anyhow::Result<()> {
        self.put_data16(s.as_bytes())
    }

    fn put_f16_le(&mut self, value: f32) {
        self.put_u16_le(f32_to_half(value));
    }
}
impl <T: bytes::BufMut> BufMutExt for T {}

/// Converts to IEEE 754 binary16, rounding to nearest even. Out-of-range values become infinity.
pub fn f32_to_half(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;

    if exponent == 0xff {
        let nan_bit = if mantissa != 0 { 0x0200 } else { 0 };
        return sign | 0x7c00 | nan_bit;
    }

    let half_exponent = exponent - 127 + 15;
    if half_exponent >= 0x1f {
        return sign | 0x7c00;
    }

    if half_exponent <= 0 {
        if half_exponent < -10 {
            return sign;
        }
        // subnormal: the implicit leading one becomes explicit
        let full = mantissa | 0x0080_0000;
        let shift = (14 - half_exponent) as u32;
        let round_bit = 1u32 << (shift - 1);
        let mut half_mantissa = full >> shift;
        if full & round_bit != 0 && full & (3 * round_bit - 1) != 0 {
            half_mantissa += 1;
        }
        return sign | half_mantissa as u16;
    }

    let half = sign | ((half_exponent as u16) << 10) | ((mantissa >> 13) as u16);
    let round_bit = 0x0000_1000;
    if mantissa & round_bit != 0 && mantissa & (3 * round_bit - 1) != 0 {
        // a carry into the exponent is the correct result, up to and including infinity
        half + 1
    }
    else {
        half
    }
}

pub fn half_to_f32(half: u16) -> f32 {
    let negative = half & 0x8000 != 0;
    let sign = ((half & 0x8000) as u32) << 16;
    let exponent = ((half >> 10) & 0x1f) as u32;
    let mantissa = (half & 0x03ff) as u32;

    match exponent {
        0 => {
            let magnitude = mantissa as f32 / 16_777_216.0;
            if negative { -magnitude } else { magnitude }
        }
        0x1f => f32::from_bits(sign | 0x7f80_0000 | (mantissa << 13)),
        _ => f32::from_bits(sign | ((exponent + 127 - 15) << 23) | (mantissa << 13)),
    }
}
