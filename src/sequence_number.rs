use std::fmt::{Display, Formatter};
use std::ops::Add;
use bytes::{Buf, BufMut, BytesMut};

/// Number of a reliable message on the wire. Numbers are 16 bit and wrap around, so they are
///  only ever compared relative to a base number (see [`SequenceNumber::distance_from`]).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct SequenceNumber(u16);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }

    /// number of steps from `base` forward to `self`, modulo 65536
    pub fn distance_from(&self, base: SequenceNumber) -> u16 {
        self.0.wrapping_sub(base.0)
    }

    /// `true` if this number is in `[base, base + window)` with wraparound
    pub fn is_in_window(&self, base: SequenceNumber, window: u16) -> bool {
        self.distance_from(base) < window
    }

    /// `true` if this number is in `[base - window, base)` with wraparound, i.e. it was
    ///  processed recently
    pub fn is_recently_before(&self, base: SequenceNumber, window: u16) -> bool {
        let back = base.distance_from(*self);
        back > 0 && back <= window
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SequenceNumber> {
        Ok(SequenceNumber(buf.try_get_u16_le()?))
    }
}

impl Add<u16> for SequenceNumber {
    type Output = SequenceNumber;

    fn add(self, rhs: u16) -> Self::Output {
        SequenceNumber(self.0.wrapping_add(rhs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, 0, 10, true)]
    #[case::last_in_window(9, 0, 10, true)]
    #[case::first_outside(10, 0, 10, false)]
    #[case::below_base(65535, 0, 10, false)]
    #[case::wrapped_inside(3, 65530, 10, true)]
    #[case::wrapped_last(3, 65530, 9, false)]
    #[case::wrapped_base(65530, 65530, 10, true)]
    fn test_is_in_window(#[case] number: u16, #[case] base: u16, #[case] window: u16, #[case] expected: bool) {
        assert_eq!(SequenceNumber::from_raw(number).is_in_window(SequenceNumber::from_raw(base), window), expected);
    }

    #[rstest]
    #[case::same(5, 5, 10, false)]
    #[case::one_before(4, 5, 10, true)]
    #[case::window_before(0, 10, 10, true)]
    #[case::too_old(0, 11, 10, false)]
    #[case::wrapped(65535, 2, 10, true)]
    #[case::future(6, 5, 10, false)]
    fn test_is_recently_before(#[case] number: u16, #[case] base: u16, #[case] window: u16, #[case] expected: bool) {
        assert_eq!(SequenceNumber::from_raw(number).is_recently_before(SequenceNumber::from_raw(base), window), expected);
    }

    #[rstest]
    #[case::simple(1, 2)]
    #[case::wrap(65535, 0)]
    fn test_next(#[case] raw: u16, #[case] expected: u16) {
        assert_eq!(SequenceNumber::from_raw(raw).next(), SequenceNumber::from_raw(expected));
    }

    #[test]
    fn test_ser_little_endian() {
        let mut buf = BytesMut::new();
        SequenceNumber::from_raw(0x1234).ser(&mut buf);
        assert_eq!(buf.as_ref(), &[0x34, 0x12]);

        let mut b: &[u8] = &buf;
        assert_eq!(SequenceNumber::deser(&mut b).unwrap(), SequenceNumber::from_raw(0x1234));
        assert!(b.is_empty());
    }

    #[test]
    fn test_deser_short_buffer() {
        let mut b: &[u8] = &[1];
        assert!(SequenceNumber::deser(&mut b).is_err());
    }
}
