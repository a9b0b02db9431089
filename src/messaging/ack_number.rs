use std::fmt::{Debug, Display, Formatter};

/// Number of an outgoing packet, used by the peer to acknowledge it.
///
/// Ack numbers wrap around, and they skip 0: the raw value 0 is reserved on the wire for
///  "no packet received yet". The number space therefore has `u16::MAX` elements.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct AckNumber(u16);

impl Display for AckNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for AckNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl AckNumber {
    pub const FIRST: AckNumber = AckNumber(1);

    const SPACE: u32 = u16::MAX as u32;

    /// `None` for the reserved 'nothing received' value 0
    pub fn from_raw(value: u16) -> Option<AckNumber> {
        if value == 0 {
            None
        }
        else {
            Some(AckNumber(value))
        }
    }

    pub fn to_raw(self) -> u16 {
        self.0
    }

    pub fn raw_or_none(value: Option<AckNumber>) -> u16 {
        value.map(AckNumber::to_raw).unwrap_or(0)
    }

    fn index(self) -> u32 {
        self.0 as u32 - 1
    }

    fn from_index(index: u32) -> AckNumber {
        AckNumber((index % Self::SPACE + 1) as u16)
    }

    pub fn next(self) -> AckNumber {
        Self::from_index(self.index() + 1)
    }

    pub fn minus(self, n: u16) -> AckNumber {
        Self::from_index(self.index() + Self::SPACE - n as u32 % Self::SPACE)
    }

    /// wrap-around distance from `earlier` forward to `self`
    pub fn distance_from(self, earlier: AckNumber) -> u16 {
        ((self.index() + Self::SPACE - earlier.index()) % Self::SPACE) as u16
    }

    /// wrap-around comparison: `self` is considered newer if it is less than half the number
    ///  space ahead of `other`
    pub fn is_newer_than(self, other: AckNumber) -> bool {
        let distance = self.distance_from(other);
        distance != 0 && (distance as u32) < Self::SPACE / 2
    }
}
