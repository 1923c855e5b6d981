//! 16-bit register helpers

/// Combine two register bytes. Only the low 8 bits of each argument are used,
/// matching how poll values arrive as plain integers.
#[inline]
pub fn to_u16(low: i32, high: i32) -> u16 {
    u16::from_le_bytes([low as u8, high as u8])
}

/// Two's-complement variant of [`to_u16`]
#[inline]
pub fn to_i16(low: i32, high: i32) -> i16 {
    i16::from_le_bytes([low as u8, high as u8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine() {
        assert_eq!(to_u16(0x34, 0x12), 0x1234);
        assert_eq!(to_u16(0xff, 0xff), 0xffff);
        assert_eq!(to_i16(0xff, 0xff), -1);
        assert_eq!(to_i16(0x00, 0x80), i16::MIN);
        // Out-of-range inputs are truncated to a byte
        assert_eq!(to_u16(0x134, 0x212), 0x1234);
    }
}
