//! Power-of-two alignment arithmetic.

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two and non-zero.
pub fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to the previous multiple of `alignment`.
pub fn align_down(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// True when `value` is a multiple of `alignment`.
pub fn is_aligned(value: u32, alignment: u32) -> bool {
    debug_assert!(alignment.is_power_of_two());
    value & (alignment - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
    }

    #[test]
    fn align_down_truncates() {
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
        assert_eq!(align_down(0x1000, 0x1000), 0x1000);
    }

    #[test]
    fn aligned_check() {
        assert!(is_aligned(0x200, 0x200));
        assert!(!is_aligned(0x201, 0x200));
    }
}
