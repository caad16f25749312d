//! Address flavors used across the rewriter.
//!
//! Three kinds of 32-bit address flow through the pipeline and must never be
//! mixed up: offsets from the image base (RVAs), absolute virtual addresses,
//! and raw file offsets. Each gets its own newtype; conversions live in the
//! PE layer, which knows the section table.

use std::fmt;
use std::marker::PhantomData;

macro_rules! address_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub u32);

        impl $name {
            pub const ZERO: Self = Self(0);

            pub fn value(self) -> u32 {
                self.0
            }

            pub fn checked_add(self, offset: u32) -> Option<Self> {
                self.0.checked_add(offset).map(Self)
            }

            pub fn checked_sub(self, other: Self) -> Option<u32> {
                self.0.checked_sub(other.0)
            }

            /// Rounds up to the next multiple of `alignment`.
            pub fn align_up(self, alignment: u32) -> Self {
                Self(common::align_up(self.0, alignment))
            }

            pub fn is_aligned(self, alignment: u32) -> bool {
                common::is_aligned(self.0, alignment)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }

        impl std::ops::Add<u32> for $name {
            type Output = Self;
            fn add(self, rhs: u32) -> Self {
                Self(self.0 + rhs)
            }
        }
    };
}

address_newtype! {
    /// Offset from the image base (an RVA).
    RelativeAddress
}
address_newtype! {
    /// Image base plus RVA; what the loader sees at run-time.
    AbsoluteAddress
}
address_newtype! {
    /// Offset into the on-disk file.
    FileOffset
}

/// A half-open `[start, start + size)` range over one address flavor.
///
/// Construction enforces `size > 0`; an empty range has no meaning in an
/// address space. Ranges order by start, ties broken by size, which gives
/// the `BTreeMap` in [`crate::AddressSpace`] a usable total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange<A> {
    start: u32,
    size: u32,
    _marker: PhantomData<A>,
}

pub type RelativeRange = AddressRange<RelativeAddress>;
pub type FileRange = AddressRange<FileOffset>;

impl<A: AddressKind> AddressRange<A> {
    pub fn new(start: A, size: u32) -> Option<Self> {
        if size == 0 {
            return None;
        }
        start.raw().checked_add(size)?;
        Some(Self {
            start: start.raw(),
            size,
            _marker: PhantomData,
        })
    }

    pub fn start(&self) -> A {
        A::from_raw(self.start)
    }

    pub fn end(&self) -> A {
        A::from_raw(self.start + self.size)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn contains(&self, addr: A) -> bool {
        let a = addr.raw();
        a >= self.start && a < self.start + self.size
    }

    pub fn contains_range(&self, other: &Self) -> bool {
        other.start >= self.start && other.start + other.size <= self.start + self.size
    }

    pub fn intersects(&self, other: &Self) -> bool {
        other.start < self.start + self.size && self.start < other.start + other.size
    }
}

impl<A: AddressKind> PartialOrd for AddressRange<A> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<A: AddressKind> Ord for AddressRange<A> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.start
            .cmp(&other.start)
            .then(self.size.cmp(&other.size))
    }
}

impl<A: AddressKind> fmt::Display for AddressRange<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.start + self.size)
    }
}

/// Implemented by the three address newtypes so ranges can be generic
/// without giving up the type distinction.
pub trait AddressKind: Copy + Ord {
    fn raw(self) -> u32;
    fn from_raw(raw: u32) -> Self;
}

macro_rules! address_kind {
    ($name:ident) => {
        impl AddressKind for $name {
            fn raw(self) -> u32 {
                self.0
            }
            fn from_raw(raw: u32) -> Self {
                Self(raw)
            }
        }
    };
}

address_kind!(RelativeAddress);
address_kind!(AbsoluteAddress);
address_kind!(FileOffset);

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u32, size: u32) -> RelativeRange {
        AddressRange::new(RelativeAddress(start), size).unwrap()
    }

    #[test]
    fn zero_size_rejected() {
        assert!(AddressRange::<RelativeAddress>::new(RelativeAddress(10), 0).is_none());
    }

    #[test]
    fn overflowing_range_rejected() {
        assert!(AddressRange::<RelativeAddress>::new(RelativeAddress(u32::MAX), 2).is_none());
    }

    #[test]
    fn intersection() {
        assert!(range(100, 10).intersects(&range(105, 10)));
        assert!(range(100, 10).intersects(&range(95, 6)));
        assert!(!range(100, 10).intersects(&range(110, 5)));
        assert!(!range(110, 5).intersects(&range(100, 10)));
    }

    #[test]
    fn containment() {
        let outer = range(100, 100);
        assert!(outer.contains_range(&range(100, 100)));
        assert!(outer.contains_range(&range(150, 10)));
        assert!(!outer.contains_range(&range(150, 51)));
        assert!(outer.contains(RelativeAddress(199)));
        assert!(!outer.contains(RelativeAddress(200)));
    }

    #[test]
    fn ordering_by_start_then_size() {
        assert!(range(100, 10) < range(101, 1));
        assert!(range(100, 5) < range(100, 10));
    }

    #[test]
    fn address_arithmetic() {
        let a = RelativeAddress(0x1000);
        assert_eq!(a + 0x10, RelativeAddress(0x1010));
        assert_eq!(a.align_up(0x1000), a);
        assert_eq!((a + 1).align_up(0x1000), RelativeAddress(0x2000));
        assert_eq!(RelativeAddress(u32::MAX).checked_add(1), None);
    }
}
