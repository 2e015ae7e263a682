use std::ops;

use super::point::Point;

/// A span of text measured both in bytes and in rows/columns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Length {
    pub bytes: u32,
    pub extent: Point,
}

impl Length {
    pub const ZERO: Self = Self {
        bytes: 0,
        extent: Point::ZERO,
    };

    /// Sentinel for "no length recorded yet".
    pub const UNDEFINED: Self = Self {
        bytes: 0,
        extent: Point { row: 0, column: 1 },
    };

    pub const MAX: Self = Self {
        bytes: u32::MAX,
        extent: Point::MAX,
    };

    #[must_use]
    pub const fn new(bytes: u32, extent: Point) -> Self {
        Self { bytes, extent }
    }

    #[inline]
    #[must_use]
    pub const fn is_undefined(self) -> bool {
        self.bytes == 0 && self.extent.column != 0
    }

    #[inline]
    #[must_use]
    pub const fn min(self, other: Self) -> Self {
        if self.bytes < other.bytes {
            self
        } else {
            other
        }
    }

    #[inline]
    #[must_use]
    pub fn saturating_sub(self, other: Self) -> Self {
        if self.bytes > other.bytes {
            self - other
        } else {
            Self::ZERO
        }
    }
}

impl ops::Add for Length {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            bytes: self.bytes + other.bytes,
            extent: self.extent + other.extent,
        }
    }
}

impl ops::AddAssign for Length {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl ops::Sub for Length {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Self {
            bytes: self.bytes.saturating_sub(other.bytes),
            extent: self.extent - other.extent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_crosses_lines() {
        let a = Length::new(5, Point::new(0, 5));
        let b = Length::new(4, Point::new(1, 2));
        assert_eq!(a + b, Length::new(9, Point::new(1, 2)));
    }

    #[test]
    fn saturating_sub_clamps_to_zero() {
        let a = Length::new(3, Point::new(0, 3));
        let b = Length::new(5, Point::new(0, 5));
        assert_eq!(a.saturating_sub(b), Length::ZERO);
        assert_eq!(b.saturating_sub(a), Length::new(2, Point::new(0, 2)));
    }

    #[test]
    fn undefined_is_distinct_from_zero() {
        assert!(Length::UNDEFINED.is_undefined());
        assert!(!Length::ZERO.is_undefined());
        assert_eq!(Length::ZERO.min(Length::MAX), Length::ZERO);
    }
}
