use std::{cmp::Ordering, fmt, ops};

/// A position in a text document, expressed as a zero-based row and a
/// zero-based byte column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Point {
    pub row: u32,
    pub column: u32,
}

impl Point {
    pub const ZERO: Self = Self { row: 0, column: 0 };
    pub const MAX: Self = Self {
        row: u32::MAX,
        column: u32::MAX,
    };

    #[must_use]
    pub const fn new(row: u32, column: u32) -> Self {
        Self { row, column }
    }
}

impl PartialOrd for Point {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Point {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then(self.column.cmp(&other.column))
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.column)
    }
}

/// Extents compose: a right-hand side that spans lines replaces the column.
impl ops::Add for Point {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        if other.row > 0 {
            Self::new(self.row.saturating_add(other.row), other.column)
        } else {
            Self::new(self.row, self.column.saturating_add(other.column))
        }
    }
}

impl ops::Sub for Point {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        if self.row > other.row {
            Self::new(self.row - other.row, self.column)
        } else {
            Self::new(0, self.column.saturating_sub(other.column))
        }
    }
}

/// A range of positions in a multi-line text document, both in terms of
/// bytes and of rows and columns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Range {
    pub start_byte: u32,
    pub end_byte: u32,
    pub start_point: Point,
    pub end_point: Point,
}

impl Range {
    /// A range covering the whole document.
    pub const ALL: Self = Self {
        start_byte: 0,
        end_byte: u32::MAX,
        start_point: Point::ZERO,
        end_point: Point::MAX,
    };

    #[must_use]
    pub const fn byte_range(&self) -> std::ops::Range<u32> {
        self.start_byte..self.end_byte
    }

    /// Shift this range so that it stays attached to the same text after
    /// `edit`. Ends inside the edited span collapse onto the edit start.
    pub fn edit(&mut self, edit: &InputEdit) {
        if self.end_byte >= edit.old_end_byte {
            if self.end_byte != u32::MAX {
                (self.end_byte, self.end_point) = edit.shift(self.end_byte, self.end_point);
            }
        } else if self.end_byte > edit.start_byte {
            self.end_byte = edit.start_byte;
            self.end_point = edit.start_position;
        }

        if self.start_byte >= edit.old_end_byte {
            (self.start_byte, self.start_point) = edit.shift(self.start_byte, self.start_point);
        } else if self.start_byte > edit.start_byte {
            self.start_byte = edit.start_byte;
            self.start_point = edit.start_position;
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}-{}] {} - {}",
            self.start_byte, self.end_byte, self.start_point, self.end_point
        )
    }
}

/// A summary of a change to a text document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputEdit {
    pub start_byte: u32,
    pub old_end_byte: u32,
    pub new_end_byte: u32,
    pub start_position: Point,
    pub old_end_position: Point,
    pub new_end_position: Point,
}

impl InputEdit {
    /// Move a single position so that it follows the text it was attached
    /// to. Positions inside the replaced span snap to the new end.
    pub fn edit_point(&self, byte: &mut u32, point: &mut Point) {
        if *byte >= self.old_end_byte {
            (*byte, *point) = self.shift(*byte, *point);
        } else if *byte > self.start_byte {
            *byte = self.new_end_byte;
            *point = self.new_end_position;
        }
    }

    /// Move a position at or after the old end by the edit's delta. A
    /// position pushed past `u32::MAX` becomes the unbounded sentinel.
    fn shift(&self, byte: u32, point: Point) -> (u32, Point) {
        match (byte - self.old_end_byte).checked_add(self.new_end_byte) {
            Some(byte) => (byte, self.new_end_position + (point - self.old_end_position)),
            None => (u32::MAX, Point::MAX),
        }
    }
}
