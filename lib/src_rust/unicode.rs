//! Decoding of single code points from the raw byte chunks handed to the
//! lexer.

/// Text encodings the lexer can decode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InputEncoding {
    #[default]
    Utf8,
    Utf16Le,
    Utf16Be,
}

/// The result of decoding one code point: the number of bytes consumed and
/// the character, or `None` if the bytes were not valid in the encoding.
pub type Decoded = (u32, Option<char>);

impl InputEncoding {
    /// Decode the code point at the start of `bytes`.
    ///
    /// Returns `(0, None)` when `bytes` is too short to hold any code unit.
    #[inline]
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> Decoded {
        match self {
            Self::Utf8 => decode_utf8(bytes),
            Self::Utf16Le => decode_utf16(bytes, u16::from_le_bytes),
            Self::Utf16Be => decode_utf16(bytes, u16::from_be_bytes),
        }
    }

    /// The longest byte sequence a single code point can occupy.
    #[must_use]
    pub const fn max_code_point_len(self) -> usize {
        4
    }
}

/// Decode one UTF-8 code point, rejecting overlong forms and surrogates.
/// An invalid sequence consumes one byte.
#[inline]
pub fn decode_utf8(bytes: &[u8]) -> Decoded {
    let Some(&lead) = bytes.first() else {
        return (0, None);
    };
    if lead < 0x80 {
        return (1, Some(char::from(lead)));
    }

    let (len, initial) = match lead {
        0xC2..=0xDF => (2, u32::from(lead & 0x1F)),
        0xE0..=0xEF => (3, u32::from(lead & 0x0F)),
        0xF0..=0xF4 => (4, u32::from(lead & 0x07)),
        _ => return (1, None),
    };
    if bytes.len() < len {
        return (1, None);
    }

    let mut code_point = initial;
    for &byte in &bytes[1..len] {
        if byte & 0xC0 != 0x80 {
            return (1, None);
        }
        code_point = (code_point << 6) | u32::from(byte & 0x3F);
    }

    let minimum = match len {
        2 => 0x80,
        3 => 0x800,
        _ => 0x10000,
    };
    if code_point < minimum {
        return (1, None);
    }
    match char::from_u32(code_point) {
        Some(c) => (len as u32, Some(c)),
        None => (1, None),
    }
}

#[inline]
fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> Decoded {
    let units = bytes
        .chunks_exact(2)
        .take(2)
        .map(|pair| unit([pair[0], pair[1]]));
    match char::decode_utf16(units).next() {
        None => (0, None),
        Some(Ok(c)) => (c.len_utf16() as u32 * 2, Some(c)),
        Some(Err(_)) => (2, None),
    }
}
