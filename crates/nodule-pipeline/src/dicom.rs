//! Minimal DICOM Part-10 reader for single-frame grayscale slices.
//!
//! Reads just enough of the stream to recover the pixel matrix and the
//! rescale slope/intercept pair. Supports native (uncompressed) pixel
//! data in implicit VR little endian, explicit VR little endian and
//! explicit VR big endian. Streams without the 128-byte preamble are
//! accepted when they start with a plausible group 0002 or 0008 element.
//!
//! [`read`] returns `Ok(None)` when the bytes are not DICOM at all, so the
//! caller can fall back to raster decoding. Errors are reserved for
//! streams that look like DICOM but cannot be read.

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";
const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;
const MAX_NESTING: usize = 32;

/// Value representations whose explicit-VR header carries a 32-bit
/// length after two reserved bytes.
const LONG_VRS: [&[u8; 2]; 13] = [
    b"OB", b"OD", b"OF", b"OL", b"OV", b"OW", b"SQ", b"SV", b"UC", b"UN", b"UR", b"UT", b"UV",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tag(u16, u16);

impl Tag {
    const TRANSFER_SYNTAX: Self = Self(0x0002, 0x0010);
    const SAMPLES_PER_PIXEL: Self = Self(0x0028, 0x0002);
    const ROWS: Self = Self(0x0028, 0x0010);
    const COLUMNS: Self = Self(0x0028, 0x0011);
    const BITS_ALLOCATED: Self = Self(0x0028, 0x0100);
    const BITS_STORED: Self = Self(0x0028, 0x0101);
    const PIXEL_REPRESENTATION: Self = Self(0x0028, 0x0103);
    const RESCALE_INTERCEPT: Self = Self(0x0028, 0x1052);
    const RESCALE_SLOPE: Self = Self(0x0028, 0x1053);
    const PIXEL_DATA: Self = Self(0x7FE0, 0x0010);
    const ITEM: Self = Self(0xFFFE, 0xE000);
    const ITEM_DELIMITATION: Self = Self(0xFFFE, 0xE00D);
    const SEQUENCE_DELIMITATION: Self = Self(0xFFFE, 0xE0DD);
}

/// Errors for streams recognized as DICOM that cannot be read.
#[derive(Debug, thiserror::Error)]
pub enum DicomError {
    #[error("stream truncated at byte {0}")]
    Truncated(usize),

    #[error("unsupported transfer syntax {0}")]
    UnsupportedSyntax(String),

    #[error("compressed (encapsulated) pixel data is not supported")]
    Encapsulated,

    #[error("missing required element {0}")]
    Missing(&'static str),

    #[error("unsupported pixel layout: {0}")]
    PixelLayout(String),

    #[error("malformed element ({group:04X},{element:04X}): {reason}")]
    Malformed {
        group: u16,
        element: u16,
        reason: String,
    },
}

impl DicomError {
    fn malformed(tag: Tag, reason: impl Into<String>) -> Self {
        Self::Malformed {
            group: tag.0,
            element: tag.1,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Syntax {
    ImplicitLittle,
    ExplicitLittle,
    ExplicitBig,
}

impl Syntax {
    fn from_uid(uid: &str) -> Result<Self, DicomError> {
        match uid {
            "1.2.840.10008.1.2" => Ok(Self::ImplicitLittle),
            "1.2.840.10008.1.2.2" => Ok(Self::ExplicitBig),
            // Deflate compresses the whole dataset, not just pixel data.
            "1.2.840.10008.1.2.1.99" => Err(DicomError::UnsupportedSyntax(uid.to_string())),
            // Explicit VR little endian, and every encapsulated syntax,
            // whose pixel data is rejected later.
            _ => Ok(Self::ExplicitLittle),
        }
    }

    const fn explicit(self) -> bool {
        !matches!(self, Self::ImplicitLittle)
    }

    const fn big_endian(self) -> bool {
        matches!(self, Self::ExplicitBig)
    }
}

/// Pixel matrix and rescale tags of one DICOM slice.
#[derive(Debug, Clone, PartialEq)]
pub struct DicomSlice {
    pub rows: u32,
    pub columns: u32,
    /// Stored values, row-major, sign-extended per `PixelRepresentation`.
    pub pixels: Vec<f32>,
    pub rescale_slope: Option<f64>,
    pub rescale_intercept: Option<f64>,
}

/// Read a DICOM slice.
///
/// Returns `Ok(None)` if `bytes` carry neither the `DICM` magic nor a
/// plausible leading data element.
///
/// # Errors
///
/// Returns a [`DicomError`] if the stream is DICOM but truncated, uses
/// an unsupported transfer syntax, carries compressed pixel data, or
/// lacks the image pixel module.
pub fn read(bytes: &[u8]) -> Result<Option<DicomSlice>, DicomError> {
    let Some((start, has_meta)) = locate_dataset(bytes) else {
        return Ok(None);
    };

    let mut cursor = Cursor::new(bytes, start);
    let syntax = if has_meta {
        read_meta(&mut cursor)?
    } else {
        guess_syntax(bytes, start)
    };

    let mut attributes = Attributes::default();
    read_dataset(&mut cursor, syntax, &mut attributes)?;
    attributes.into_slice(syntax).map(Some)
}

/// Find where the first data element starts and whether a file meta
/// group precedes the dataset.
fn locate_dataset(bytes: &[u8]) -> Option<(usize, bool)> {
    if bytes.len() >= PREAMBLE_LEN + MAGIC.len() && &bytes[PREAMBLE_LEN..PREAMBLE_LEN + 4] == MAGIC
    {
        return Some((PREAMBLE_LEN + MAGIC.len(), true));
    }
    if bytes.len() < 8 {
        return None;
    }
    let group = u16::from_le_bytes([bytes[0], bytes[1]]);
    if group != 0x0002 && group != 0x0008 {
        return None;
    }
    let explicit_vr = bytes[4].is_ascii_uppercase() && bytes[5].is_ascii_uppercase();
    let implicit_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let plausible = explicit_vr || usize::try_from(implicit_len).is_ok_and(|n| n <= bytes.len() - 8);
    plausible.then_some((0, group == 0x0002))
}

fn guess_syntax(bytes: &[u8], pos: usize) -> Syntax {
    match bytes.get(pos + 4..pos + 6) {
        Some([a, b]) if a.is_ascii_uppercase() && b.is_ascii_uppercase() => {
            Syntax::ExplicitLittle
        }
        _ => Syntax::ImplicitLittle,
    }
}

/// Read the group 0002 file meta elements (always explicit VR little
/// endian) and return the dataset's transfer syntax.
fn read_meta(cursor: &mut Cursor<'_>) -> Result<Syntax, DicomError> {
    let mut uid = None;
    while cursor.peek_group(false) == Some(0x0002) {
        let header = read_header(cursor, Syntax::ExplicitLittle)?;
        if header.length == UNDEFINED_LENGTH {
            return Err(DicomError::malformed(header.tag, "undefined length in file meta"));
        }
        let value = cursor.take(header.length as usize)?;
        if header.tag == Tag::TRANSFER_SYNTAX {
            uid = Some(text(value).to_string());
        }
    }
    match uid {
        Some(uid) => Syntax::from_uid(&uid),
        None => Ok(guess_syntax(cursor.bytes, cursor.pos)),
    }
}

fn read_dataset<'a>(
    cursor: &mut Cursor<'a>,
    syntax: Syntax,
    attributes: &mut Attributes<'a>,
) -> Result<(), DicomError> {
    // Anything shorter than an element header is trailing padding.
    while cursor.remaining() >= 8 {
        let header = read_header(cursor, syntax)?;
        if header.tag == Tag::PIXEL_DATA {
            if header.length == UNDEFINED_LENGTH {
                return Err(DicomError::Encapsulated);
            }
            attributes.pixel_data = Some(cursor.take(header.length as usize)?);
            return Ok(());
        }
        if header.length == UNDEFINED_LENGTH {
            skip_sequence(cursor, syntax, 0)?;
            continue;
        }
        let value = cursor.take(header.length as usize)?;
        attributes.record(header.tag, value, syntax.big_endian())?;
    }
    Ok(())
}

fn skip_sequence(cursor: &mut Cursor<'_>, syntax: Syntax, depth: usize) -> Result<(), DicomError> {
    if depth > MAX_NESTING {
        return Err(DicomError::malformed(Tag::ITEM, "sequences nested too deeply"));
    }
    loop {
        let header = read_header(cursor, syntax)?;
        match header.tag {
            Tag::SEQUENCE_DELIMITATION => return Ok(()),
            Tag::ITEM if header.length == UNDEFINED_LENGTH => {
                skip_item(cursor, syntax, depth + 1)?;
            }
            Tag::ITEM => {
                cursor.take(header.length as usize)?;
            }
            other => return Err(DicomError::malformed(other, "expected sequence item")),
        }
    }
}

fn skip_item(cursor: &mut Cursor<'_>, syntax: Syntax, depth: usize) -> Result<(), DicomError> {
    loop {
        let header = read_header(cursor, syntax)?;
        if header.tag == Tag::ITEM_DELIMITATION {
            return Ok(());
        }
        if header.length == UNDEFINED_LENGTH {
            skip_sequence(cursor, syntax, depth + 1)?;
        } else {
            cursor.take(header.length as usize)?;
        }
    }
}

struct Header {
    tag: Tag,
    length: u32,
}

fn read_header(cursor: &mut Cursor<'_>, syntax: Syntax) -> Result<Header, DicomError> {
    let big = syntax.big_endian();
    let tag = Tag(cursor.u16(big)?, cursor.u16(big)?);

    // Item and delimitation tags never carry a VR.
    if tag.0 == 0xFFFE || !syntax.explicit() {
        let length = cursor.u32(big)?;
        return Ok(Header { tag, length });
    }

    let vr = cursor.take(2)?;
    let length = if LONG_VRS.iter().any(|long| long.as_slice() == vr) {
        cursor.take(2)?;
        cursor.u32(big)?
    } else {
        u32::from(cursor.u16(big)?)
    };
    Ok(Header { tag, length })
}

/// Image pixel module attributes collected while walking the dataset.
#[derive(Default)]
struct Attributes<'a> {
    rows: Option<u16>,
    columns: Option<u16>,
    samples_per_pixel: Option<u16>,
    bits_allocated: Option<u16>,
    bits_stored: Option<u16>,
    pixel_representation: Option<u16>,
    rescale_slope: Option<f64>,
    rescale_intercept: Option<f64>,
    pixel_data: Option<&'a [u8]>,
}

impl<'a> Attributes<'a> {
    fn record(&mut self, tag: Tag, value: &'a [u8], big: bool) -> Result<(), DicomError> {
        let slot = match tag {
            Tag::ROWS => &mut self.rows,
            Tag::COLUMNS => &mut self.columns,
            Tag::SAMPLES_PER_PIXEL => &mut self.samples_per_pixel,
            Tag::BITS_ALLOCATED => &mut self.bits_allocated,
            Tag::BITS_STORED => &mut self.bits_stored,
            Tag::PIXEL_REPRESENTATION => &mut self.pixel_representation,
            Tag::RESCALE_SLOPE => {
                self.rescale_slope = decimal(tag, value)?;
                return Ok(());
            }
            Tag::RESCALE_INTERCEPT => {
                self.rescale_intercept = decimal(tag, value)?;
                return Ok(());
            }
            _ => return Ok(()),
        };
        let bytes: [u8; 2] = value
            .get(..2)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| DicomError::malformed(tag, "US value shorter than 2 bytes"))?;
        *slot = Some(if big {
            u16::from_be_bytes(bytes)
        } else {
            u16::from_le_bytes(bytes)
        });
        Ok(())
    }

    fn into_slice(self, syntax: Syntax) -> Result<DicomSlice, DicomError> {
        let rows = self.rows.ok_or(DicomError::Missing("Rows"))?;
        let columns = self.columns.ok_or(DicomError::Missing("Columns"))?;
        let data = self.pixel_data.ok_or(DicomError::Missing("PixelData"))?;
        let bits = self
            .bits_allocated
            .ok_or(DicomError::Missing("BitsAllocated"))?;

        let samples = self.samples_per_pixel.unwrap_or(1);
        if samples != 1 {
            return Err(DicomError::PixelLayout(format!(
                "{samples} samples per pixel, expected 1"
            )));
        }
        if rows == 0 || columns == 0 {
            return Err(DicomError::PixelLayout(format!("{columns}x{rows} image")));
        }
        let bytes_per_sample = match bits {
            8 => 1,
            16 => 2,
            other => {
                return Err(DicomError::PixelLayout(format!(
                    "{other} bits allocated, expected 8 or 16"
                )));
            }
        };

        let count = usize::from(rows) * usize::from(columns);
        let needed = count * bytes_per_sample;
        if data.len() < needed {
            return Err(DicomError::PixelLayout(format!(
                "pixel data holds {} bytes, {needed} needed",
                data.len()
            )));
        }

        let stored = self.bits_stored.unwrap_or(bits).clamp(1, bits);
        let signed = self.pixel_representation == Some(1);
        let big = syntax.big_endian();
        let pixels = data[..needed]
            .chunks_exact(bytes_per_sample)
            .map(|chunk| {
                let raw = match *chunk {
                    [b] => u16::from(b),
                    [a, b] if big => u16::from_be_bytes([a, b]),
                    [a, b] => u16::from_le_bytes([a, b]),
                    _ => 0,
                };
                sample_value(raw, stored, signed)
            })
            .collect();

        Ok(DicomSlice {
            rows: u32::from(rows),
            columns: u32::from(columns),
            pixels,
            rescale_slope: self.rescale_slope,
            rescale_intercept: self.rescale_intercept,
        })
    }
}

/// Mask a raw sample to `stored` bits and sign-extend when signed.
#[allow(clippy::cast_precision_loss)]
fn sample_value(raw: u16, stored: u16, signed: bool) -> f32 {
    let mask = (1_u32 << stored) - 1;
    let value = u32::from(raw) & mask;
    let sign_bit = 1_u32 << (stored - 1);
    if signed && value & sign_bit != 0 {
        (i64::from(value) - (1_i64 << stored)) as f32
    } else {
        value as f32
    }
}

/// First value of a decimal string (DS) element.
fn decimal(tag: Tag, value: &[u8]) -> Result<Option<f64>, DicomError> {
    let s = text(value);
    let first = s.split('\\').next().unwrap_or("").trim();
    if first.is_empty() {
        return Ok(None);
    }
    first
        .parse::<f64>()
        .map(Some)
        .map_err(|e| DicomError::malformed(tag, format!("invalid decimal string {first:?}: {e}")))
}

/// String value with DICOM padding (trailing NUL or space) removed.
fn text(value: &[u8]) -> &str {
    std::str::from_utf8(value)
        .unwrap_or("")
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    const fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DicomError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(DicomError::Truncated(self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self, big: bool) -> Result<u16, DicomError> {
        let b = self.take(2)?;
        let pair = [b[0], b[1]];
        Ok(if big {
            u16::from_be_bytes(pair)
        } else {
            u16::from_le_bytes(pair)
        })
    }

    fn u32(&mut self, big: bool) -> Result<u32, DicomError> {
        let b = self.take(4)?;
        let quad = [b[0], b[1], b[2], b[3]];
        Ok(if big {
            u32::from_be_bytes(quad)
        } else {
            u32::from_le_bytes(quad)
        })
    }

    fn peek_group(&self, big: bool) -> Option<u16> {
        let b = self.bytes.get(self.pos..self.pos + 2)?;
        Some(if big {
            u16::from_be_bytes([b[0], b[1]])
        } else {
            u16::from_le_bytes([b[0], b[1]])
        })
    }
}
