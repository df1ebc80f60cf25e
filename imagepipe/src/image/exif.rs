//! Minimal EXIF reader for embedded JPEG thumbnails.
//!
//! Only the parts needed to locate the IFD1 thumbnail and the IFD0
//! orientation are parsed.

use std::ops::Range;

const SOI: [u8; 2] = [0xFF, 0xD8];
const APP1: u8 = 0xE1;
const SOS: u8 = 0xDA;
const EXIF_HEADER: &[u8] = b"Exif\0\0";

const TAG_ORIENTATION: u16 = 0x0112;
const TAG_THUMBNAIL_OFFSET: u16 = 0x0201;
const TAG_THUMBNAIL_LENGTH: u16 = 0x0202;

const IFD_ENTRY_SIZE: usize = 12;

/// Location of an embedded thumbnail inside a JPEG file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExifThumbnail {
    /// Byte range of the thumbnail JPEG within the file.
    pub range: Range<usize>,
    /// Rotation of the main image, which applies to the thumbnail too.
    pub rotation_angle: u16,
}

#[derive(Clone, Copy)]
enum ByteOrder {
    Little,
    Big,
}

struct Tiff<'a> {
    data: &'a [u8],
    order: ByteOrder,
}

impl<'a> Tiff<'a> {
    fn parse(data: &'a [u8]) -> Option<Self> {
        let order = match data.get(0..2)? {
            b"II" => ByteOrder::Little,
            b"MM" => ByteOrder::Big,
            _ => return None,
        };
        let tiff = Self { data, order };
        (tiff.u16_at(2)? == 42).then_some(tiff)
    }

    fn u16_at(&self, offset: usize) -> Option<u16> {
        let bytes: [u8; 2] = self.data.get(offset..offset + 2)?.try_into().ok()?;
        Some(match self.order {
            ByteOrder::Little => u16::from_le_bytes(bytes),
            ByteOrder::Big => u16::from_be_bytes(bytes),
        })
    }

    fn u32_at(&self, offset: usize) -> Option<u32> {
        let bytes: [u8; 4] = self.data.get(offset..offset + 4)?.try_into().ok()?;
        Some(match self.order {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        })
    }

    fn first_ifd(&self) -> Option<usize> {
        self.u32_at(4).map(|o| o as usize)
    }

    /// Entries of the IFD at `offset`, plus the offset of the next IFD.
    fn ifd(&self, offset: usize) -> Option<(Vec<(u16, usize)>, usize)> {
        let count = self.u16_at(offset)? as usize;
        let entries = (0..count)
            .map(|i| {
                let entry = offset + 2 + i * IFD_ENTRY_SIZE;
                self.u16_at(entry).map(|tag| (tag, entry))
            })
            .collect::<Option<Vec<_>>>()?;
        let next = self.u32_at(offset + 2 + count * IFD_ENTRY_SIZE)? as usize;
        Some((entries, next))
    }

    /// The value of a SHORT or LONG entry stored inline.
    fn value(&self, entry: usize) -> Option<u32> {
        match self.u16_at(entry + 2)? {
            3 => self.u16_at(entry + 8).map(u32::from),
            4 => self.u32_at(entry + 8),
            _ => None,
        }
    }
}

fn orientation_angle(orientation: u32) -> u16 {
    match orientation {
        3 | 4 => 180,
        5 | 6 => 90,
        7 | 8 => 270,
        _ => 0,
    }
}

/// The TIFF block of the first EXIF APP1 segment, with its file offset.
fn find_exif(data: &[u8]) -> Option<(usize, &[u8])> {
    if data.get(0..2)? != SOI {
        return None;
    }
    let mut pos = 2;
    loop {
        if *data.get(pos)? != 0xFF {
            return None;
        }
        let marker = *data.get(pos + 1)?;
        if marker == SOS {
            return None;
        }
        let length = u16::from_be_bytes([*data.get(pos + 2)?, *data.get(pos + 3)?]) as usize;
        let segment = data.get(pos + 4..pos + 2 + length)?;
        if marker == APP1 && segment.starts_with(EXIF_HEADER) {
            let start = pos + 4 + EXIF_HEADER.len();
            return Some((start, &segment[EXIF_HEADER.len()..]));
        }
        pos += 2 + length;
    }
}

/// Locates the thumbnail embedded in a JPEG's EXIF data, if any.
pub fn find_exif_thumbnail(data: &[u8]) -> Option<ExifThumbnail> {
    let (tiff_start, block) = find_exif(data)?;
    let tiff = Tiff::parse(block)?;

    let (ifd0, ifd1_offset) = tiff.ifd(tiff.first_ifd()?)?;
    let rotation_angle = ifd0
        .iter()
        .find(|(tag, _)| *tag == TAG_ORIENTATION)
        .and_then(|(_, entry)| tiff.value(*entry))
        .map_or(0, orientation_angle);

    if ifd1_offset == 0 {
        return None;
    }
    let (ifd1, _) = tiff.ifd(ifd1_offset)?;
    let lookup = |wanted: u16| {
        ifd1.iter()
            .find(|(tag, _)| *tag == wanted)
            .and_then(|(_, entry)| tiff.value(*entry))
            .map(|v| v as usize)
    };
    let offset = lookup(TAG_THUMBNAIL_OFFSET)?;
    let length = lookup(TAG_THUMBNAIL_LENGTH)?;
    if length == 0 || offset.checked_add(length)? > block.len() {
        return None;
    }

    let start = tiff_start + offset;
    Some(ExifThumbnail {
        range: start..start + length,
        rotation_angle,
    })
}
