//! Embedded preview extraction for RAW containers.
//!
//! Camera RAW files carry one or more full JPEG renditions next to the sensor
//! data. Decoding those is orders of magnitude cheaper than demosaicing, and
//! they already have the camera's tone curve applied, so previews are built
//! from them.
//!
//! Supported layouts:
//! - **TIFF-based** (CR2, NEF, ARW, DNG, PEF, SRW, ORF, RW2): walk the IFD
//!   chain and any SubIFDs, collecting
//!   - `JPEGInterchangeFormat` / `JPEGInterchangeFormatLength` (0x0201/0x0202),
//!   - single-strip JPEG images (Compression 6 or 7 with StripOffsets /
//!     StripByteCounts),
//!   - Panasonic `JpgFromRaw` (0x002E).
//! - **Fujifilm RAF**: fixed header holding the JPEG offset and length.
//! - **Anything else** (CR3, unknown): scan for JPEG SOI markers.
//!
//! [`preview_candidates`] returns every plausible JPEG stream, largest first.
//! The caller decodes them in order and keeps the first one that works.

use std::collections::HashSet;

const JPEG_SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];

const TAG_JPG_FROM_RAW: u16 = 0x002E;
const TAG_COMPRESSION: u16 = 0x0103;
const TAG_STRIP_OFFSETS: u16 = 0x0111;
const TAG_STRIP_BYTE_COUNTS: u16 = 0x0117;
const TAG_SUB_IFDS: u16 = 0x014A;
const TAG_JPEG_OFFSET: u16 = 0x0201;
const TAG_JPEG_LENGTH: u16 = 0x0202;
const TAG_EXIF_IFD: u16 = 0x8769;

/// Upper bound on IFDs visited per file. Guards against offset loops in
/// corrupt files.
const MAX_IFDS: usize = 64;

/// Smallest byte run worth treating as a preview. Rejects tiny EXIF
/// thumbnails in the SOI scan.
const MIN_SCAN_PREVIEW: usize = 1024;

const RAF_MAGIC: &[u8] = b"FUJIFILMCCD-RAW";

/// Return the embedded JPEG streams found in `data`, largest first.
///
/// Structured candidates (from TIFF tags or the RAF header) come before
/// marker-scan hits. Every returned slice starts with a JPEG SOI marker.
pub fn preview_candidates(data: &[u8]) -> Vec<&[u8]> {
    let mut structured: Vec<&[u8]> = if data.starts_with(RAF_MAGIC) {
        raf_preview(data).into_iter().collect()
    } else {
        TiffReader::new(data)
            .map(|reader| reader.jpeg_streams())
            .unwrap_or_default()
    };
    structured.retain(|s| s.starts_with(&JPEG_SOI));
    structured.sort_by_key(|s| std::cmp::Reverse(s.len()));
    structured.dedup_by_key(|s| s.as_ptr());

    let mut scanned = scan_for_soi(data);
    scanned.retain(|s| !structured.iter().any(|c| c.as_ptr() == s.as_ptr()));

    structured.extend(scanned);
    structured
}

/// Fujifilm RAF: big-endian JPEG offset at 84 and length at 88.
fn raf_preview(data: &[u8]) -> Option<&[u8]> {
    let offset = be_u32(data, 84)? as usize;
    let length = be_u32(data, 88)? as usize;
    data.get(offset..offset.checked_add(length)?)
}

fn be_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Find SOI markers and return the bytes from each to the end of the file
/// (decoders stop at EOI). Sorted by the distance to the next SOI, so the
/// longest uninterrupted stream comes first.
fn scan_for_soi(data: &[u8]) -> Vec<&[u8]> {
    let starts: Vec<usize> = data
        .windows(JPEG_SOI.len())
        .enumerate()
        .filter(|(_, w)| w.starts_with(&JPEG_SOI))
        .map(|(i, _)| i)
        .collect();

    let mut runs: Vec<(usize, usize)> = starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let next = starts.get(i + 1).copied().unwrap_or(data.len());
            (start, next - start)
        })
        .filter(|&(_, run)| run >= MIN_SCAN_PREVIEW)
        .collect();
    runs.sort_by_key(|&(_, run)| std::cmp::Reverse(run));
    runs.into_iter().map(|(start, _)| &data[start..]).collect()
}

// ---------------------------------------------------------------------------
// TIFF IFD walking
// ---------------------------------------------------------------------------

/// TIFF type sizes: count is number of values, not bytes.
/// Total bytes = count * type_size.
fn type_size(typ: u16) -> usize {
    match typ {
        1 | 2 | 6 | 7 => 1,   // BYTE, ASCII, SBYTE, UNDEFINED
        3 | 8 => 2,           // SHORT, SSHORT
        4 | 9 | 11 | 13 => 4, // LONG, SLONG, FLOAT, IFD
        5 | 10 | 12 => 8,     // RATIONAL, SRATIONAL, DOUBLE
        _ => 1,
    }
}

struct IfdEntry {
    tag: u16,
    typ: u16,
    count: usize,
    /// Offset of the 4-byte value/offset field inside the entry.
    field: usize,
}

struct TiffReader<'a> {
    data: &'a [u8],
    big_endian: bool,
    first_ifd: usize,
}

impl<'a> TiffReader<'a> {
    /// Accepts classic TIFF (42) plus the vendor magics used by Olympus
    /// (`ORF`: 0x4F52, 0x5352) and Panasonic (`RW2`: 0x55).
    fn new(data: &'a [u8]) -> Option<Self> {
        let big_endian = match data.get(0..2)? {
            b"MM" => true,
            b"II" => false,
            _ => return None,
        };
        let mut reader = Self {
            data,
            big_endian,
            first_ifd: 0,
        };
        match reader.u16(2)? {
            42 | 0x4F52 | 0x5352 | 0x55 => {}
            _ => return None,
        }
        reader.first_ifd = reader.u32(4)? as usize;
        Some(reader)
    }

    fn u16(&self, offset: usize) -> Option<u16> {
        let b = self.data.get(offset..offset + 2)?;
        Some(if self.big_endian {
            u16::from_be_bytes([b[0], b[1]])
        } else {
            u16::from_le_bytes([b[0], b[1]])
        })
    }

    fn u32(&self, offset: usize) -> Option<u32> {
        let b = self.data.get(offset..offset + 4)?;
        Some(if self.big_endian {
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        } else {
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        })
    }

    fn entries(&self, ifd: usize) -> Option<(Vec<IfdEntry>, usize)> {
        let count = self.u16(ifd)? as usize;
        let start = ifd + 2;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = start + i * 12;
            entries.push(IfdEntry {
                tag: self.u16(at)?,
                typ: self.u16(at + 2)?,
                count: self.u32(at + 4)? as usize,
                field: at + 8,
            });
        }
        let next = self.u32(start + count * 12).unwrap_or(0) as usize;
        Some((entries, next))
    }

    /// First value of a SHORT or LONG entry.
    fn scalar(&self, entry: &IfdEntry) -> Option<usize> {
        match entry.typ {
            3 => self.u16(entry.field).map(usize::from),
            _ => self.u32(entry.field).map(|v| v as usize),
        }
    }

    /// All values of a SHORT/LONG/IFD entry, inline or out-of-line.
    fn values(&self, entry: &IfdEntry) -> Vec<usize> {
        let size = type_size(entry.typ);
        let inline = entry.count * size <= 4;
        let base = if inline {
            entry.field
        } else {
            match self.u32(entry.field) {
                Some(offset) => offset as usize,
                None => return Vec::new(),
            }
        };
        (0..entry.count)
            .map_while(|i| match size {
                2 => self.u16(base + i * 2).map(usize::from),
                _ => self.u32(base + i * 4).map(|v| v as usize),
            })
            .collect()
    }

    fn slice(&self, offset: usize, length: usize) -> Option<&'a [u8]> {
        if length == 0 {
            return None;
        }
        self.data.get(offset..offset.checked_add(length)?)
    }

    /// Walk the IFD chain and every SubIFD / EXIF IFD it references.
    fn jpeg_streams(&self) -> Vec<&'a [u8]> {
        let mut found = Vec::new();
        let mut queue = vec![self.first_ifd];
        let mut visited = HashSet::new();

        while let Some(ifd) = queue.pop() {
            if ifd == 0 || visited.len() >= MAX_IFDS || !visited.insert(ifd) {
                continue;
            }
            let Some((entries, next)) = self.entries(ifd) else {
                continue;
            };
            queue.push(next);

            let find = |tag: u16| entries.iter().find(|e| e.tag == tag);
            let scalar = |tag: u16| find(tag).and_then(|e| self.scalar(e));

            if let Some(stream) = scalar(TAG_JPEG_OFFSET)
                .zip(scalar(TAG_JPEG_LENGTH))
                .and_then(|(offset, length)| self.slice(offset, length))
            {
                found.push(stream);
            }

            let jpeg_compressed = scalar(TAG_COMPRESSION).is_some_and(|c| c == 6 || c == 7);
            let single_strip = find(TAG_STRIP_OFFSETS).is_some_and(|e| e.count == 1);
            if jpeg_compressed && single_strip {
                if let Some(stream) = scalar(TAG_STRIP_OFFSETS)
                    .zip(scalar(TAG_STRIP_BYTE_COUNTS))
                    .and_then(|(offset, length)| self.slice(offset, length))
                {
                    found.push(stream);
                }
            }

            if let Some(stream) = find(TAG_JPG_FROM_RAW).and_then(|e| {
                let offset = self.u32(e.field)? as usize;
                self.slice(offset, e.count * type_size(e.typ))
            }) {
                found.push(stream);
            }

            for entry in entries.iter().filter(|e| e.tag == TAG_SUB_IFDS || e.tag == TAG_EXIF_IFD) {
                queue.extend(self.values(entry));
            }
        }

        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal JPEG-looking payload: SOI, filler, EOI.
    fn fake_jpeg(len: usize) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
        bytes.resize(len - 2, 0x11);
        bytes.extend_from_slice(&[0xFF, 0xD9]);
        bytes
    }

    /// Little-endian TIFF with one IFD containing the given (tag, type, count, value) entries.
    fn tiff_le(entries: &[(u16, u16, u32, u32)], payload_at: usize, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"II");
        data.extend_from_slice(&42u16.to_le_bytes());
        data.extend_from_slice(&8u32.to_le_bytes());
        data.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        for &(tag, typ, count, value) in entries {
            data.extend_from_slice(&tag.to_le_bytes());
            data.extend_from_slice(&typ.to_le_bytes());
            data.extend_from_slice(&count.to_le_bytes());
            data.extend_from_slice(&value.to_le_bytes());
        }
        data.extend_from_slice(&0u32.to_le_bytes());
        data.resize(payload_at, 0);
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn finds_jpeg_interchange_format() {
        let jpeg = fake_jpeg(2048);
        let data = tiff_le(
            &[(TAG_JPEG_OFFSET, 4, 1, 256), (TAG_JPEG_LENGTH, 4, 1, 2048)],
            256,
            &jpeg,
        );
        let candidates = preview_candidates(&data);
        assert_eq!(candidates[0], jpeg.as_slice());
    }

    #[test]
    fn finds_single_strip_jpeg() {
        let jpeg = fake_jpeg(4096);
        let data = tiff_le(
            &[
                (TAG_COMPRESSION, 3, 1, 6),
                (TAG_STRIP_OFFSETS, 4, 1, 512),
                (TAG_STRIP_BYTE_COUNTS, 4, 1, 4096),
            ],
            512,
            &jpeg,
        );
        let candidates = preview_candidates(&data);
        assert_eq!(candidates[0].len(), 4096);
    }

    #[test]
    fn uncompressed_strip_is_not_a_candidate() {
        let data = tiff_le(
            &[
                (TAG_COMPRESSION, 3, 1, 1),
                (TAG_STRIP_OFFSETS, 4, 1, 512),
                (TAG_STRIP_BYTE_COUNTS, 4, 1, 64),
            ],
            512,
            &[0u8; 64],
        );
        assert!(preview_candidates(&data).is_empty());
    }

    #[test]
    fn follows_sub_ifd() {
        // IFD0 at 8 points at a SubIFD at 64, which holds the preview.
        let jpeg = fake_jpeg(3000);
        let mut data = tiff_le(&[(TAG_SUB_IFDS, 4, 1, 64)], 64, &[]);
        data.extend_from_slice(&2u16.to_le_bytes());
        for (tag, value) in [(TAG_JPEG_OFFSET, 128u32), (TAG_JPEG_LENGTH, 3000)] {
            data.extend_from_slice(&tag.to_le_bytes());
            data.extend_from_slice(&4u16.to_le_bytes());
            data.extend_from_slice(&1u32.to_le_bytes());
            data.extend_from_slice(&value.to_le_bytes());
        }
        data.extend_from_slice(&0u32.to_le_bytes());
        data.resize(128, 0);
        data.extend_from_slice(&jpeg);

        let candidates = preview_candidates(&data);
        assert_eq!(candidates[0].len(), 3000);
    }

    #[test]
    fn largest_structured_candidate_first() {
        let small = fake_jpeg(1500);
        let large = fake_jpeg(5000);
        let mut payload = small.clone();
        payload.extend_from_slice(&large);
        let data = tiff_le(
            &[
                (TAG_JPEG_OFFSET, 4, 1, 256),
                (TAG_JPEG_LENGTH, 4, 1, 1500),
                (TAG_COMPRESSION, 3, 1, 7),
                (TAG_STRIP_OFFSETS, 4, 1, 256 + 1500),
                (TAG_STRIP_BYTE_COUNTS, 4, 1, 5000),
            ],
            256,
            &payload,
        );
        let candidates = preview_candidates(&data);
        assert_eq!(candidates[0].len(), 5000);
        assert_eq!(candidates[1].len(), 1500);
    }

    #[test]
    fn out_of_bounds_offsets_are_ignored() {
        let data = tiff_le(
            &[(TAG_JPEG_OFFSET, 4, 1, 10_000), (TAG_JPEG_LENGTH, 4, 1, 500)],
            64,
            &[],
        );
        assert!(preview_candidates(&data).is_empty());
    }

    #[test]
    fn ifd_loop_terminates() {
        // IFD0's next-IFD pointer points back at itself.
        let mut data = tiff_le(&[], 64, &[]);
        data[10..14].copy_from_slice(&8u32.to_le_bytes());
        assert!(preview_candidates(&data).is_empty());
    }

    #[test]
    fn raf_header_offsets() {
        let jpeg = fake_jpeg(2000);
        let mut data = RAF_MAGIC.to_vec();
        data.resize(84, 0);
        data.extend_from_slice(&200u32.to_be_bytes());
        data.extend_from_slice(&2000u32.to_be_bytes());
        data.resize(200, 0);
        data.extend_from_slice(&jpeg);
        let candidates = preview_candidates(&data);
        assert_eq!(candidates[0], jpeg.as_slice());
    }

    #[test]
    fn unknown_container_falls_back_to_marker_scan() {
        let jpeg = fake_jpeg(4000);
        let mut data = b"ftypcrx ".to_vec();
        data.resize(100, 0);
        data.extend_from_slice(&jpeg);
        let candidates = preview_candidates(&data);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].starts_with(&JPEG_SOI));
    }

    #[test]
    fn no_candidates_in_garbage() {
        assert!(preview_candidates(b"not a raw file").is_empty());
        assert!(preview_candidates(&[]).is_empty());
    }
}
