//! Embedded resolution metadata readers.
//!
//! Only headers are inspected; pixel data is never decoded here.

use std::io::Cursor;

use tiff::decoder::ifd::Value;
use tiff::decoder::Decoder;
use tiff::tags::Tag;

use crate::raster::InputFormat;

const INCH_PER_METRE: f64 = 0.0254;
const CM_PER_INCH: f64 = 2.54;

/// Outcome of reading a file's resolution metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum DpiReading {
    Success(f64),
    /// The file does not declare an absolute resolution.
    MetadataAbsent,
    /// The file declares one but it is malformed or nonsensical.
    MetadataInvalid(String),
}

pub fn read_dpi(bytes: &[u8], format: InputFormat) -> DpiReading {
    match format {
        InputFormat::Png => png_dpi(bytes),
        InputFormat::Jpeg => jfif_dpi(bytes),
        InputFormat::Bmp => bmp_dpi(bytes),
        InputFormat::Tiff => tiff_dpi(bytes),
        InputFormat::Pdf => DpiReading::MetadataAbsent,
    }
}

fn be_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn be_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes.get(at..at + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn positive(dpi: f64, source: &str) -> DpiReading {
    if dpi.is_finite() && dpi > 0.0 {
        DpiReading::Success(dpi)
    } else {
        DpiReading::MetadataInvalid(format!("{} declares a resolution of {}", source, dpi))
    }
}

/// `pHYs` chunk: pixels per unit on each axis plus a unit byte
/// (1 = metre, 0 = aspect ratio only).
fn png_dpi(bytes: &[u8]) -> DpiReading {
    let mut pos = 8;
    loop {
        let (Some(length), Some(kind)) = (be_u32(bytes, pos), bytes.get(pos + 4..pos + 8)) else {
            return DpiReading::MetadataInvalid("truncated PNG chunk header".to_string());
        };
        let data_start = pos + 8;
        let data_end = data_start + length as usize;
        match kind {
            b"pHYs" => {
                let Some(data) = bytes.get(data_start..data_end).filter(|d| d.len() == 9) else {
                    return DpiReading::MetadataInvalid("malformed pHYs chunk".to_string());
                };
                let ppu_x = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                return match data[8] {
                    1 => positive(ppu_x as f64 * INCH_PER_METRE, "pHYs"),
                    0 => DpiReading::MetadataAbsent,
                    unit => DpiReading::MetadataInvalid(format!("unknown pHYs unit {}", unit)),
                };
            }
            // pHYs must precede the image data.
            b"IDAT" | b"IEND" => return DpiReading::MetadataAbsent,
            _ => pos = data_end + 4,
        }
    }
}

/// JFIF APP0 density fields (units: 0 = aspect only, 1 = inch, 2 = cm).
fn jfif_dpi(bytes: &[u8]) -> DpiReading {
    let mut pos = 2;
    while let (Some(&0xFF), Some(&marker)) = (bytes.get(pos), bytes.get(pos + 1)) {
        // Start of scan or frame: metadata segments are over.
        if marker == 0xDA || ((0xC0..=0xCF).contains(&marker) && marker != 0xC4 && marker != 0xCC) {
            break;
        }
        let Some(length) = be_u16(bytes, pos + 2) else {
            return DpiReading::MetadataInvalid("truncated JPEG segment".to_string());
        };
        let data_start = pos + 4;
        let data_end = pos + 2 + length as usize;
        if marker == 0xE0 {
            if let Some(data) = bytes.get(data_start..data_end) {
                if data.len() >= 12 && data.starts_with(b"JFIF\0") {
                    let units = data[7];
                    let density = u16::from_be_bytes([data[8], data[9]]) as f64;
                    return match units {
                        0 => DpiReading::MetadataAbsent,
                        1 => positive(density, "JFIF"),
                        2 => positive(density * CM_PER_INCH, "JFIF"),
                        other => {
                            DpiReading::MetadataInvalid(format!("unknown JFIF density unit {}", other))
                        }
                    };
                }
            }
        }
        pos = data_end;
    }
    DpiReading::MetadataAbsent
}

/// `biXPelsPerMeter` in the BITMAPINFOHEADER.
fn bmp_dpi(bytes: &[u8]) -> DpiReading {
    let Some(header) = bytes.get(14..18) else {
        return DpiReading::MetadataInvalid("truncated BMP header".to_string());
    };
    let header_size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if header_size < 40 {
        // OS/2 core header carries no resolution.
        return DpiReading::MetadataAbsent;
    }
    let Some(field) = bytes.get(38..42) else {
        return DpiReading::MetadataInvalid("truncated BMP info header".to_string());
    };
    let pels_per_metre = i32::from_le_bytes([field[0], field[1], field[2], field[3]]);
    if pels_per_metre == 0 {
        DpiReading::MetadataAbsent
    } else {
        positive(pels_per_metre as f64 * INCH_PER_METRE, "BMP header")
    }
}

fn tiff_value(value: Value) -> Option<f64> {
    match value {
        Value::Rational(num, den) if den != 0 => Some(num as f64 / den as f64),
        Value::Short(v) => Some(v as f64),
        Value::Unsigned(v) => Some(v as f64),
        Value::Float(v) => Some(v as f64),
        Value::Double(v) => Some(v),
        _ => None,
    }
}

/// `XResolution` with `ResolutionUnit` (1 = none, 2 = inch, 3 = cm).
fn tiff_dpi(bytes: &[u8]) -> DpiReading {
    let mut decoder = match Decoder::new(Cursor::new(bytes)) {
        Ok(decoder) => decoder,
        Err(e) => return DpiReading::MetadataInvalid(format!("unreadable TIFF header: {}", e)),
    };
    let resolution = match decoder.find_tag(Tag::XResolution) {
        Ok(Some(value)) => value,
        Ok(None) => return DpiReading::MetadataAbsent,
        Err(e) => return DpiReading::MetadataInvalid(format!("bad XResolution tag: {}", e)),
    };
    let Some(resolution) = tiff_value(resolution) else {
        return DpiReading::MetadataInvalid("XResolution has an unexpected type".to_string());
    };
    let unit = match decoder.find_tag(Tag::ResolutionUnit) {
        Ok(Some(value)) => tiff_value(value).map(|u| u as u16),
        Ok(None) => Some(2),
        Err(_) => None,
    };
    match unit {
        Some(1) => DpiReading::MetadataAbsent,
        Some(2) => positive(resolution, "TIFF"),
        Some(3) => positive(resolution * CM_PER_INCH, "TIFF"),
        _ => DpiReading::MetadataInvalid("unknown TIFF ResolutionUnit".to_string()),
    }
}
