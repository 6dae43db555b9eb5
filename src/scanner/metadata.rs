use chrono::NaiveDateTime;
use exif::{Exif, In, Tag, Value};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Capture time and location for one asset.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureInfo {
    pub captured_at: NaiveDateTime,
    pub gps: Option<GpsPoint>,
    /// False when `captured_at` is the fallback rather than an EXIF timestamp.
    pub from_exif: bool,
}

/// Read EXIF capture time and GPS from in-memory image bytes.
///
/// `DateTimeOriginal` is preferred, then `DateTime`. Anything missing or
/// unreadable falls back to `fallback`, which is normally the store's
/// modification time for the asset.
pub fn extract_capture_info(bytes: &[u8], fallback: NaiveDateTime) -> CaptureInfo {
    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(exif) => exif,
        Err(e) => {
            tracing::debug!(error = %e, "no readable EXIF, using fallback capture time");
            return CaptureInfo {
                captured_at: fallback,
                gps: None,
                from_exif: false,
            };
        }
    };

    let taken = ascii_field(&exif, Tag::DateTimeOriginal)
        .or_else(|| ascii_field(&exif, Tag::DateTime))
        .and_then(|s| parse_exif_datetime(&s));

    CaptureInfo {
        captured_at: taken.unwrap_or(fallback),
        gps: gps_point(&exif),
        from_exif: taken.is_some(),
    }
}

fn ascii_field(exif: &Exif, tag: Tag) -> Option<String> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    match field.value {
        Value::Ascii(ref parts) => parts
            .first()
            .map(|raw| String::from_utf8_lossy(raw).to_string()),
        _ => None,
    }
}

/// Parse `YYYY:MM:DD HH:MM:SS`, tolerating trailing NULs and whitespace.
pub fn parse_exif_datetime(value: &str) -> Option<NaiveDateTime> {
    let cleaned = value.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    NaiveDateTime::parse_from_str(cleaned, "%Y:%m:%d %H:%M:%S").ok()
}

fn gps_point(exif: &Exif) -> Option<GpsPoint> {
    let lat_field = exif.get_field(Tag::GPSLatitude, In::PRIMARY)?;
    let lat_ref = exif.get_field(Tag::GPSLatitudeRef, In::PRIMARY)?;
    let lon_field = exif.get_field(Tag::GPSLongitude, In::PRIMARY)?;
    let lon_ref = exif.get_field(Tag::GPSLongitudeRef, In::PRIMARY)?;

    let (Value::Rational(lat_vals), Value::Rational(lon_vals)) = (&lat_field.value, &lon_field.value)
    else {
        return None;
    };
    if lat_vals.len() < 3 || lon_vals.len() < 3 {
        return None;
    }

    let lat = dms_to_decimal(lat_vals[0].to_f64(), lat_vals[1].to_f64(), lat_vals[2].to_f64());
    let lon = dms_to_decimal(lon_vals[0].to_f64(), lon_vals[1].to_f64(), lon_vals[2].to_f64());

    let south = lat_ref.display_value().to_string().contains('S');
    let west = lon_ref.display_value().to_string().contains('W');

    let point = GpsPoint {
        latitude: if south { -lat } else { lat },
        longitude: if west { -lon } else { lon },
    };

    (point.latitude.is_finite() && point.longitude.is_finite()).then_some(point)
}

fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64) -> f64 {
    degrees + minutes / 60.0 + seconds / 3600.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_parse_exif_datetime() {
        let parsed = parse_exif_datetime("2024:01:15 08:30:05\0").unwrap();
        assert_eq!(
            parsed,
            NaiveDate::from_ymd_opt(2024, 1, 15)
                .unwrap()
                .and_hms_opt(8, 30, 5)
                .unwrap()
        );
        assert!(parse_exif_datetime("0000:00:00 00:00:00").is_none());
        assert!(parse_exif_datetime("yesterday").is_none());
    }

    #[test]
    fn test_bytes_without_exif_use_fallback() {
        let info = extract_capture_info(b"definitely not an image", noon());
        assert_eq!(info.captured_at, noon());
        assert!(info.gps.is_none());
        assert!(!info.from_exif);
    }

    #[test]
    fn test_dms_to_decimal() {
        let value = dms_to_decimal(51.0, 30.0, 36.0);
        assert!((value - 51.51).abs() < 1e-9);
    }
}
