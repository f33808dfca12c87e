use encoding_rs::{UTF_16LE, UTF_8, WINDOWS_1252};
use serde::Deserialize;

/// How to turn captured bytes (sigrok stdout, DUT console) into text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum TextEncoding {
    #[default]
    Auto,
    Utf8,
    Utf16,
    Ascii,
    Latin1,
}

impl std::str::FromStr for TextEncoding {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "UTF-8" | "UTF8" => Self::Utf8,
            "UTF-16" | "UTF16" => Self::Utf16,
            "ASCII" => Self::Ascii,
            "LATIN-1" | "LATIN1" | "WINDOWS-1252" => Self::Latin1,
            _ => Self::Auto,
        })
    }
}

impl From<String> for TextEncoding {
    fn from(s: String) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl TextEncoding {
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Self::Auto => detect_and_decode(bytes),
            Self::Utf8 => UTF_8.decode(bytes).0.into_owned(),
            Self::Utf16 => UTF_16LE.decode(bytes).0.into_owned(),
            Self::Ascii => bytes.iter().map(|&b| if b < 128 { b as char } else { '?' }).collect(),
            Self::Latin1 => WINDOWS_1252.decode(bytes).0.into_owned(),
        }
    }
}

// Targets sometimes spew garbage on reset; fall back to a guess rather
// than failing the whole line.
fn detect_and_decode(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    if let Ok(s) = std::str::from_utf8(bytes) {
        return s.to_string();
    }

    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(bytes, true);
    let encoding = detector.guess(None, true);

    encoding.decode(bytes).0.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("utf-8".parse::<TextEncoding>(), Ok(TextEncoding::Utf8));
        assert_eq!("Latin1".parse::<TextEncoding>(), Ok(TextEncoding::Latin1));
        assert_eq!("whatever".parse::<TextEncoding>(), Ok(TextEncoding::Auto));
    }

    #[test]
    fn ascii_masks_high_bytes() {
        assert_eq!(TextEncoding::Ascii.decode(b"ok\xff"), "ok?");
    }

    #[test]
    fn auto_passes_utf8_through() {
        assert_eq!(TextEncoding::Auto.decode("i2c-1: Start\n".as_bytes()), "i2c-1: Start\n");
    }
}
