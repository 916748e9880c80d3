//! Text normalization
//!
//! Produces the canonical representation dedup hashes over: NFKC form,
//! encoding repaired, zero-width and control characters stripped, CJK
//! and Latin runs separated by a single space, trimmed. Deterministic:
//! no IO, clock or randomness.

use unicode_normalization::UnicodeNormalization;

/// Decode raw bytes into text, detecting the encoding
///
/// Order: BOM, `charset=` sniff in the head, strict UTF-8, then a
/// windows-1252 fallback. Returns the text and the encoding label used.
pub fn decode_bytes(raw: &[u8]) -> (String, &'static str) {
    // BOM detection
    if raw.starts_with(&[0xEF, 0xBB, 0xBF]) {
        let (text, _, _) = encoding_rs::UTF_8.decode(raw);
        return (text.into_owned(), "utf-8");
    }
    if raw.starts_with(&[0xFF, 0xFE]) {
        let (text, _, _) = encoding_rs::UTF_16LE.decode(raw);
        return (text.into_owned(), "utf-16le");
    }
    if raw.starts_with(&[0xFE, 0xFF]) {
        let (text, _, _) = encoding_rs::UTF_16BE.decode(raw);
        return (text.into_owned(), "utf-16be");
    }

    // charset= sniff in the first KB (meta tags, XML declarations)
    let head = &raw[..raw.len().min(1024)];
    let head_text = String::from_utf8_lossy(head).to_lowercase();
    if let Some(pos) = head_text.find("charset=") {
        let label: String = head_text[pos + "charset=".len()..]
            .trim_start_matches(['"', '\''])
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        if let Some(encoding) = encoding_rs::Encoding::for_label(label.as_bytes())
            && encoding != encoding_rs::UTF_8
        {
            let (text, _, malformed) = encoding.decode(raw);
            if !malformed {
                return (text.into_owned(), encoding.name());
            }
        }
    }

    // Strict UTF-8, then the usual legacy suspect
    match std::str::from_utf8(raw) {
        Ok(text) => (text.to_string(), "utf-8"),
        Err(_) => {
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(raw);
            (text.into_owned(), "windows-1252")
        }
    }
}

/// Characters that typically betray UTF-8 read as Latin-1
fn mojibake_markers(s: &str) -> usize {
    s.chars().filter(|c| matches!(c, 'Ã' | 'Â' | 'â' | 'Ð' | 'Ñ')).count()
}

/// Repair UTF-8 mis-decoded as Latin-1, including one double-encoding pass
pub fn fix_mojibake(input: &str) -> String {
    let mut current = input.to_string();
    for _ in 0..2 {
        let markers = mojibake_markers(&current);
        if markers == 0 {
            break;
        }
        // Re-encode as Latin-1 bytes and try reading them as UTF-8
        let bytes: Option<Vec<u8>> = current
            .chars()
            .map(|c| {
                let cp = c as u32;
                if cp < 256 { Some(cp as u8) } else { None }
            })
            .collect();
        let Some(bytes) = bytes else {
            break;
        };
        match String::from_utf8(bytes) {
            Ok(decoded) if mojibake_markers(&decoded) < markers => current = decoded,
            _ => break,
        }
    }
    current
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3400..=0x4DBF   // CJK ext A
        | 0x4E00..=0x9FFF // CJK unified
        | 0x3040..=0x309F // hiragana
        | 0x30A0..=0x30FF // katakana
        | 0xAC00..=0xD7AF // hangul
        | 0xF900..=0xFAFF // compatibility ideographs
    )
}

fn is_zero_width(c: char) -> bool {
    matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}')
}

/// Canonical normalization pass
pub fn normalize_text(input: &str) -> String {
    let repaired = fix_mojibake(input);

    // NFKC, newline unification, control stripping
    let mut cleaned = String::with_capacity(repaired.len());
    for c in repaired.replace("\r\n", "\n").replace('\r', "\n").nfkc() {
        if is_zero_width(c) {
            continue;
        }
        if c.is_control() && c != '\n' && c != '\t' {
            continue;
        }
        cleaned.push(c);
    }

    // Single space between adjacent CJK and Latin alphanumeric runs
    let mut spaced = String::with_capacity(cleaned.len());
    let mut prev: Option<char> = None;
    for c in cleaned.chars() {
        if let Some(p) = prev {
            let boundary = (is_cjk(p) && c.is_ascii_alphanumeric()) || (p.is_ascii_alphanumeric() && is_cjk(c));
            if boundary {
                spaced.push(' ');
            }
        }
        spaced.push(c);
        prev = Some(c);
    }

    spaced.trim().to_string()
}
