//! Content-type sniffing for served artifacts.
//!
//! Signature matching over the first 512 bytes, in the spirit of the WHATWG
//! MIME sniffing algorithm. Unknown content is `text/plain` when it has no
//! binary control bytes and `application/octet-stream` otherwise.

const SNIFF_LEN: usize = 512;

const TEXT_UTF8: &str = "text/plain; charset=utf-8";
const OCTET_STREAM: &str = "application/octet-stream";

/// Tags that mark HTML when followed by a space or `>`.
const HTML_TAGS: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

/// Sniff the media type of `data`. Always returns a valid header value.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];

    let trimmed = skip_whitespace(data);
    if HTML_TAGS.iter().any(|tag| is_html_tag(trimmed, tag)) {
        return "text/html; charset=utf-8";
    }
    if trimmed.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }

    if let Some(media_type) = magic_type(data) {
        return media_type;
    }

    if data.iter().any(|&b| is_binary_byte(b)) {
        OCTET_STREAM
    } else {
        TEXT_UTF8
    }
}

fn skip_whitespace(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !matches!(b, b'\t' | b'\n' | b'\x0C' | b'\r' | b' '))
        .unwrap_or(data.len());
    &data[start..]
}

fn is_html_tag(data: &[u8], tag: &[u8]) -> bool {
    if data.len() <= tag.len() || !data[..tag.len()].eq_ignore_ascii_case(tag) {
        return false;
    }
    matches!(data[tag.len()], b' ' | b'>')
}

/// Match well-known file signatures at the start of `data`.
fn magic_type(data: &[u8]) -> Option<&'static str> {
    let media_type = match data {
        // Documents
        [b'%', b'P', b'D', b'F', b'-', ..] => "application/pdf",
        [b'%', b'!', b'P', b'S', b'-', b'A', b'd', b'o', b'b', b'e', b'-', ..] => {
            "application/postscript"
        }
        // Byte order marks
        [0xFE, 0xFF, ..] => "text/plain; charset=utf-16be",
        [0xFF, 0xFE, ..] => "text/plain; charset=utf-16le",
        [0xEF, 0xBB, 0xBF, ..] => TEXT_UTF8,
        // Images
        [0x00, 0x00, 0x01 | 0x02, 0x00, ..] => "image/x-icon",
        [b'B', b'M', ..] => "image/bmp",
        [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => "image/gif",
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        // Fonts
        [b'w', b'O', b'F', b'F', ..] => "font/woff",
        [b'w', b'O', b'F', b'2', ..] => "font/woff2",
        // Audio and video
        [b'O', b'g', b'g', b'S', 0x00, ..] => "application/ogg",
        [b'I', b'D', b'3', ..] => "audio/mpeg",
        [0x1A, 0x45, 0xDF, 0xA3, ..] => "video/webm",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => "audio/wave",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'A', b'V', b'I', b' ', ..] => "video/avi",
        // Archives
        [0x1F, 0x8B, 0x08, ..] => "application/x-gzip",
        [b'P', b'K', 0x03, 0x04, ..] => "application/zip",
        [b'R', b'a', b'r', b'!', 0x1A, 0x07, 0x00, ..]
        | [b'R', b'a', b'r', b'!', 0x1A, 0x07, 0x01, 0x00, ..] => "application/x-rar-compressed",
        // Wasm
        [0x00, b'a', b's', b'm', ..] => "application/wasm",
        [_, _, _, _, b'f', b't', b'y', b'p', _, _, _, _, ..] => "video/mp4",
        _ => return None,
    };
    Some(media_type)
}

fn is_binary_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}
