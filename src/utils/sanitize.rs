//! Object key sanitization shared by both transports

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

/// Split a file name into base name and extension (without the dot)
///
/// Leading-dot names such as `.hidden` have no extension.
pub fn split_extension(filename: &str) -> (&str, Option<&str>) {
    match filename.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < filename.len() => {
            (&filename[..idx], Some(&filename[idx + 1..]))
        }
        _ => (filename, None),
    }
}

/// Transliterate to ASCII and keep only characters legal in an object key
fn clean_base(base: &str) -> String {
    base.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect()
}

/// Produce a legal object name for any source file name
///
/// The base name is decomposed, stripped of combining marks and filtered to
/// `[A-Za-z0-9._-]`. An empty result is replaced by a fresh unique token. The
/// original extension is reattached unchanged.
pub fn sanitize_filename(filename: &str) -> String {
    let (base, extension) = split_extension(filename);

    let mut cleaned = clean_base(base);
    if cleaned.is_empty() {
        cleaned = Uuid::new_v4().simple().to_string();
    }

    match extension {
        Some(ext) => format!("{}.{}", cleaned, ext),
        None => cleaned,
    }
}
