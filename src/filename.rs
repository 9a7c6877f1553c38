use chrono::NaiveDateTime;

const MAX_STEM_CHARS: usize = 100;
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const FALLBACK_STEM: &str = "video";

/// Builds `<sanitized title>_<YYYYMMDD_HHMMSS>.<extension>`.
///
/// Two requests for the same title within one second produce the same name.
pub fn derive(title: &str, extension: &str, now: NaiveDateTime) -> String {
    let stem = sanitize_title(title);
    let stem = if stem.is_empty() { FALLBACK_STEM } else { &stem };
    format!("{stem}_{}.{extension}", now.format(TIMESTAMP_FORMAT))
}

fn sanitize_title(title: &str) -> String {
    let cleaned = title
        .chars()
        .filter(|character| !is_path_illegal(*character))
        .take(MAX_STEM_CHARS)
        .collect::<String>();
    cleaned.trim().to_string()
}

/// `$` is dropped as well since the download engine expands environment
/// variables in its output path.
fn is_path_illegal(character: char) -> bool {
    matches!(
        character,
        '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | '$'
    ) || character.is_control()
}
