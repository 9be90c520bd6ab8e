use serde_json::Value;

pub type UrlExtractor = fn(&Value) -> Option<String>;

/// Known video response shapes, tried in order. Adding a provider shape means
/// adding an entry here.
pub const VIDEO_URL_EXTRACTORS: &[(&str, UrlExtractor)] = &[
    ("nested_object_url", nested_object_url),
    ("bare_string", bare_string),
    ("top_level_field", top_level_field),
];

const NESTED_VIDEO_KEYS: &[&str] = &["video", "output", "result", "data"];
const TOP_LEVEL_VIDEO_KEYS: &[&str] = &["url", "video_url", "output"];

/// First video URL found in `response`, with the name of the shape that
/// matched. `None` means the response shape is not recognized.
pub fn extract_video_url(response: &Value) -> Option<(&'static str, String)> {
    VIDEO_URL_EXTRACTORS
        .iter()
        .find_map(|(shape, extractor)| extractor(response).map(|url| (*shape, url)))
}

/// Every image URL reachable through `url`, `urls`, `images` and `output`
/// fields, in document order and without duplicates.
pub fn extract_image_urls(response: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_urls(response, &mut out);
    out
}

fn collect_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if looks_like_url(trimmed) && !out.iter().any(|existing| existing == trimmed) {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                collect_urls(row, out);
            }
        }
        Value::Object(obj) => {
            for key in ["url", "urls", "images", "output"] {
                if let Some(child) = obj.get(key) {
                    collect_urls(child, out);
                }
            }
        }
        _ => {}
    }
}

fn nested_object_url(response: &Value) -> Option<String> {
    let obj = response.as_object()?;
    NESTED_VIDEO_KEYS.iter().find_map(|key| {
        obj.get(*key)
            .and_then(Value::as_object)
            .and_then(|inner| inner.get("url"))
            .and_then(url_string)
    })
}

fn bare_string(response: &Value) -> Option<String> {
    url_string(response)
}

fn top_level_field(response: &Value) -> Option<String> {
    let obj = response.as_object()?;
    TOP_LEVEL_VIDEO_KEYS.iter().find_map(|key| match obj.get(*key)? {
        Value::Array(rows) => rows.iter().find_map(url_string),
        other => url_string(other),
    })
}

fn url_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|text| looks_like_url(text))
        .map(str::to_string)
}

fn looks_like_url(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    lowered.starts_with("https://") || lowered.starts_with("http://") || lowered.starts_with("dryrun://")
}
