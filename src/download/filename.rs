//! Save-name derivation from response headers and the request URL.

use url::Url;

/// Name used when neither the headers nor the URL yield one.
const FALLBACK_NAME: &str = "download";

/// Picks the save name for `url`.
///
/// Preference order: `Content-Disposition` (`filename*=` then `filename=`),
/// the last non-empty URL path segment (percent-decoded), the host, then
/// `download`. The result is always sanitized to a single path segment.
#[must_use]
pub fn suggested_file_name(url: &Url, content_disposition: Option<&str>) -> String {
    content_disposition
        .and_then(parse_content_disposition)
        .map(|name| sanitize_filename(&name))
        .filter(|name| is_usable(name))
        .or_else(|| name_from_url(url))
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

/// Extracts the file name from a `Content-Disposition` value.
///
/// Parameter names match case-insensitively. Handles:
/// - `attachment; filename="report.pdf"`
/// - `attachment; filename=report.pdf`
/// - `attachment; filename*=UTF-8''r%C3%A9sum%C3%A9.pdf` (RFC 5987)
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for param in header.split(';').skip(1) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.eq_ignore_ascii_case("filename*") {
            extended = decode_extended_value(value);
        } else if key.eq_ignore_ascii_case("filename") {
            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            if !unquoted.is_empty() {
                plain = Some(unquoted.to_string());
            }
        }
    }

    extended.or(plain)
}

/// Decodes `charset'language'percent-encoded` values.
fn decode_extended_value(value: &str) -> Option<String> {
    let value = value.trim_matches('"');
    let (_, encoded) = value.split_once("''")?;
    let decoded = urlencoding::decode(encoded).ok()?;
    (!decoded.is_empty()).then(|| decoded.into_owned())
}

fn name_from_url(url: &Url) -> Option<String> {
    let from_path = url
        .path_segments()
        .and_then(|mut segments| segments.rfind(|segment| !segment.is_empty()))
        .map(|segment| {
            urlencoding::decode(segment)
                .map_or_else(|_| segment.to_string(), std::borrow::Cow::into_owned)
        })
        .map(|name| sanitize_filename(&name))
        .filter(|name| is_usable(name));

    from_path.or_else(|| {
        url.host_str()
            .map(sanitize_filename)
            .filter(|name| is_usable(name))
    })
}

/// Replaces characters that are invalid on common file systems with `_`.
pub(crate) fn sanitize_filename(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

fn is_usable(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.trim_matches('_').is_empty()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_parse_content_disposition_quoted() {
        assert_eq!(
            parse_content_disposition(r#"attachment; filename="report.pdf""#),
            Some("report.pdf".to_string())
        );
    }

    #[test]
    fn test_parse_content_disposition_unquoted_with_trailing_param() {
        assert_eq!(
            parse_content_disposition("attachment; filename=report.pdf; size=10"),
            Some("report.pdf".to_string())
        );
    }

    #[test]
    fn test_parse_content_disposition_is_case_insensitive() {
        assert_eq!(
            parse_content_disposition("Attachment; FileName=\"Data.BIN\""),
            Some("Data.BIN".to_string())
        );
    }

    #[test]
    fn test_parse_content_disposition_prefers_extended_form() {
        let header = "attachment; filename=\"fallback.pdf\"; filename*=UTF-8''r%C3%A9sum%C3%A9.pdf";
        assert_eq!(
            parse_content_disposition(header),
            Some("résumé.pdf".to_string())
        );
    }

    #[test]
    fn test_parse_content_disposition_missing_filename() {
        assert_eq!(parse_content_disposition("inline"), None);
        assert_eq!(parse_content_disposition("attachment; filename=\"\""), None);
    }

    #[test]
    fn test_sanitize_filename_replaces_separators() {
        assert_eq!(sanitize_filename("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_filename("tab\there"), "tab_here");
    }

    #[test]
    fn test_suggested_name_from_header() {
        let name = suggested_file_name(
            &url("https://example.com/get?id=1"),
            Some("attachment; filename=\"movie.mkv\""),
        );
        assert_eq!(name, "movie.mkv");
    }

    #[test]
    fn test_suggested_name_header_cannot_traverse() {
        let name = suggested_file_name(
            &url("https://example.com/files/safe.bin"),
            Some("attachment; filename=\"../../etc/passwd\""),
        );
        assert!(!name.contains('/'));
        assert_ne!(name, "..");
    }

    #[test]
    fn test_suggested_name_dot_dot_header_falls_back_to_url() {
        let name = suggested_file_name(
            &url("https://example.com/files/safe.bin"),
            Some("attachment; filename=\"..\""),
        );
        assert_eq!(name, "safe.bin");
    }

    #[test]
    fn test_suggested_name_from_url_segment_is_decoded() {
        let name = suggested_file_name(&url("https://example.com/dir/my%20file.zip"), None);
        assert_eq!(name, "my file.zip");
    }

    #[test]
    fn test_suggested_name_skips_trailing_slash() {
        let name = suggested_file_name(&url("https://example.com/dir/archive/"), None);
        assert_eq!(name, "archive");
    }

    #[test]
    fn test_suggested_name_falls_back_to_host() {
        let name = suggested_file_name(&url("https://example.com/"), None);
        assert_eq!(name, "example.com");
    }
}
