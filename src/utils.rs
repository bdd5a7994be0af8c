use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static SPACE_TAB_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").unwrap());

/// Collapse all whitespace runs to a single space and trim the ends.
/// Idempotent: `clean_string(clean_string(s)) == clean_string(s)`.
pub fn clean_string(s: &str) -> String {
    WHITESPACE_RUN.replace_all(s, " ").trim().to_string()
}

/// Query parameters that only identify the click, not the resource.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid"];

/// Canonicalize an article URL: trim, then strip tracking parameters
/// (`utm_*`, `fbclid`, `gclid`). Non-parseable input is returned trimmed so
/// that downstream validation can reject it.
pub fn clean_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut parsed) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_ascii_lowercase();
            !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let query = kept
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&query));
    }

    parsed.to_string()
}

/// Normalize extracted article text: collapse runs of spaces/tabs, trim each
/// line, and allow at most two consecutive blank lines.
pub fn normalize_whitespace(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut blank_run = 0usize;

    for line in text.lines() {
        let cleaned = SPACE_TAB_RUN.replace_all(line, " ").trim().to_string();
        if cleaned.is_empty() {
            blank_run += 1;
            if blank_run > 2 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        lines.push(cleaned);
    }

    // Drop leading and trailing blank lines.
    let start = lines.iter().position(|l| !l.is_empty()).unwrap_or(0);
    let end = lines.iter().rposition(|l| !l.is_empty()).map_or(0, |i| i + 1);
    lines[start..end].join("\n")
}

/// Truncate a string for logging purposes.
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let cut = s
            .char_indices()
            .take_while(|(i, _)| *i <= max)
            .last()
            .map_or(0, |(i, _)| i);
        format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_string_collapses_whitespace() {
        assert_eq!(clean_string("  Hello\t\n  world "), "Hello world");
        assert_eq!(clean_string("already clean"), "already clean");
        assert_eq!(clean_string("   "), "");
    }

    #[test]
    fn test_clean_string_idempotent() {
        let once = clean_string("  a \t b\nc  ");
        assert_eq!(clean_string(&once), once);
    }

    #[test]
    fn test_clean_url_strips_tracking_params() {
        assert_eq!(
            clean_url("https://example.com/a?utm_source=x&utm_medium=y"),
            "https://example.com/a"
        );
        assert_eq!(
            clean_url("https://example.com/a?id=7&fbclid=abc&gclid=def"),
            "https://example.com/a?id=7"
        );
    }

    #[test]
    fn test_clean_url_keeps_real_params() {
        assert_eq!(
            clean_url("https://example.com/story?page=2"),
            "https://example.com/story?page=2"
        );
    }

    #[test]
    fn test_clean_url_idempotent() {
        let urls = [
            "https://example.com/a?utm_source=x",
            "https://example.com/a?id=7&UTM_CAMPAIGN=z",
            "not a url at all",
            "https://example.com",
        ];
        for u in urls {
            let once = clean_url(u);
            assert_eq!(clean_url(&once), once, "not idempotent for {u}");
        }
    }

    #[test]
    fn test_clean_url_invalid_passthrough() {
        assert_eq!(clean_url("  nonsense  "), "nonsense");
    }

    #[test]
    fn test_normalize_whitespace_collapses_runs() {
        let input = "A  line\twith\t\truns\n   indented   \n\n\n\n\nnext";
        assert_eq!(
            normalize_whitespace(input),
            "A line with runs\nindented\n\n\nnext"
        );
    }

    #[test]
    fn test_normalize_whitespace_trims_edges() {
        assert_eq!(normalize_whitespace("\n\n\nbody\n\n\n"), "body");
    }

    #[test]
    fn test_normalize_whitespace_idempotent() {
        let input = "one\n\n\n\n\ntwo   three\n\tfour";
        let once = normalize_whitespace(input);
        assert_eq!(normalize_whitespace(&once), once);
    }

    #[test]
    fn test_truncate_for_log_short_string() {
        assert_eq!(truncate_for_log("Hello, world!", 100), "Hello, world!");
    }

    #[test]
    fn test_truncate_for_log_long_string() {
        let s = "a".repeat(500);
        let result = truncate_for_log(&s, 100);
        assert!(result.starts_with(&"a".repeat(100)));
        assert!(result.contains("…(+400 bytes)"));
    }
}
