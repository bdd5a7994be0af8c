use crate::models::ArticleAnalysis;
use itertools::Itertools;

/// Locations that carry no semantic signal for retrieval.
const GENERIC_LOCATIONS: &[&str] = &["GLOBAL", "WORLD", "NONE", "N/A", ""];

/// Build the single deterministic string fed to the embedding model.
///
/// Parts appear in the order title, location, summary, entities, keywords,
/// tags, focus. Parts are joined by `". "` unless the preceding part already
/// ends with a period, in which case a single space suffices. The result
/// ends with a period iff it is non-empty.
pub fn build_search_text(title: &str, analysis: &ArticleAnalysis) -> String {
    let mut out = String::new();

    append_part(&mut out, title.trim());

    let location = analysis.primary_location.trim();
    if !GENERIC_LOCATIONS
        .iter()
        .any(|g| location.eq_ignore_ascii_case(g))
    {
        append_part(&mut out, location);
    }

    let summary = analysis
        .event_summary_points
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(ensure_period)
        .join(" ");
    append_part(&mut out, &summary);

    append_part(&mut out, &join_list(&analysis.key_entities));
    append_part(&mut out, &join_list(&analysis.thematic_keywords));
    append_part(&mut out, &join_list(&analysis.topic_tags));
    append_part(&mut out, &join_list(&analysis.content_focus));

    if !out.is_empty() && !out.ends_with('.') {
        out.push('.');
    }
    out
}

fn join_list(items: &[String]) -> String {
    items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .join(", ")
}

fn ensure_period(s: &str) -> String {
    if s.ends_with('.') {
        s.to_string()
    } else {
        format!("{s}.")
    }
}

fn append_part(out: &mut String, part: &str) {
    if part.is_empty() {
        return;
    }
    if out.is_empty() {
        out.push_str(part);
    } else if out.ends_with('.') {
        out.push(' ');
        out.push_str(part);
    } else {
        out.push_str(". ");
        out.push_str(part);
    }
}
