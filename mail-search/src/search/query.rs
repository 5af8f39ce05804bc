//! Query normalisation and keyword matching

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// A normalised search query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub raw: String,
    pub keywords: Vec<String>,
}

impl SearchQuery {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw
            .trim()
            .to_lowercase()
            .replace(['\u{201C}', '\u{201D}', '\u{201E}'], "\"")
            .replace(['\u{2018}', '\u{2019}'], "'");

        let mut keywords = Vec::new();
        // Odd segments sit between quotes and are kept as phrases
        for (i, segment) in normalized.split('"').enumerate() {
            if i % 2 == 1 {
                let phrase = segment.trim();
                if !phrase.is_empty() {
                    keywords.push(phrase.to_string());
                }
            } else {
                keywords.extend(segment.split_whitespace().map(String::from));
            }
        }

        Self {
            raw: raw.to_string(),
            keywords,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// Every keyword must occur in the already lowercased `text`
    pub fn matches(&self, text: &str) -> bool {
        !self.keywords.is_empty() && self.keywords.iter().all(|k| text.contains(k.as_str()))
    }

    /// Snippet of `body` around the first keyword hit
    pub fn preview(&self, body: &str, context: usize) -> String {
        let lower = body.to_lowercase();
        // Lowercasing can change byte lengths, so locate by char index
        let chars: Vec<char> = body.chars().collect();
        let lower_chars: Vec<char> = lower.chars().collect();

        let hit = if chars.len() == lower_chars.len() {
            self.keywords
                .iter()
                .filter_map(|k| lower.find(k.as_str()).map(|byte| lower[..byte].chars().count()))
                .min()
        } else {
            None
        };

        let start = hit.map(|h| h.saturating_sub(context / 2)).unwrap_or(0);
        let end = (start + context).min(chars.len());

        let mut snippet: String = chars[start..end].iter().collect();
        if start > 0 {
            snippet.insert_str(0, "...");
        }
        if end < chars.len() {
            snippet.push_str("...");
        }
        snippet
    }

    /// Char ranges of `text` where a keyword occurs
    ///
    /// Matching ignores case and accents, so "cafe" marks "Café". Overlapping
    /// or touching ranges are merged.
    pub fn keyword_ranges(&self, text: &str) -> Vec<(usize, usize)> {
        let (folded, origin) = fold(text);

        let mut ranges = Vec::new();
        for keyword in &self.keywords {
            let (needle, _) = fold(keyword);
            if needle.is_empty() || needle.len() > folded.len() {
                continue;
            }
            for start in 0..=folded.len() - needle.len() {
                if folded[start..start + needle.len()] == needle[..] {
                    ranges.push((origin[start], origin[start + needle.len() - 1] + 1));
                }
            }
        }
        merge_ranges(ranges)
    }
}

/// Lowercased chars of `text` without combining marks, each paired with the
/// index of the source char it came from
fn fold(text: &str) -> (Vec<char>, Vec<usize>) {
    let mut folded = Vec::with_capacity(text.len());
    let mut origin = Vec::with_capacity(text.len());
    for (index, c) in text.chars().enumerate() {
        for base in std::iter::once(c).nfd().filter(|d| !is_combining_mark(*d)) {
            for lower in base.to_lowercase() {
                folded.push(lower);
                origin.push(index);
            }
        }
    }
    (folded, origin)
}

fn merge_ranges(mut ranges: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    ranges.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_on_whitespace() {
        let query = SearchQuery::parse("  Invoice   March ");
        assert_eq!(query.keywords, vec!["invoice", "march"]);
    }

    #[test]
    fn test_parse_keeps_quoted_phrases() {
        let query = SearchQuery::parse("\u{201C}Quarterly Report\u{201D} draft");
        assert_eq!(query.keywords, vec!["quarterly report", "draft"]);
    }

    #[test]
    fn test_parse_normalizes_apostrophes() {
        let query = SearchQuery::parse("Don\u{2019}t");
        assert_eq!(query.keywords, vec!["don't"]);
    }

    #[test]
    fn test_empty_query() {
        assert!(SearchQuery::parse("   ").is_empty());
        assert!(SearchQuery::parse("\"\"").is_empty());
        assert!(!SearchQuery::parse("").matches("anything"));
    }

    #[test]
    fn test_all_keywords_must_match() {
        let query = SearchQuery::parse("invoice march");
        assert!(query.matches("your invoice for march"));
        assert!(!query.matches("your invoice for april"));
    }

    #[test]
    fn test_preview_centres_on_hit() {
        let body = format!("{}invoice attached{}", "a".repeat(200), "b".repeat(200));
        let preview = SearchQuery::parse("invoice").preview(&body, 40);
        assert!(preview.contains("invoice"));
        assert!(preview.starts_with("..."));
        assert!(preview.ends_with("..."));

        assert_eq!(SearchQuery::parse("zzz").preview("short body", 40), "short body");
    }

    #[test]
    fn test_keyword_ranges_ignore_case_and_accents() {
        let query = SearchQuery::parse("cafe menu");
        assert_eq!(
            query.keyword_ranges("Le Café, le MENU du café"),
            vec![(3, 7), (12, 16), (20, 24)]
        );
        assert!(query.keyword_ranges("nothing here").is_empty());
    }

    #[test]
    fn test_overlapping_keyword_ranges_merge() {
        let query = SearchQuery::parse("invoice voice");
        assert_eq!(query.keyword_ranges("an invoice"), vec![(3, 10)]);

        let query = SearchQuery::parse("\"march report\" report");
        assert_eq!(query.keyword_ranges("march report"), vec![(0, 12)]);
    }
}
