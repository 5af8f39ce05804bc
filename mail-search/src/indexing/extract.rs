//! Plaintext extraction from decrypted message bodies

use regex::Regex;

use crate::error::{Result, SearchError};

/// Turns HTML or plain bodies into normalised searchable text, dropping
/// quoted replies
pub struct PlaintextExtractor {
    hidden_blocks: Regex,
    quote_blocks: Regex,
    line_breaks: Regex,
    tags: Regex,
    numeric_entities: Regex,
    wrote_trailer: Regex,
    whitespace: Regex,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| SearchError::Parse(e.to_string()))
}

impl PlaintextExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            hidden_blocks: compile(r"(?is)<(style|script|head)[^>]*>.*?</(style|script|head)>")?,
            quote_blocks: compile(
                r#"(?is)<blockquote[^>]*>.*?</blockquote>|<div[^>]*class="[^"]*(gmail_quote|protonmail_quote)[^"]*"[^>]*>.*?</div>"#,
            )?,
            line_breaks: compile(r"(?i)<br\s*/?>|</p>|</div>|</li>|</tr>")?,
            tags: compile(r"(?s)<[^>]*>")?,
            numeric_entities: compile(r"&#(x?)([0-9a-fA-F]+);")?,
            wrote_trailer: compile(r"(?m)^\s*On .{1,200} wrote:\s*$")?,
            whitespace: compile(r"\s+")?,
        })
    }

    pub fn extract(&self, body: &str, mime_type: &str) -> String {
        let text = if mime_type.eq_ignore_ascii_case("text/html") || body.contains("</") {
            self.from_html(body)
        } else {
            body.to_string()
        };

        let mut kept = Vec::new();
        for line in text.lines() {
            if line.trim_start().starts_with('>') {
                continue;
            }
            if self.wrote_trailer.is_match(line) {
                break;
            }
            kept.push(line);
        }

        self.whitespace
            .replace_all(&kept.join("\n"), " ")
            .trim()
            .to_string()
    }

    fn from_html(&self, html: &str) -> String {
        let text = self.hidden_blocks.replace_all(html, " ");
        let text = self.quote_blocks.replace_all(&text, " ");
        let text = self.line_breaks.replace_all(&text, "\n");
        let text = self.tags.replace_all(&text, " ");
        self.decode_entities(&text)
    }

    fn decode_entities(&self, text: &str) -> String {
        let text = self.numeric_entities.replace_all(text, |caps: &regex::Captures| {
            let radix = if caps[1].is_empty() { 10 } else { 16 };
            u32::from_str_radix(&caps[2], radix)
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_default()
        });

        text.replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&apos;", "'")
            .replace("&amp;", "&")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_markup_and_styles() {
        let extractor = PlaintextExtractor::new().unwrap();
        let html = "<html><head><style>p { color: red }</style></head>\
                    <body><p>Your <b>invoice</b> is&nbsp;ready</p><script>alert(1)</script></body></html>";
        assert_eq!(extractor.extract(html, "text/html"), "Your invoice is ready");
    }

    #[test]
    fn test_drops_quoted_content() {
        let extractor = PlaintextExtractor::new().unwrap();
        let html = "<div>Thanks!</div><blockquote>old thread invoice</blockquote>\
                    <div class=\"gmail_quote\">older</div>";
        assert_eq!(extractor.extract(html, "text/html"), "Thanks!");

        let plain = "See below\n> quoted line\nOn Mon, Jan 1, 2024 Bob wrote:\nprevious message";
        assert_eq!(extractor.extract(plain, "text/plain"), "See below");
    }

    #[test]
    fn test_decodes_entities() {
        let extractor = PlaintextExtractor::new().unwrap();
        assert_eq!(
            extractor.extract("<p>Tom &amp; Jerry &#8364;5 &#x41;</p>", "text/html"),
            "Tom & Jerry \u{20ac}5 A"
        );
    }
}
