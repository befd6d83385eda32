//! Short task titles from noisy user messages
//!
//! Each cleanup step is a standalone function so it can be tested on its
//! own; [`extract_title`] runs them in order.

/// Returned when nothing meaningful is left
pub const UNTITLED: &str = "(untitled)";

/// Default maximum title length in characters
pub const DEFAULT_MAX_LEN: usize = 60;

/// Clauses shorter than this are not considered titles
const MIN_CLAUSE_LEN: usize = 4;

static_regex!(code_fence_re, r"```[\s\S]*?```");
static_regex!(inline_code_re, r"`[^`]+`");
static_regex!(html_tag_re, r"<[^>]+>");
static_regex!(unix_path_re, r"(?:/[A-Za-z0-9_.\-]+){3,}");
static_regex!(windows_path_re, r"[A-Z]:\\[A-Za-z0-9_.\-\\]+");
static_regex!(url_re, r"https?://\S+");
static_regex!(
    datetime_re,
    r"\d{4}[-/]\d{1,2}[-/]\d{1,2}[\sT]\d{1,2}:\d{1,2}(:\d{1,2})?(\.\d+)?(Z|[+-]\d{1,2}:?\d{0,2})?"
);
static_regex!(date_re, r"\d{4}[-/]\d{1,2}[-/]\d{1,2}");
static_regex!(clock_re, r"(?i)\d{1,2}:\d{2}(:\d{2})?(\s*[AP]M)?");
static_regex!(timezone_re, r"(?i)GMT[+-]?\d*");
static_regex!(json_blob_re, r"\{[^}]{50,}\}");
static_regex!(separator_line_re, r"(?m)^[\s=\-*#>|]{3,}$");
static_regex!(whitespace_re, r"\s+");
static_regex!(question_re, r"[^。！？.!?\n]*[？?][^。！？.!?\n]*");
static_regex!(sentence_split_re, r"[。！？.!?\n]");

/// Remove fenced code blocks, inline code spans and HTML tags
pub fn strip_code(text: &str) -> String {
    let text = code_fence_re().replace_all(text, "");
    let text = inline_code_re().replace_all(&text, "");
    html_tag_re().replace_all(&text, "").into_owned()
}

/// Remove file paths with three or more segments and URLs
pub fn strip_paths_and_urls(text: &str) -> String {
    let text = unix_path_re().replace_all(text, "");
    let text = windows_path_re().replace_all(&text, "");
    url_re().replace_all(&text, "").into_owned()
}

/// Remove date, time and timezone tokens
pub fn strip_timestamps(text: &str) -> String {
    let text = datetime_re().replace_all(text, "");
    let text = date_re().replace_all(&text, "");
    let text = clock_re().replace_all(&text, "");
    timezone_re().replace_all(&text, "").into_owned()
}

/// Remove large JSON-looking fragments and separator lines
pub fn strip_blobs(text: &str) -> String {
    let text = json_blob_re().replace_all(text, "");
    separator_line_re().replace_all(&text, "").into_owned()
}

pub fn collapse_whitespace(text: &str) -> String {
    whitespace_re().replace_all(text, " ").trim().to_string()
}

/// Cut to `max_len` characters, appending an ellipsis when anything was cut
pub fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_len).collect();
    out.push_str("...");
    out
}

/// Pick the title clause from already cleaned text
pub fn choose_clause(text: &str, max_len: usize) -> String {
    if let Some(m) = question_re().find(text) {
        let question = m.as_str().trim();
        let len = question.chars().count();
        if len >= MIN_CLAUSE_LEN {
            return truncate(question, max_len);
        }
    }

    if let Some(sentence) = sentence_split_re()
        .split(text)
        .map(str::trim)
        .find(|s| s.chars().count() >= MIN_CLAUSE_LEN)
    {
        return truncate(sentence, max_len);
    }

    truncate(text, max_len)
}

/// Derive a short title from raw message text
pub fn extract_title(raw: &str, max_len: usize) -> String {
    if raw.trim().is_empty() {
        return UNTITLED.to_string();
    }

    let text = strip_code(raw);
    let text = strip_paths_and_urls(&text);
    let text = strip_timestamps(&text);
    let text = strip_blobs(&text);
    let text = collapse_whitespace(&text);

    if text.is_empty() {
        return UNTITLED.to_string();
    }

    choose_clause(&text, max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_block_then_question() {
        assert_eq!(
            extract_title("```code```\nWhat is 2+2?", DEFAULT_MAX_LEN),
            "What is 2+2?"
        );
    }

    #[test]
    fn test_empty_input_is_untitled() {
        assert_eq!(extract_title("", DEFAULT_MAX_LEN), UNTITLED);
        assert_eq!(extract_title("   \n\t", DEFAULT_MAX_LEN), UNTITLED);
        // Only noise left after cleanup
        assert_eq!(extract_title("```rm -rf /```", DEFAULT_MAX_LEN), UNTITLED);
    }

    #[test]
    fn test_long_text_is_truncated() {
        let title = extract_title(&"a".repeat(100), DEFAULT_MAX_LEN);
        assert_eq!(title, format!("{}...", "a".repeat(60)));
    }

    #[test]
    fn test_strip_paths_and_urls() {
        assert_eq!(
            collapse_whitespace(&strip_paths_and_urls(
                "open /Users/me/project/src/main.rs and https://example.com/x now"
            )),
            "open and now"
        );
        assert_eq!(strip_paths_and_urls("see C:\\Users\\me\\file.txt"), "see ");
        // Short paths stay
        assert_eq!(strip_paths_and_urls("edit src/lib.rs"), "edit src/lib.rs");
    }

    #[test]
    fn test_strip_timestamps() {
        assert_eq!(
            collapse_whitespace(&strip_timestamps(
                "[2024-01-05T10:30:00Z] deploy at 9:15 PM GMT+8 on 2024/1/5"
            )),
            "[] deploy at on"
        );
    }

    #[test]
    fn test_strip_code_and_html() {
        assert_eq!(
            collapse_whitespace(&strip_code("run `cargo test` <b>now</b>")),
            "run now"
        );
    }

    #[test]
    fn test_strip_blobs() {
        let blob = format!("before {{\"k\": \"{}\"}} after", "x".repeat(60));
        assert_eq!(collapse_whitespace(&strip_blobs(&blob)), "before after");
        assert_eq!(
            collapse_whitespace(&strip_blobs("title\n=====\nbody")),
            "title body"
        );
    }

    #[test]
    fn test_prefers_sentence_when_no_question() {
        assert_eq!(
            extract_title("Hi. Please refactor the parser module! Thanks", DEFAULT_MAX_LEN),
            "Please refactor the parser module"
        );
    }

    #[test]
    fn test_long_question_is_truncated() {
        let question = format!("Why {}?", "z".repeat(80));
        let title = extract_title(&question, 20);
        assert_eq!(title.chars().count(), 23);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_cjk_punctuation() {
        assert_eq!(extract_title("你好。这个函数为什么报错？", DEFAULT_MAX_LEN), "这个函数为什么报错？");
    }
}
