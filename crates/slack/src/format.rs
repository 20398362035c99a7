//! Markdown to Slack `mrkdwn` conversion for model output.
//!
//! Code spans and fenced blocks pass through untouched. An unterminated fence,
//! which is common while a reply is still streaming, protects everything after
//! it.

use std::sync::OnceLock;

use regex::Regex;

const BOLD_MARK: char = '\u{1}';

struct Patterns {
    heading: Regex,
    bullet: Regex,
    link: Regex,
    bold_stars: Regex,
    bold_underscores: Regex,
    italic: Regex,
    strike: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        heading: Regex::new(r"(?m)^#{1,6}[ \t]+(.+?)[ \t]*#*[ \t]*$").expect("Valid heading pattern"),
        bullet: Regex::new(r"(?m)^([ \t]*)[-*+][ \t]+").expect("Valid bullet pattern"),
        link: Regex::new(r"\[([^\]\n]+)\]\(([^)\s]+)\)").expect("Valid link pattern"),
        bold_stars: Regex::new(r"\*\*([^*\n]+?)\*\*").expect("Valid bold pattern"),
        bold_underscores: Regex::new(r"__([^_\n]+?)__").expect("Valid bold pattern"),
        italic: Regex::new(r"\*([^*\n]+?)\*").expect("Valid italic pattern"),
        strike: Regex::new(r"~~([^~\n]+?)~~").expect("Valid strike pattern"),
    })
}

pub fn to_mrkdwn(markdown: &str) -> String {
    markdown
        .split("```")
        .enumerate()
        .map(|(index, segment)| {
            if index % 2 == 1 {
                segment.to_owned()
            } else {
                convert_outside_fences(segment)
            }
        })
        .collect::<Vec<_>>()
        .join("```")
}

fn convert_outside_fences(text: &str) -> String {
    text.split('`')
        .enumerate()
        .map(|(index, segment)| if index % 2 == 1 { segment.to_owned() } else { convert_prose(segment) })
        .collect::<Vec<_>>()
        .join("`")
}

fn convert_prose(text: &str) -> String {
    let patterns = patterns();
    let bold = format!("{BOLD_MARK}${{1}}{BOLD_MARK}");

    let text = patterns.heading.replace_all(text, bold.as_str());
    let text = patterns.bullet.replace_all(&text, "${1}• ");
    let text = patterns.link.replace_all(&text, "<${2}|${1}>");
    let text = patterns.bold_stars.replace_all(&text, bold.as_str());
    let text = patterns.bold_underscores.replace_all(&text, bold.as_str());
    let text = patterns.italic.replace_all(&text, "_${1}_");
    let text = patterns.strike.replace_all(&text, "~${1}~");

    text.replace(BOLD_MARK, "*")
}
