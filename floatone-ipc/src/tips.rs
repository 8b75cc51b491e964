use std::sync::OnceLock;

use regex::Regex;

/// A tip split into its display text and optional description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTip {
    pub main: String,
    pub description: Option<String>,
}

/// Split a tip into main lines and a description.
/// The first non-empty line starting with `>` becomes the description; later `>` lines are dropped.
pub fn parse_tip_text(tip: &str) -> ParsedTip {
    let mut main_lines = Vec::new();
    let mut description = None;

    for line in tip.split('\n') {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix('>') {
            if description.as_deref().map_or(true, str::is_empty) {
                description = Some(rest.trim().to_string());
            }
        } else if !line.is_empty() {
            main_lines.push(line);
        }
    }

    ParsedTip {
        main: main_lines.join("\n").trim().to_string(),
        description,
    }
}

pub fn parse_all_tips(tips: &[String]) -> Vec<ParsedTip> {
    tips.iter().map(|t| parse_tip_text(t)).collect()
}

fn separator() -> &'static Regex {
    static SEPARATOR: OnceLock<Regex> = OnceLock::new();
    SEPARATOR.get_or_init(|| {
        Regex::new(r"\n\s*(?:--\s*)?\n").expect("tip separator pattern is valid")
    })
}

/// Split settings text into tips. Tips are separated by blank lines or `--` lines.
pub fn parse_tips_from_text(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    separator()
        .split(text)
        .filter(|tip| !tip.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Render tips back into editable text
pub fn tips_to_text(tips: &[String]) -> String {
    tips.join("\n\n")
}
