use anyhow::{Context, Result};
use regex::Regex;

/// Bidirectional translator between CRM bracket markup ([b], [url=..], ...)
/// and HTML-flavored native rich text.
///
/// Both directions are an ordered table of pattern -> replacement pairs
/// applied in a single pass in table order. Non-recursive: nested same-tag
/// markup (bold inside bold) is not reliably round-tripped. Known
/// limitation inherited from the wire format.
pub struct Translator {
    to_native: Vec<(Regex, &'static str)>,
    to_bracket: Vec<(Regex, &'static str)>,
}

const TO_NATIVE: &[(&str, &str)] = &[
    (r"(?s)\[b\](.*?)\[/b\]", "<b>${1}</b>"),
    (r"(?s)\[i\](.*?)\[/i\]", "<i>${1}</i>"),
    (r"(?s)\[u\](.*?)\[/u\]", "<u>${1}</u>"),
    (r"(?s)\[s\](.*?)\[/s\]", "<s>${1}</s>"),
    (r"\[br\]", "\n"),
    (r"(?s)\[code\](.*?)\[/code\]", "<code>${1}</code>"),
    (r"(?s)\[pre\](.*?)\[/pre\]", "<pre>${1}</pre>"),
    (
        r#"(?s)\[url=([^\]]+)\](.*?)\[/url\]"#,
        r#"<a href="${1}">${2}</a>"#,
    ),
    // Plain [url]x[/url] is accepted on input only; both bracket forms map
    // to one native form, so the way back always emits the labeled form.
    (r"(?s)\[url\](.*?)\[/url\]", r#"<a href="${1}">${1}</a>"#),
    (
        r"(?s)\[size=(\d+)\](.*?)\[/size\]",
        r#"<span style="font-size:${1}px">${2}</span>"#,
    ),
    (
        r"(?s)\[color=([^\]]+)\](.*?)\[/color\]",
        r#"<span style="color:${1}">${2}</span>"#,
    ),
    (
        r"(?s)\[quote=([^\]]+)\](.*?)\[/quote\]",
        r#"<blockquote data-author="${1}">${2}</blockquote>"#,
    ),
    (
        r"(?s)\[quote\](.*?)\[/quote\]",
        "<blockquote>${1}</blockquote>",
    ),
];

const TO_BRACKET: &[(&str, &str)] = &[
    (r"(?s)<b>(.*?)</b>", "[b]${1}[/b]"),
    (r"(?s)<i>(.*?)</i>", "[i]${1}[/i]"),
    (r"(?s)<u>(.*?)</u>", "[u]${1}[/u]"),
    (r"(?s)<s>(.*?)</s>", "[s]${1}[/s]"),
    (r"\r?\n", "[br]"),
    (r"(?s)<code>(.*?)</code>", "[code]${1}[/code]"),
    (r"(?s)<pre>(.*?)</pre>", "[pre]${1}[/pre]"),
    (
        r#"(?s)<a href="([^"]+)">(.*?)</a>"#,
        "[url=${1}]${2}[/url]",
    ),
    (
        r#"(?s)<span style="font-size:(\d+)px">(.*?)</span>"#,
        "[size=${1}]${2}[/size]",
    ),
    (
        r#"(?s)<span style="color:([^"]+)">(.*?)</span>"#,
        "[color=${1}]${2}[/color]",
    ),
    (
        r#"(?s)<blockquote data-author="([^"]+)">(.*?)</blockquote>"#,
        "[quote=${1}]${2}[/quote]",
    ),
    (
        r"(?s)<blockquote>(.*?)</blockquote>",
        "[quote]${1}[/quote]",
    ),
];

fn compile(table: &[(&'static str, &'static str)]) -> Result<Vec<(Regex, &'static str)>> {
    let mut rules = Vec::with_capacity(table.len());
    for (pattern, rep) in table {
        let re =
            Regex::new(pattern).with_context(|| format!("bad markup pattern: {pattern}"))?;
        rules.push((re, *rep));
    }
    Ok(rules)
}

impl Translator {
    pub fn new() -> Result<Self> {
        Ok(Self {
            to_native: compile(TO_NATIVE)?,
            to_bracket: compile(TO_BRACKET)?,
        })
    }

    /// CRM bracket markup -> native rich text.
    pub fn to_native(&self, text: &str) -> String {
        apply(&self.to_native, text)
    }

    /// Native rich text -> CRM bracket markup.
    pub fn to_bracket(&self, text: &str) -> String {
        apply(&self.to_bracket, text)
    }
}

fn apply(rules: &[(Regex, &'static str)], text: &str) -> String {
    let mut out = text.to_string();
    for (re, rep) in rules {
        out = re.replace_all(&out, *rep).into_owned();
    }
    out
}
