//! Purpose: Rewrite class names containing characters the quickapp selector syntax rejects.
//! Exports: `TransformRules`, `DEFAULT_RULES`, `ClassListLiteral`, `locate_class_list_literals`,
//! `transcode_class_lists`.
//! Role: Shared by the finalize pass (compiled template class lists) and by transformers/CLI.
//! Invariants: Rule keys are single characters matched literally; never interpreted as patterns.
//! Invariants: No replacement contains a key character, so escaping is idempotent.
//! Invariants: Text outside quoted literals of a class list is never modified.
use std::borrow::Cow;
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, ErrorKind};

pub const DEFAULT_RULES: [(char, &str); 11] = [
    ('.', "-d-"),
    ('/', "-s-"),
    (':', "-c-"),
    ('%', "-p-"),
    ('!', "-e-"),
    ('#', "-w-"),
    ('(', "-bl-"),
    (')', "-br-"),
    ('[', "-fl-"),
    (']', "-fr-"),
    ('$', "-r-"),
];

static DEFAULT: LazyLock<TransformRules> = LazyLock::new(|| {
    TransformRules::new(DEFAULT_RULES).expect("default transform rules are valid")
});

/// Ordered character substitution table.
#[derive(Clone, Debug)]
pub struct TransformRules {
    rules: Vec<(char, String)>,
    trigger: Option<Regex>,
}

impl TransformRules {
    pub fn new<I, S>(rules: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (char, S)>,
        S: Into<String>,
    {
        let mut table: Vec<(char, String)> = Vec::new();
        for (key, replacement) in rules {
            let replacement = replacement.into();
            if let Some(slot) = table.iter_mut().find(|(existing, _)| *existing == key) {
                slot.1 = replacement;
            } else {
                table.push((key, replacement));
            }
        }

        for (key, replacement) in &table {
            if let Some(bad) = replacement
                .chars()
                .find(|c| table.iter().any(|(k, _)| k == c))
            {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!(
                        "replacement {replacement:?} for {key:?} contains rule character {bad:?}"
                    ))
                    .with_hint("Replacements must not contain any character that is itself replaced."));
            }
        }

        let trigger = if table.is_empty() {
            None
        } else {
            let class: String = table
                .iter()
                .map(|(key, _)| regex::escape(&key.to_string()))
                .collect();
            let pattern = format!("[{class}]");
            let regex = Regex::new(&pattern).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to compile transform trigger")
                    .with_source(err)
            })?;
            Some(regex)
        };

        Ok(Self {
            rules: table,
            trigger,
        })
    }

    /// Builds a table from string keys, rejecting keys that are not exactly one character.
    pub fn from_pairs<I, K, S>(pairs: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (K, S)>,
        K: AsRef<str>,
        S: Into<String>,
    {
        let mut rules = Vec::new();
        for (key, replacement) in pairs {
            let key = key.as_ref();
            let mut chars = key.chars();
            let (Some(ch), None) = (chars.next(), chars.next()) else {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("transform rule key {key:?} must be a single character")));
            };
            rules.push((ch, replacement.into()));
        }
        Self::new(rules)
    }

    pub fn iter(&self) -> impl Iterator<Item = (char, &str)> {
        self.rules.iter().map(|(key, value)| (*key, value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies every rule, in table order, as a global literal replacement.
    ///
    /// Returns the input untouched (borrowed) when it holds no rule character; this check
    /// runs over every class literal of every asset so it has to stay cheap.
    pub fn escape_selector<'a>(&self, selector: &'a str) -> Cow<'a, str> {
        let Some(trigger) = &self.trigger else {
            return Cow::Borrowed(selector);
        };
        if !trigger.is_match(selector) {
            return Cow::Borrowed(selector);
        }
        let mut escaped = selector.to_string();
        for (key, replacement) in &self.rules {
            if escaped.contains(*key) {
                escaped = escaped.replace(*key, replacement);
            }
        }
        Cow::Owned(escaped)
    }
}

impl Default for TransformRules {
    fn default() -> Self {
        DEFAULT.clone()
    }
}

/// A class list found in compiled template output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClassListLiteral {
    /// From the `classList` key through the closing `]`.
    pub span: Range<usize>,
    /// Between the brackets.
    pub inner: Range<usize>,
    /// Contents of each quoted string inside `inner`, quotes excluded.
    pub literals: Vec<Range<usize>>,
}

impl ClassListLiteral {
    pub fn classes<'a>(&'a self, text: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.literals.iter().map(move |range| &text[range.clone()])
    }
}

static CLASS_LIST_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:"classList"|'classList'|\bclassList)\s*:\s*(?:function\s*\(\s*\)\s*\{\s*return\s*|\(\s*\)\s*=>\s*)?\["#,
    )
    .expect("class list pattern compiles")
});

/// Finds `classList` values shaped either as a bracketed list or as a zero-argument function
/// returning one, and collects every quoted literal inside (ternary branches included).
pub fn locate_class_list_literals(text: &str) -> Vec<ClassListLiteral> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut search_from = 0;
    while let Some(m) = CLASS_LIST_OPEN.find_at(text, search_from) {
        search_from = m.end();
        if bytes[m.start()] == b'c' && preceded_by_member_access(bytes, m.start()) {
            continue;
        }
        let Some((close, literals)) = scan_bracket_body(bytes, m.end()) else {
            continue;
        };
        found.push(ClassListLiteral {
            span: m.start()..close + 1,
            inner: m.end()..close,
            literals,
        });
        search_from = close + 1;
    }
    found
}

/// Escapes every quoted class literal of every class list whose text changes under `rules`.
pub fn transcode_class_lists<'a>(text: &'a str, rules: &TransformRules) -> Cow<'a, str> {
    let mut edits: Vec<(Range<usize>, String)> = Vec::new();
    for list in locate_class_list_literals(text) {
        for range in list.literals {
            if let Cow::Owned(escaped) = rules.escape_selector(&text[range.clone()]) {
                edits.push((range, escaped));
            }
        }
    }
    if edits.is_empty() {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len() + edits.len() * 4);
    let mut cursor = 0;
    for (range, replacement) in edits {
        out.push_str(&text[cursor..range.start]);
        out.push_str(&replacement);
        cursor = range.end;
    }
    out.push_str(&text[cursor..]);
    Cow::Owned(out)
}

fn preceded_by_member_access(bytes: &[u8], start: usize) -> bool {
    bytes[..start]
        .iter()
        .rev()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'.')
}

/// Walks from just after an opening `[` to its matching `]`, skipping over string contents.
/// Returns `None` when the brackets do not balance before the end of the text.
fn scan_bracket_body(bytes: &[u8], start: usize) -> Option<(usize, Vec<Range<usize>>)> {
    let mut literals = Vec::new();
    let mut stack = vec![b']'];
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'"' | b'\'' | b'`') => {
                let end = closing_quote(bytes, i + 1, quote)?;
                if quote != b'`' {
                    literals.push(i + 1..end);
                }
                i = end + 1;
                continue;
            }
            b'[' => stack.push(b']'),
            b'(' => stack.push(b')'),
            b'{' => stack.push(b'}'),
            close @ (b']' | b')' | b'}') => {
                if stack.pop() != Some(close) {
                    return None;
                }
                if stack.is_empty() {
                    return Some((i, literals));
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn closing_quote(bytes: &[u8], mut i: usize, quote: u8) -> Option<usize> {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return Some(i),
            _ => i += 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_every_default_character() {
        let rules = TransformRules::default();
        let input = "\n    \"w-1.4\",\n    \"flex:col\",\n    \"w-1/3\",\n    \"90%\",\n    \"flex!row\"\n  ";
        let expected = "\n    \"w-1-d-4\",\n    \"flex-c-col\",\n    \"w-1-s-3\",\n    \"90-p-\",\n    \"flex-e-row\"\n  ";
        assert_eq!(rules.escape_selector(input), expected);

        let compact = r#""w-1.4", "flex:col", "w-1/3", "90%", "flex!row""#;
        assert_eq!(
            rules.escape_selector(compact),
            r#""w-1-d-4", "flex-c-col", "w-1-s-3", "90-p-", "flex-e-row""#
        );
    }

    #[test]
    fn safe_selector_is_borrowed() {
        let rules = TransformRules::default();
        assert!(matches!(
            rules.escape_selector("flex-col items-center"),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn escaping_is_idempotent() {
        let rules = TransformRules::default();
        for selector in [
            "w-1.4",
            "bg-[#fff]",
            "font-$font-name",
            "tracking-[2/5]",
            "hover:(text-red)",
            "!p-2",
            "w-50%",
            "plain",
        ] {
            let once = rules.escape_selector(selector).into_owned();
            let twice = rules.escape_selector(&once).into_owned();
            assert_eq!(once, twice, "selector {selector}");
        }
    }

    #[test]
    fn keys_are_matched_literally() {
        let rules = TransformRules::from_pairs([("$", "-r-"), ("(", "-bl-"), (".", "-d-")])
            .expect("rules");
        assert_eq!(rules.escape_selector("a$b(c.d"), "a-r-b-bl-c-d-d");
        assert_eq!(rules.escape_selector("abc"), "abc");
    }

    #[test]
    fn rules_apply_in_declaration_order() {
        let rules = TransformRules::new([('.', "_dot_"), ('/', "_slash_")]).expect("rules");
        let order: Vec<char> = rules.iter().map(|(key, _)| key).collect();
        assert_eq!(order, vec!['.', '/']);
        assert_eq!(rules.escape_selector("a.b/c"), "a_dot_b_slash_c");
    }

    #[test]
    fn reentrant_replacement_is_rejected() {
        let err = TransformRules::new([('.', "-d-"), ('-', "_")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn multi_character_key_is_rejected() {
        let err = TransformRules::from_pairs([("ab", "x")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn empty_table_never_rewrites() {
        let rules = TransformRules::new(Vec::<(char, String)>::new()).expect("rules");
        assert!(rules.is_empty());
        assert_eq!(rules.escape_selector("w-1.5"), "w-1.5");
    }

    #[test]
    fn locates_plain_and_function_lists() {
        let text = r#"{"classList": ["flex", "w-1.5"], "x": 1, "classList": function () {return ['w-20', 'h-20', this.getClass()]}}"#;
        let lists = locate_class_list_literals(text);
        assert_eq!(lists.len(), 2);
        assert_eq!(
            lists[0].classes(text).collect::<Vec<_>>(),
            vec!["flex", "w-1.5"]
        );
        assert_eq!(
            lists[1].classes(text).collect::<Vec<_>>(),
            vec!["w-20", "h-20"]
        );
        assert!(text[lists[1].span.clone()].ends_with("this.getClass()]"));
    }

    #[test]
    fn function_list_keeps_non_literals_untouched() {
        let text = "\"classList\": function () {return ['w-20', 'h-20', 'border-1', 'focus:bg-gray-500', this.getClass()]}";
        let out = transcode_class_lists(text, &TransformRules::default());
        assert_eq!(
            out,
            "\"classList\": function () {return ['w-20', 'h-20', 'border-1', 'focus-c-bg-gray-500', this.getClass()]}"
        );
    }

    #[test]
    fn finds_literals_inside_ternaries() {
        let text = r#""classList": function () {return [
            title === '2.3' ? 'font-$font-name bg-teal-200:55' : 'tracking-[2/5]',
            isFont ? 'font-$font-name' : 'tracking-[2/5]'
        ]}"#;
        let lists = locate_class_list_literals(text);
        assert_eq!(lists.len(), 1);
        assert_eq!(
            lists[0].classes(text).collect::<Vec<_>>(),
            vec![
                "2.3",
                "font-$font-name bg-teal-200:55",
                "tracking-[2/5]",
                "font-$font-name",
                "tracking-[2/5]"
            ]
        );
        let out = transcode_class_lists(text, &TransformRules::default());
        assert!(out.contains("'font-r-font-name bg-teal-200-c-55'"));
        assert!(out.contains("'tracking-fl-2-s-5-fr-'"));
        assert!(out.contains("title === '2-d-3'"));
    }

    #[test]
    fn safe_class_lists_are_byte_identical() {
        let text = "module.exports = {\n  \"classList\": [\n    \"flex\",\n    \"flex-col\"\n  ]\n}";
        let out = transcode_class_lists(text, &TransformRules::default());
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(out, text);
    }

    #[test]
    fn text_outside_class_lists_is_untouched() {
        let text = r#"var a = "w-1.5"; x = {"classList": ["w-1.5"]}; b = 'c:d';"#;
        let out = transcode_class_lists(text, &TransformRules::default());
        assert_eq!(
            out,
            r#"var a = "w-1.5"; x = {"classList": ["w-1-d-5"]}; b = 'c:d';"#
        );
    }

    #[test]
    fn minified_and_arrow_forms_are_recognized() {
        let text = "{classList:['p-1.5'],a:1},{classList:()=>['m-1/2']}";
        let out = transcode_class_lists(text, &TransformRules::default());
        assert_eq!(out, "{classList:['p-1-d-5'],a:1},{classList:()=>['m-1-s-2']}");
    }

    #[test]
    fn member_access_is_not_a_class_list() {
        let text = "ok ? el.classList : ['w-1.5']";
        assert!(locate_class_list_literals(text).is_empty());
    }

    #[test]
    fn brackets_inside_strings_do_not_close_the_list() {
        let text = r#""classList": ["w-[1.5]", "h-2"]"#;
        let lists = locate_class_list_literals(text);
        assert_eq!(lists.len(), 1);
        assert_eq!(
            lists[0].classes(text).collect::<Vec<_>>(),
            vec!["w-[1.5]", "h-2"]
        );
    }

    #[test]
    fn transcoding_twice_changes_nothing_more() {
        let text = r#""classList": ["w-1.5", "bg-[#000]"]"#;
        let rules = TransformRules::default();
        let once = transcode_class_lists(text, &rules).into_owned();
        let twice = transcode_class_lists(&once, &rules).into_owned();
        assert_eq!(once, twice);
    }

    #[test]
    fn unterminated_list_is_skipped() {
        let text = r#""classList": ["w-1.5", "#;
        assert!(locate_class_list_literals(text).is_empty());
    }
}
