//! Condition operators and the input transformers applied before them.

use std::borrow::Cow;

use regex::{Regex, RegexBuilder};

/// Test applied to each candidate scalar of a condition input.
#[derive(Debug, Clone)]
pub enum Operator {
    /// Regular expression search. Case-insensitive unless the rule asks otherwise.
    MatchRegex { regex: Regex },
    /// Substring search for any of the phrases.
    PhraseMatch { phrases: Vec<String> },
    /// Whole-value equality with any of the values.
    ExactMatch { values: Vec<String> },
}

impl Operator {
    pub fn match_regex(pattern: &str, case_sensitive: bool) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()?;
        Ok(Operator::MatchRegex { regex })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operator::MatchRegex { .. } => "match_regex",
            Operator::PhraseMatch { .. } => "phrase_match",
            Operator::ExactMatch { .. } => "exact_match",
        }
    }

    /// Reported as `operator_value` in match events. List operators report
    /// nothing so list contents do not leak into events.
    pub fn operator_value(&self) -> String {
        match self {
            Operator::MatchRegex { regex } => regex.as_str().to_string(),
            Operator::PhraseMatch { .. } | Operator::ExactMatch { .. } => String::new(),
        }
    }

    /// Returns the matched fragment when `input` satisfies the operator.
    pub fn find(&self, input: &str) -> Option<String> {
        match self {
            Operator::MatchRegex { regex } => regex.find(input).map(|m| m.as_str().to_string()),
            Operator::PhraseMatch { phrases } => phrases
                .iter()
                .find(|phrase| input.contains(phrase.as_str()))
                .cloned(),
            Operator::ExactMatch { values } => values
                .iter()
                .find(|value| value.as_str() == input)
                .cloned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transformer {
    Lowercase,
    RemoveNulls,
    CompressWhitespace,
}

impl Transformer {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "lowercase" => Some(Transformer::Lowercase),
            "remove_nulls" => Some(Transformer::RemoveNulls),
            "compress_whitespace" => Some(Transformer::CompressWhitespace),
            _ => None,
        }
    }

    pub fn apply<'a>(self, input: Cow<'a, str>) -> Cow<'a, str> {
        match self {
            Transformer::Lowercase => {
                if input.chars().any(char::is_uppercase) {
                    Cow::Owned(input.to_lowercase())
                } else {
                    input
                }
            }
            Transformer::RemoveNulls => {
                if input.contains('\0') {
                    Cow::Owned(input.replace('\0', ""))
                } else {
                    input
                }
            }
            Transformer::CompressWhitespace => {
                let mut output = String::with_capacity(input.len());
                let mut in_whitespace = false;
                for ch in input.chars() {
                    if ch.is_whitespace() {
                        if !in_whitespace {
                            output.push(' ');
                        }
                        in_whitespace = true;
                    } else {
                        output.push(ch);
                        in_whitespace = false;
                    }
                }
                if output == input {
                    input
                } else {
                    Cow::Owned(output)
                }
            }
        }
    }
}

/// Applies `transformers` in order.
pub fn transform<'a>(transformers: &[Transformer], input: Cow<'a, str>) -> Cow<'a, str> {
    transformers
        .iter()
        .fold(input, |value, transformer| transformer.apply(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_regex_case_insensitive_by_default() {
        let op = Operator::match_regex("union\\s+select", false).unwrap();
        assert_eq!(op.find("1 UNION  SELECT *").as_deref(), Some("UNION  SELECT"));
        assert_eq!(op.name(), "match_regex");
        assert_eq!(op.operator_value(), "union\\s+select");
    }

    #[test]
    fn test_match_regex_case_sensitive() {
        let op = Operator::match_regex("^attack$", true).unwrap();
        assert!(op.find("attack").is_some());
        assert!(op.find("ATTACK").is_none());
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        assert!(Operator::match_regex("(unclosed", false).is_err());
    }

    #[test]
    fn test_phrase_and_exact_match() {
        let phrase = Operator::PhraseMatch {
            phrases: vec!["/etc/passwd".to_string(), "../".to_string()],
        };
        assert_eq!(phrase.find("GET /../x").as_deref(), Some("../"));
        assert!(phrase.find("/index.html").is_none());

        let exact = Operator::ExactMatch {
            values: vec!["admin".to_string()],
        };
        assert!(exact.find("admin").is_some());
        assert!(exact.find("administrator").is_none());
        assert_eq!(exact.operator_value(), "");
    }

    #[test]
    fn test_transformers_chain() {
        let transformers = [
            Transformer::RemoveNulls,
            Transformer::CompressWhitespace,
            Transformer::Lowercase,
        ];
        let out = transform(&transformers, Cow::Borrowed("SeL\0ECT \t\n *"));
        assert_eq!(out, "select *");
    }

    #[test]
    fn test_transformer_borrows_when_unchanged() {
        let out = Transformer::Lowercase.apply(Cow::Borrowed("already lower"));
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(Transformer::from_name("unknown"), None);
    }
}
