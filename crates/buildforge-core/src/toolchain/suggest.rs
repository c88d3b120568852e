//! Failure classification: an ordered `(pattern, hint)` table.
//!
//! Rules are evaluated in order and the first match wins. A failure that
//! matches nothing gets no suggestion at all.

use regex::Regex;

use crate::config::{ConfigError, SuggestionRuleConfig};

/// Built-in rules: `(name, pattern, hint)`.
const STANDARD_RULES: &[(&str, &str, &str)] = &[
    (
        "missing_reference",
        r"(?i)(could not be found|cannot find (type|symbol|namespace|module|crate|package)|unresolved (import|external symbol|reference)|undefined reference to|are you missing an? (using directive|assembly reference)|no such module|package \S+ does not exist)",
        "A referenced type or package could not be resolved. Restore dependencies and check that every project reference and import is declared.",
    ),
    (
        "duplicate_type",
        r"(?i)(already (contains|has|defines) a definition|duplicate (definition|type|symbol|class)|is defined multiple times|redefinition of|multiple definition of)",
        "The same type or symbol is defined more than once. Remove the duplicate definition or move one of them into a different namespace.",
    ),
    (
        "language_feature",
        r"(?i)(feature .+ is not available|requires language version|language version .+ (is not supported|does not support)|not supported in this language version|is (unstable|experimental)|requires (a )?newer (compiler|language version))",
        "The code uses a language feature the configured compiler version does not support. Raise the language version in the project settings or rewrite the construct.",
    ),
    (
        "missing_program",
        r"(?i)(command not found|no such file or directory \(os error 2\)|is not recognized as an internal or external command)",
        "The toolchain program could not be started. Check that it is installed and on PATH for the service user.",
    ),
    (
        "disk_full",
        r"(?i)no space left on device",
        "The build host ran out of disk space. Free space in the output directories and retry.",
    ),
    (
        "permission_denied",
        r"(?i)(permission denied|access to the path .+ is denied)",
        "The toolchain could not access a file. Check ownership and permissions of the project and output directories.",
    ),
];

/// A single classification rule.
#[derive(Debug, Clone)]
pub struct SuggestionRule {
    pub name: String,
    pattern: Regex,
    pub hint: String,
}

impl SuggestionRule {
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        hint: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            pattern: Regex::new(pattern)?,
            hint: hint.into(),
        })
    }

    /// Returns `true` if the rule's signature occurs in `text`.
    pub fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

/// Ordered rule table, first match wins.
#[derive(Debug, Clone, Default)]
pub struct SuggestionTable {
    rules: Vec<SuggestionRule>,
}

impl SuggestionTable {
    /// A table that never suggests anything.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule and return `self` (builder pattern).
    pub fn with_rule(mut self, rule: SuggestionRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// The built-in compiler failure signatures.
    pub fn standard() -> Self {
        let rules = STANDARD_RULES
            .iter()
            .filter_map(|(name, pattern, hint)| SuggestionRule::new(*name, pattern, *hint).ok())
            .collect();
        Self { rules }
    }

    /// Configured rules first, then the built-in ones.
    pub fn from_config(extra: &[SuggestionRuleConfig]) -> Result<Self, ConfigError> {
        let mut table = Self::empty();
        for rule in extra {
            let compiled = SuggestionRule::new(&rule.name, &rule.pattern, &rule.hint).map_err(
                |source| ConfigError::InvalidPattern {
                    name: rule.name.clone(),
                    source,
                },
            )?;
            table = table.with_rule(compiled);
        }
        table.rules.extend(Self::standard().rules);
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule matching `text`.
    pub fn classify(&self, text: &str) -> Option<&SuggestionRule> {
        self.rules.iter().find(|rule| rule.matches(text))
    }

    /// Classify a failure, looking at each text in order (stderr first).
    pub fn suggest(&self, texts: &[&str]) -> Option<String> {
        texts
            .iter()
            .filter(|t| !t.is_empty())
            .find_map(|t| self.classify(t))
            .map(|rule| rule.hint.clone())
    }
}
