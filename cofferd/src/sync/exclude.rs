//! Per-location inclusion and exclusion rules.
//!
//! Rules are evaluated in two passes over the list in declaration order: the
//! first exclude rule that matches the entry's type decides exclusion, then the
//! first always-include rule of that type overrides it. The tree walker never
//! descends into an excluded directory, so nothing below it is evaluated.

use std::fmt::Write as _;
use std::path::Path;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExcludeError {
    #[error("invalid regex {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("line {line}: expected `Key = value`")]
    Syntax { line: usize },
    #[error("line {line}: unknown rule key {key:?}")]
    UnknownKey { line: usize, key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Exclude,
    AlwaysInclude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Regex,
}

/// Textual keys, one per (polarity, target, kind) combination.
const RULE_KEYS: [(&str, Polarity, Target, MatchKind); 8] = [
    ("ExcludeFile", Polarity::Exclude, Target::File, MatchKind::Exact),
    ("ExcludeFilesRegex", Polarity::Exclude, Target::File, MatchKind::Regex),
    ("ExcludeDir", Polarity::Exclude, Target::Directory, MatchKind::Exact),
    ("ExcludeDirsRegex", Polarity::Exclude, Target::Directory, MatchKind::Regex),
    ("AlwaysIncludeFile", Polarity::AlwaysInclude, Target::File, MatchKind::Exact),
    ("AlwaysIncludeFilesRegex", Polarity::AlwaysInclude, Target::File, MatchKind::Regex),
    ("AlwaysIncludeDir", Polarity::AlwaysInclude, Target::Directory, MatchKind::Exact),
    ("AlwaysIncludeDirsRegex", Polarity::AlwaysInclude, Target::Directory, MatchKind::Regex),
];

fn key_for(polarity: Polarity, target: Target, kind: MatchKind) -> &'static str {
    match (polarity, target, kind) {
        (Polarity::Exclude, Target::File, MatchKind::Exact) => "ExcludeFile",
        (Polarity::Exclude, Target::File, MatchKind::Regex) => "ExcludeFilesRegex",
        (Polarity::Exclude, Target::Directory, MatchKind::Exact) => "ExcludeDir",
        (Polarity::Exclude, Target::Directory, MatchKind::Regex) => "ExcludeDirsRegex",
        (Polarity::AlwaysInclude, Target::File, MatchKind::Exact) => "AlwaysIncludeFile",
        (Polarity::AlwaysInclude, Target::File, MatchKind::Regex) => "AlwaysIncludeFilesRegex",
        (Polarity::AlwaysInclude, Target::Directory, MatchKind::Exact) => "AlwaysIncludeDir",
        (Polarity::AlwaysInclude, Target::Directory, MatchKind::Regex) => "AlwaysIncludeDirsRegex",
    }
}

#[derive(Debug, Clone)]
pub struct ExcludeRule {
    pub polarity: Polarity,
    pub target: Target,
    pub kind: MatchKind,
    pattern: String,
    regex: Option<Regex>,
}

impl ExcludeRule {
    pub fn new(
        polarity: Polarity,
        target: Target,
        kind: MatchKind,
        pattern: &str,
    ) -> Result<Self, ExcludeError> {
        let (pattern, regex) = match kind {
            MatchKind::Exact => (normalize_exact(pattern), None),
            MatchKind::Regex => {
                let regex = Regex::new(pattern).map_err(|source| ExcludeError::Regex {
                    pattern: pattern.to_string(),
                    source,
                })?;
                (pattern.to_string(), Some(regex))
            }
        };
        Ok(Self {
            polarity,
            target,
            kind,
            pattern,
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn key(&self) -> &'static str {
        key_for(self.polarity, self.target, self.kind)
    }

    fn applies_to(&self, is_directory: bool) -> bool {
        match self.target {
            Target::File => !is_directory,
            Target::Directory => is_directory,
        }
    }

    fn matches(&self, path: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(path),
            None => self.pattern == path,
        }
    }
}

fn normalize_exact(pattern: &str) -> String {
    let trimmed = pattern.trim_end_matches('/');
    if trimmed.is_empty() && pattern.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Ordered rules of one location.
#[derive(Debug, Clone, Default)]
pub struct ExcludeList {
    rules: Vec<ExcludeRule>,
}

/// Rules split into the eight flat buckets the configuration format uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledRules {
    pub exclude_files: Vec<String>,
    pub exclude_files_regex: Vec<String>,
    pub exclude_dirs: Vec<String>,
    pub exclude_dirs_regex: Vec<String>,
    pub always_include_files: Vec<String>,
    pub always_include_files_regex: Vec<String>,
    pub always_include_dirs: Vec<String>,
    pub always_include_dirs_regex: Vec<String>,
}

impl ExcludeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rule: ExcludeRule) {
        self.rules.push(rule);
    }

    pub fn add(
        &mut self,
        polarity: Polarity,
        target: Target,
        kind: MatchKind,
        pattern: &str,
    ) -> Result<(), ExcludeError> {
        self.push(ExcludeRule::new(polarity, target, kind, pattern)?);
        Ok(())
    }

    pub fn rules(&self) -> &[ExcludeRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Parses `Key = value` lines. Blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Result<Self, ExcludeError> {
        let mut list = Self::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or(ExcludeError::Syntax { line: index + 1 })?;
            let key = key.trim();
            let (_, polarity, target, kind) = RULE_KEYS
                .iter()
                .find(|(name, ..)| *name == key)
                .ok_or_else(|| ExcludeError::UnknownKey {
                    line: index + 1,
                    key: key.to_string(),
                })?;
            list.add(*polarity, *target, *kind, value.trim())?;
        }
        Ok(list)
    }

    pub fn parse_lines<S: AsRef<str>>(lines: &[S]) -> Result<Self, ExcludeError> {
        let mut text = String::new();
        for line in lines {
            text.push_str(line.as_ref());
            text.push('\n');
        }
        Self::parse(&text)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for rule in &self.rules {
            let _ = writeln!(out, "{} = {}", rule.key(), rule.pattern);
        }
        out
    }

    pub fn compile(&self) -> CompiledRules {
        let mut compiled = CompiledRules::default();
        for rule in &self.rules {
            let bucket = match (rule.polarity, rule.target, rule.kind) {
                (Polarity::Exclude, Target::File, MatchKind::Exact) => &mut compiled.exclude_files,
                (Polarity::Exclude, Target::File, MatchKind::Regex) => {
                    &mut compiled.exclude_files_regex
                }
                (Polarity::Exclude, Target::Directory, MatchKind::Exact) => {
                    &mut compiled.exclude_dirs
                }
                (Polarity::Exclude, Target::Directory, MatchKind::Regex) => {
                    &mut compiled.exclude_dirs_regex
                }
                (Polarity::AlwaysInclude, Target::File, MatchKind::Exact) => {
                    &mut compiled.always_include_files
                }
                (Polarity::AlwaysInclude, Target::File, MatchKind::Regex) => {
                    &mut compiled.always_include_files_regex
                }
                (Polarity::AlwaysInclude, Target::Directory, MatchKind::Exact) => {
                    &mut compiled.always_include_dirs
                }
                (Polarity::AlwaysInclude, Target::Directory, MatchKind::Regex) => {
                    &mut compiled.always_include_dirs_regex
                }
            };
            bucket.push(rule.pattern.clone());
        }
        compiled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Included,
    Excluded,
    AlwaysIncluded,
    NoLocation,
}

impl Decision {
    pub fn is_excluded(self) -> bool {
        matches!(self, Decision::Excluded)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Evaluation<'a> {
    pub decision: Decision,
    pub rule: Option<&'a ExcludeRule>,
}

pub struct ExclusionEngine {
    location_root: Option<String>,
    list: ExcludeList,
}

impl ExclusionEngine {
    pub fn new(location_root: Option<&Path>, list: ExcludeList) -> Self {
        Self {
            location_root: location_root.map(|root| normalize_exact(&root.to_string_lossy())),
            list,
        }
    }

    pub fn evaluate(&self, path: &Path, is_directory: bool) -> Evaluation<'_> {
        let path = normalize_exact(&path.to_string_lossy());
        match &self.location_root {
            Some(root) if *root == path => {
                return Evaluation {
                    decision: Decision::Included,
                    rule: None,
                };
            }
            None if path == "/" => {
                return Evaluation {
                    decision: Decision::NoLocation,
                    rule: None,
                };
            }
            _ => {}
        }

        let mut evaluation = Evaluation {
            decision: Decision::Included,
            rule: None,
        };
        let candidates = || {
            self.list
                .rules
                .iter()
                .filter(move |rule| rule.applies_to(is_directory))
        };
        if let Some(rule) = candidates()
            .filter(|rule| rule.polarity == Polarity::Exclude)
            .find(|rule| rule.matches(&path))
        {
            evaluation = Evaluation {
                decision: Decision::Excluded,
                rule: Some(rule),
            };
        }
        if let Some(rule) = candidates()
            .filter(|rule| rule.polarity == Polarity::AlwaysInclude)
            .find(|rule| rule.matches(&path))
        {
            evaluation = Evaluation {
                decision: Decision::AlwaysIncluded,
                rule: Some(rule),
            };
        }
        evaluation
    }

    pub fn is_excluded(&self, path: &Path, is_directory: bool) -> bool {
        let evaluation = self.evaluate(path, is_directory);
        if let Some(rule) = evaluation.rule {
            tracing::trace!(
                path = %path.display(),
                decision = ?evaluation.decision,
                rule = rule.key(),
                pattern = rule.pattern(),
                "exclusion rule matched"
            );
        }
        evaluation.decision.is_excluded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(text: &str) -> ExclusionEngine {
        ExclusionEngine::new(
            Some(Path::new("/home/user")),
            ExcludeList::parse(text).unwrap(),
        )
    }

    #[test]
    fn location_root_is_always_included() {
        let engine = engine("ExcludeDirsRegex = .*");
        let eval = engine.evaluate(Path::new("/home/user/"), true);
        assert_eq!(eval.decision, Decision::Included);
        assert!(eval.rule.is_none());
    }

    #[test]
    fn filesystem_root_without_location_has_no_location() {
        let engine = ExclusionEngine::new(None, ExcludeList::new());
        assert_eq!(
            engine.evaluate(Path::new("/"), true).decision,
            Decision::NoLocation
        );
    }

    #[test]
    fn rules_only_apply_to_their_target_type() {
        let engine = engine("ExcludeFile = /home/user/cache\n");
        assert!(engine.is_excluded(Path::new("/home/user/cache"), false));
        assert!(!engine.is_excluded(Path::new("/home/user/cache"), true));
    }

    #[test]
    fn always_include_overrides_exclude() {
        let engine = engine(
            "ExcludeFilesRegex = \\.log$\n\
             AlwaysIncludeFile = /home/user/keep.log\n",
        );
        assert!(engine.is_excluded(Path::new("/home/user/drop.log"), false));

        let eval = engine.evaluate(Path::new("/home/user/keep.log"), false);
        assert_eq!(eval.decision, Decision::AlwaysIncluded);
        assert_eq!(eval.rule.map(|rule| rule.key()), Some("AlwaysIncludeFile"));
    }

    #[test]
    fn first_matching_exclude_rule_is_recorded() {
        let engine = engine(
            "ExcludeDirsRegex = /tmp\n\
             ExcludeDir = /home/user/tmp\n",
        );
        let eval = engine.evaluate(Path::new("/home/user/tmp"), true);
        assert_eq!(eval.decision, Decision::Excluded);
        assert_eq!(eval.rule.map(|rule| rule.pattern()), Some("/tmp"));
    }

    #[test]
    fn exact_patterns_drop_trailing_slash() {
        let engine = engine("ExcludeDir = /home/user/build/");
        assert!(engine.is_excluded(Path::new("/home/user/build"), true));
    }

    #[test]
    fn invalid_regex_is_a_configuration_error() {
        let err = ExcludeList::parse("ExcludeFilesRegex = (unclosed").unwrap_err();
        assert!(matches!(err, ExcludeError::Regex { .. }));
    }

    #[test]
    fn unknown_keys_and_bad_lines_are_rejected() {
        assert!(matches!(
            ExcludeList::parse("IncludeEverything = yes"),
            Err(ExcludeError::UnknownKey { line: 1, .. })
        ));
        assert!(matches!(
            ExcludeList::parse("# comment\n\njust text"),
            Err(ExcludeError::Syntax { line: 3 })
        ));
    }

    #[test]
    fn compile_partitions_into_buckets_and_keeps_order() {
        let text = "ExcludeDir = /a\n\
                    ExcludeFilesRegex = x$\n\
                    ExcludeDir = /b\n\
                    AlwaysIncludeDirsRegex = keep\n";
        let list = ExcludeList::parse(text).unwrap();
        let compiled = list.compile();
        assert_eq!(compiled.exclude_dirs, vec!["/a", "/b"]);
        assert_eq!(compiled.exclude_files_regex, vec!["x$"]);
        assert_eq!(compiled.always_include_dirs_regex, vec!["keep"]);
        assert!(compiled.always_include_files.is_empty());

        let reparsed = ExcludeList::parse(&list.render()).unwrap();
        assert_eq!(reparsed.compile(), compiled);
    }

    #[test]
    fn every_parsed_key_renders_back_to_itself() {
        for (key, polarity, target, kind) in RULE_KEYS {
            assert_eq!(key_for(polarity, target, kind), key);
        }
    }
}
