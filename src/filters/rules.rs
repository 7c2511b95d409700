use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::utils::errors::SentinelError;

/// Characters that can flank a keyword hit. A keyword counts as present
/// only when bounded by start/end of text or something outside word
/// characters (`\p{L}`, `\p{N}`, `_`).
const BOUNDARY: &str = r"[^\p{L}\p{N}_]";

/// One node of the boolean rule grammar as it appears in filters.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleNode {
    Keyword {
        keyword: String,
    },
    Pattern {
        regex: String,
    },
    Op {
        op: RuleOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        n: Option<usize>,
        args: Vec<RuleNode>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOp {
    And,
    Or,
    Not,
    AtLeast,
}

/// `deny` is evaluated first and short-circuits the filter; an absent
/// `allow` is a pass-through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny: Option<RuleNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<RuleNode>,
}

/// What a positive evaluation saw, for template rendering.
#[derive(Debug, Clone, Default)]
pub struct MatchInfo {
    pub keywords: Vec<String>,
    pub regex_match: Option<String>,
}

impl MatchInfo {
    fn finalize(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.keywords.retain(|k| seen.insert(k.clone()));
    }
}

#[derive(Debug)]
pub enum CompiledRule {
    And(Vec<CompiledRule>),
    Or(Vec<CompiledRule>),
    Not(Box<CompiledRule>),
    AtLeast(usize, Vec<CompiledRule>),
    Keyword { word: String, pattern: Regex },
    Pattern { pattern: Regex },
}

impl CompiledRule {
    fn eval(&self, text: &str, info: &mut MatchInfo) -> bool {
        match self {
            CompiledRule::And(args) => args.iter().all(|rule| rule.eval(text, info)),
            CompiledRule::Or(args) => args.iter().any(|rule| rule.eval(text, info)),
            CompiledRule::Not(inner) => {
                // A negated branch must not leak hits into the render info.
                let mut scratch = MatchInfo::default();
                !inner.eval(text, &mut scratch)
            }
            CompiledRule::AtLeast(n, args) => {
                let mut hits = 0;
                for rule in args {
                    if rule.eval(text, info) {
                        hits += 1;
                    }
                }
                hits >= *n
            }
            CompiledRule::Keyword { word, pattern } => {
                if pattern.is_match(text) {
                    info.keywords.push(word.clone());
                    true
                } else {
                    false
                }
            }
            CompiledRule::Pattern { pattern } => match pattern.find(text) {
                Some(found) => {
                    if info.regex_match.is_none() {
                        info.regex_match = Some(found.as_str().to_string());
                    }
                    true
                }
                None => false,
            },
        }
    }
}

/// A filter's compiled `deny`/`allow` pair.
#[derive(Debug, Default)]
pub struct CompiledRuleSet {
    deny: Option<CompiledRule>,
    allow: Option<CompiledRule>,
}

impl CompiledRuleSet {
    pub fn compile(rules: &RuleSet) -> Result<Self, SentinelError> {
        Ok(Self {
            deny: rules.deny.as_ref().map(compile_node).transpose()?,
            allow: rules.allow.as_ref().map(compile_node).transpose()?,
        })
    }

    /// `Some(info)` when the text passes: deny did not fire and allow
    /// (when present) matched.
    pub fn matches(&self, text: &str) -> Option<MatchInfo> {
        if let Some(deny) = &self.deny {
            let mut scratch = MatchInfo::default();
            if deny.eval(text, &mut scratch) {
                return None;
            }
        }

        let mut info = MatchInfo::default();
        match &self.allow {
            None => Some(info),
            Some(allow) => {
                if allow.eval(text, &mut info) {
                    info.finalize();
                    Some(info)
                } else {
                    None
                }
            }
        }
    }
}

fn compile_node(node: &RuleNode) -> Result<CompiledRule, SentinelError> {
    match node {
        RuleNode::Keyword { keyword } => compile_keyword(keyword),
        RuleNode::Pattern { regex } => {
            let pattern = RegexBuilder::new(regex)
                .case_insensitive(true)
                .build()
                .map_err(|e| SentinelError::Filter(format!("invalid regex {regex:?}: {e}")))?;
            Ok(CompiledRule::Pattern { pattern })
        }
        RuleNode::Op { op, n, args } => {
            let compiled = args.iter().map(compile_node).collect::<Result<Vec<_>, _>>()?;
            match op {
                RuleOp::And => {
                    if compiled.len() < 2 {
                        return Err(SentinelError::Filter("and needs at least 2 args".into()));
                    }
                    Ok(CompiledRule::And(compiled))
                }
                RuleOp::Or => {
                    if compiled.len() < 2 {
                        return Err(SentinelError::Filter("or needs at least 2 args".into()));
                    }
                    Ok(CompiledRule::Or(compiled))
                }
                RuleOp::Not => {
                    if compiled.len() != 1 {
                        return Err(SentinelError::Filter("not takes exactly 1 arg".into()));
                    }
                    let mut compiled = compiled;
                    Ok(CompiledRule::Not(Box::new(compiled.remove(0))))
                }
                RuleOp::AtLeast => {
                    let n = n.ok_or_else(|| {
                        SentinelError::Filter("at_least requires a count n".into())
                    })?;
                    if compiled.is_empty() || n < 1 || n > compiled.len() {
                        return Err(SentinelError::Filter(format!(
                            "at_least count {n} out of range for {} args",
                            compiled.len()
                        )));
                    }
                    Ok(CompiledRule::AtLeast(n, compiled))
                }
            }
        }
    }
}

fn compile_keyword(keyword: &str) -> Result<CompiledRule, SentinelError> {
    let word = keyword.trim();
    if word.is_empty() {
        return Err(SentinelError::Filter("empty keyword".into()));
    }

    // Whitespace inside a keyword matches any run of whitespace.
    let escaped = word
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");
    let source = format!("(?:^|{BOUNDARY})(?:{escaped})(?:$|{BOUNDARY})");
    let pattern = RegexBuilder::new(&source)
        .case_insensitive(true)
        .build()
        .map_err(|e| SentinelError::Filter(format!("keyword {keyword:?}: {e}")))?;

    Ok(CompiledRule::Keyword {
        word: word.to_string(),
        pattern,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyword(word: &str) -> RuleNode {
        RuleNode::Keyword {
            keyword: word.to_string(),
        }
    }

    fn pattern(regex: &str) -> RuleNode {
        RuleNode::Pattern {
            regex: regex.to_string(),
        }
    }

    fn op(op: RuleOp, n: Option<usize>, args: Vec<RuleNode>) -> RuleNode {
        RuleNode::Op { op, n, args }
    }

    fn compiled(allow: RuleNode) -> CompiledRuleSet {
        CompiledRuleSet::compile(&RuleSet {
            deny: None,
            allow: Some(allow),
        })
        .unwrap()
    }

    #[test]
    fn empty_rule_set_matches_everything() {
        let rules = CompiledRuleSet::compile(&RuleSet::default()).unwrap();
        assert!(rules.matches("anything at all").is_some());
        assert!(rules.matches("").is_some());
    }

    #[test]
    fn keyword_requires_word_boundaries() {
        let rules = compiled(keyword("sale"));
        assert!(rules.matches("big sale today").is_some());
        assert!(rules.matches("sale").is_some());
        assert!(rules.matches("SALE!").is_some());
        assert!(rules.matches("end of sale").is_some());
        assert!(rules.matches("wholesale prices").is_none());
        assert!(rules.matches("sales").is_none());
        assert!(rules.matches("sale_now").is_none());
    }

    #[test]
    fn keyword_boundaries_are_unicode_aware() {
        let rules = compiled(keyword("скидка"));
        assert!(rules.matches("сегодня скидка!").is_some());
        assert!(rules.matches("СКИДКА 50%").is_some());
        assert!(rules.matches("скидкамания").is_none());
    }

    #[test]
    fn keyword_whitespace_is_normalised() {
        let rules = compiled(keyword("free  shipping"));
        assert!(rules.matches("free shipping today").is_some());
        assert!(rules.matches("free\n shipping today").is_some());
        assert!(rules.matches("freeshipping").is_none());
    }

    #[test]
    fn regex_leaf_records_matched_substring() {
        let rules = compiled(pattern(r"\d{3}-\d{4}"));
        let info = rules.matches("call 555-0199 now").unwrap();
        assert_eq!(info.regex_match.as_deref(), Some("555-0199"));
    }

    #[test]
    fn matched_keywords_are_collected_and_deduplicated() {
        let rules = compiled(op(
            RuleOp::And,
            None,
            vec![keyword("rust"), op(RuleOp::Or, None, vec![keyword("job"), keyword("rust")])],
        ));
        let info = rules.matches("rust job offer").unwrap();
        assert_eq!(info.keywords, vec!["rust", "job"]);
    }

    #[test]
    fn boolean_operators_combine() {
        let both = compiled(op(RuleOp::And, None, vec![keyword("a"), keyword("b")]));
        assert!(both.matches("a and b").is_some());
        assert!(both.matches("only a").is_none());

        let either = compiled(op(RuleOp::Or, None, vec![keyword("a"), keyword("b")]));
        assert!(either.matches("only b here").is_some());
        assert!(either.matches("neither").is_none());

        let negated = compiled(op(RuleOp::Not, None, vec![keyword("spam")]));
        assert!(negated.matches("clean text").is_some());
        assert!(negated.matches("pure spam").is_none());

        let two_of = compiled(op(
            RuleOp::AtLeast,
            Some(2),
            vec![keyword("a"), keyword("b"), keyword("c")],
        ));
        assert!(two_of.matches("a and c").is_some());
        assert!(two_of.matches("only a").is_none());
    }

    #[test]
    fn deny_fires_before_allow() {
        let rules = CompiledRuleSet::compile(&RuleSet {
            deny: Some(keyword("test")),
            allow: Some(keyword("deploy")),
        })
        .unwrap();
        assert!(rules.matches("deploy to prod").is_some());
        assert!(rules.matches("test deploy").is_none());
    }

    #[test]
    fn negated_branch_does_not_leak_render_info() {
        let rules = compiled(op(
            RuleOp::And,
            None,
            vec![keyword("keep"), op(RuleOp::Not, None, vec![keyword("drop")])],
        ));
        let info = rules.matches("keep this").unwrap();
        assert_eq!(info.keywords, vec!["keep"]);
    }

    #[test]
    fn arity_violations_fail_compilation() {
        assert!(CompiledRuleSet::compile(&RuleSet {
            deny: None,
            allow: Some(op(RuleOp::And, None, vec![keyword("a")])),
        })
        .is_err());
        assert!(CompiledRuleSet::compile(&RuleSet {
            deny: None,
            allow: Some(op(RuleOp::Not, None, vec![keyword("a"), keyword("b")])),
        })
        .is_err());
        assert!(CompiledRuleSet::compile(&RuleSet {
            deny: None,
            allow: Some(op(RuleOp::AtLeast, Some(4), vec![keyword("a"), keyword("b")])),
        })
        .is_err());
        assert!(CompiledRuleSet::compile(&RuleSet {
            deny: None,
            allow: Some(op(RuleOp::AtLeast, None, vec![keyword("a")])),
        })
        .is_err());
    }

    #[test]
    fn invalid_regex_fails_compilation() {
        assert!(CompiledRuleSet::compile(&RuleSet {
            deny: None,
            allow: Some(pattern("([unclosed")),
        })
        .is_err());
    }

    #[test]
    fn rule_nodes_deserialize_from_json() {
        let node: RuleNode = serde_json::from_str(
            r#"{"op": "at_least", "n": 2, "args": [
                {"keyword": "alpha"},
                {"regex": "b.ta"},
                {"op": "not", "args": [{"keyword": "gamma"}]}
            ]}"#,
        )
        .unwrap();
        let rules = CompiledRuleSet::compile(&RuleSet {
            deny: None,
            allow: Some(node),
        })
        .unwrap();
        assert!(rules.matches("alpha beta").is_some());
        assert!(rules.matches("alpha beta gamma").is_some());
        assert!(rules.matches("alpha only plus gamma").is_none());
    }
}
