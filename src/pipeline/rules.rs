//! Declarative rules engine.
//!
//! Rules are configuration data compiled once per configuration snapshot:
//! - evaluated in ascending `priority`, ties broken by declaration order
//! - every matching rule contributes its actions, in order
//! - a matching `terminal` rule stops evaluation
//!
//! `evaluate` has no side effects. The orchestrator applies the returned
//! plan (after `resolve`) through the mail source.

use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;
use crate::model::{Action, ClassificationResult, Message, Priority};

/// A rule as written in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Lower runs earlier.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub terminal: bool,
    /// All must hold. Empty means the rule always matches.
    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionConfig {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Option<serde_yaml::Value>,
}

/// How mutually exclusive placement actions (move/delete) are settled when
/// several matched rules ask for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Every action runs in order; only the last placement survives.
    #[default]
    LastWriteWins,
    /// Only the first placement survives.
    FirstWins,
    /// Nothing is dropped.
    ApplyAll,
}

/// An action chosen by a rule, not yet applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAction {
    pub rule_id: String,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq)]
enum Field {
    Sender,
    To,
    Cc,
    Subject,
    Body,
    Folder,
    Account,
    Domain,
    HasAttachments,
    AttachmentCount,
    Header(String),
    Category,
    Priority,
    Confidence,
    ActionItemCount,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        if let Some(header) = lower.strip_prefix("header.") {
            return (!header.is_empty()).then(|| Self::Header(header.to_string()));
        }
        Some(match lower.as_str() {
            "from" | "sender" | "from_addr" => Self::Sender,
            "to" | "recipients" | "to_addrs" => Self::To,
            "cc" => Self::Cc,
            "subject" => Self::Subject,
            "body" => Self::Body,
            "folder" => Self::Folder,
            "account" => Self::Account,
            "domain" => Self::Domain,
            "has_attachments" => Self::HasAttachments,
            "attachment_count" => Self::AttachmentCount,
            "classification.category" | "category" => Self::Category,
            "classification.priority" | "priority" => Self::Priority,
            "classification.confidence" | "confidence" => Self::Confidence,
            "classification.action_items" => Self::ActionItemCount,
            _ => return None,
        })
    }

    fn needs_classification(&self) -> bool {
        matches!(
            self,
            Self::Category | Self::Priority | Self::Confidence | Self::ActionItemCount
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    Glob,
    In,
    NotIn,
    Exists,
    NotExists,
    Gte,
    Lte,
}

impl Operator {
    fn parse(name: &str) -> Option<Self> {
        Some(match name.trim().to_ascii_lowercase().as_str() {
            "equals" | "eq" => Self::Equals,
            "contains" => Self::Contains,
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            "matches" | "regex" => Self::Matches,
            "glob" => Self::Glob,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "exists" => Self::Exists,
            "not_exists" => Self::NotExists,
            "gte" => Self::Gte,
            "lte" => Self::Lte,
            _ => return None,
        })
    }
}

/// Pre-compiled right-hand side of a condition.
#[derive(Debug, Clone)]
enum Matcher {
    /// Lowercased literal.
    Text(String),
    Regex(Regex),
    Glob(GlobMatcher),
    /// Lowercased members.
    List(Vec<String>),
    Number(f64),
    None,
}

#[derive(Debug, Clone)]
struct Condition {
    field: Field,
    operator: Operator,
    matcher: Matcher,
}

/// A field value extracted from a message for comparison.
enum Value {
    Text(String),
    List(Vec<String>),
    Number(f64),
    Bool(bool),
    Missing,
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Self::Text(s) => !s.is_empty(),
            Self::List(items) => !items.is_empty(),
            Self::Number(n) => *n != 0.0,
            Self::Bool(b) => *b,
            Self::Missing => false,
        }
    }

    /// Lowercased string views of the value; lists expose every member.
    fn texts(&self) -> Vec<String> {
        match self {
            Self::Text(s) => vec![s.to_lowercase()],
            Self::List(items) => items.iter().map(|s| s.to_lowercase()).collect(),
            Self::Number(n) => vec![format_number(*n)],
            Self::Bool(b) => vec![b.to_string()],
            Self::Missing => Vec::new(),
        }
    }

    fn number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => parse_number(s),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::List(items) => Some(items.len() as f64),
            Self::Missing => None,
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Numbers, or priority names mapped to their ordinal.
fn parse_number(s: &str) -> Option<f64> {
    s.trim()
        .parse::<f64>()
        .ok()
        .or_else(|| s.parse::<Priority>().ok().map(priority_ordinal))
}

fn priority_ordinal(p: Priority) -> f64 {
    match p {
        Priority::Low => 0.0,
        Priority::Normal => 1.0,
        Priority::High => 2.0,
        Priority::Urgent => 3.0,
    }
}

fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl Condition {
    fn compile(config: &ConditionConfig, key: &str) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let field = Field::parse(&config.field)
            .ok_or_else(|| invalid(format!("unknown field '{}'", config.field)))?;
        let operator = Operator::parse(&config.operator)
            .ok_or_else(|| invalid(format!("unknown operator '{}'", config.operator)))?;

        let scalar = config.value.as_ref().and_then(yaml_scalar);
        let require = || scalar.clone().ok_or_else(|| invalid("a scalar value is required".into()));

        let matcher = match operator {
            Operator::Exists | Operator::NotExists => Matcher::None,
            Operator::Equals | Operator::Contains | Operator::StartsWith | Operator::EndsWith => {
                Matcher::Text(require()?.to_lowercase())
            }
            Operator::Matches => {
                let pattern = require()?;
                let re = Regex::new(&format!("(?i){pattern}"))
                    .map_err(|e| invalid(format!("invalid regex '{pattern}': {e}")))?;
                Matcher::Regex(re)
            }
            Operator::Glob => {
                let pattern = require()?;
                let glob = GlobBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| invalid(format!("invalid glob '{pattern}': {e}")))?;
                Matcher::Glob(glob.compile_matcher())
            }
            Operator::In | Operator::NotIn => {
                let items: Vec<String> = match config.value {
                    Some(serde_yaml::Value::Sequence(ref seq)) => {
                        seq.iter().filter_map(yaml_scalar).collect()
                    }
                    Some(ref v) => yaml_scalar(v).into_iter().collect(),
                    None => return Err(invalid("a list value is required".into())),
                };
                Matcher::List(items.iter().map(|s| s.to_lowercase()).collect())
            }
            Operator::Gte | Operator::Lte => {
                let raw = require()?;
                let n = parse_number(&raw)
                    .ok_or_else(|| invalid(format!("'{raw}' is not a number or priority")))?;
                Matcher::Number(n)
            }
        };

        Ok(Self {
            field,
            operator,
            matcher,
        })
    }

    fn extract(&self, message: &Message, classification: Option<&ClassificationResult>) -> Option<Value> {
        if self.field.needs_classification() {
            let c = classification?;
            return Some(match self.field {
                Field::Category => Value::Text(c.category.as_str().to_string()),
                Field::Priority => match self.operator {
                    Operator::Gte | Operator::Lte => Value::Number(priority_ordinal(c.priority)),
                    _ => Value::Text(c.priority.as_str().to_string()),
                },
                Field::Confidence => Value::Number(f64::from(c.confidence)),
                _ => Value::Number(c.action_items.len() as f64),
            });
        }

        Some(match self.field {
            Field::Sender => Value::Text(message.sender.clone()),
            Field::To => Value::List(message.recipients.clone()),
            Field::Cc => Value::List(message.cc.clone()),
            Field::Subject => Value::Text(message.subject.clone()),
            Field::Body => Value::Text(message.body.to_text()),
            Field::Folder => Value::Text(message.folder.clone()),
            Field::Account => Value::Text(message.account.clone()),
            Field::Domain => message
                .sender_domain()
                .map_or(Value::Missing, |d| Value::Text(d.to_string())),
            Field::HasAttachments => Value::Bool(!message.attachments.is_empty()),
            Field::AttachmentCount => Value::Number(message.attachments.len() as f64),
            Field::Header(ref name) => message
                .header(name)
                .map_or(Value::Missing, |h| Value::Text(h.to_string())),
            _ => Value::Missing,
        })
    }

    /// Absent data never raises; it just fails to match.
    fn matches(&self, message: &Message, classification: Option<&ClassificationResult>) -> bool {
        let Some(value) = self.extract(message, classification) else {
            return false;
        };

        match self.operator {
            Operator::Exists => return value.truthy(),
            Operator::NotExists => return !value.truthy(),
            _ => {}
        }
        if matches!(value, Value::Missing) {
            return false;
        }

        let texts = value.texts();
        match (&self.operator, &self.matcher) {
            (Operator::Equals, Matcher::Text(want)) => texts.iter().any(|t| t == want),
            (Operator::Contains, Matcher::Text(want)) => texts.iter().any(|t| t.contains(want.as_str())),
            (Operator::StartsWith, Matcher::Text(want)) => {
                texts.iter().any(|t| t.starts_with(want.as_str()))
            }
            (Operator::EndsWith, Matcher::Text(want)) => {
                texts.iter().any(|t| t.ends_with(want.as_str()))
            }
            (Operator::Matches, Matcher::Regex(re)) => texts.iter().any(|t| re.is_match(t)),
            (Operator::Glob, Matcher::Glob(glob)) => texts.iter().any(|t| glob.is_match(t)),
            (Operator::In, Matcher::List(items)) => texts.iter().any(|t| items.contains(t)),
            (Operator::NotIn, Matcher::List(items)) => !texts.iter().any(|t| items.contains(t)),
            (Operator::Gte, Matcher::Number(n)) => value.number().is_some_and(|v| v >= *n),
            (Operator::Lte, Matcher::Number(n)) => value.number().is_some_and(|v| v <= *n),
            _ => false,
        }
    }
}

/// A compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub terminal: bool,
    pub actions: Vec<Action>,
    conditions: Vec<Condition>,
    /// Position in the configuration file, the tie-breaker.
    index: usize,
}

impl Rule {
    pub fn matches(&self, message: &Message, classification: Option<&ClassificationResult>) -> bool {
        self.enabled
            && self
                .conditions
                .iter()
                .all(|c| c.matches(message, classification))
    }

    /// Whether any condition reads classification output.
    pub fn uses_classification(&self) -> bool {
        self.conditions.iter().any(|c| c.field.needs_classification())
    }
}

/// Ordered, immutable rule set.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    /// Compile configured rules. Unknown fields or operators, bad regexes
    /// and duplicate ids are configuration errors.
    pub fn compile(configs: &[RuleConfig]) -> Result<Self, ConfigError> {
        let mut rules: Vec<Rule> = Vec::with_capacity(configs.len());
        for (index, config) in configs.iter().enumerate() {
            if config.id.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: format!("rules[{index}].id"),
                    message: "rule id must not be empty".into(),
                });
            }
            if rules.iter().any(|r| r.id == config.id) {
                return Err(ConfigError::InvalidValue {
                    key: format!("rules.{}", config.id),
                    message: "duplicate rule id".into(),
                });
            }
            let conditions = config
                .conditions
                .iter()
                .enumerate()
                .map(|(i, c)| Condition::compile(c, &format!("rules.{}.conditions[{i}]", config.id)))
                .collect::<Result<Vec<_>, _>>()?;

            rules.push(Rule {
                id: config.id.clone(),
                name: if config.name.is_empty() {
                    config.id.clone()
                } else {
                    config.name.clone()
                },
                priority: config.priority,
                enabled: config.enabled,
                terminal: config.terminal,
                actions: config.actions.clone(),
                conditions,
                index,
            });
        }
        rules.sort_by_key(|r| (r.priority, r.index));
        Ok(Self { rules })
    }

    /// An engine with no rules.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Collect the actions of every matching rule, in evaluation order.
    ///
    /// Pure: identical inputs always yield the identical plan.
    pub fn evaluate(
        &self,
        message: &Message,
        classification: Option<&ClassificationResult>,
    ) -> Vec<PlannedAction> {
        let mut plan = Vec::new();
        for rule in &self.rules {
            if !rule.matches(message, classification) {
                continue;
            }
            debug!(message_id = %message.id, rule = %rule.id, "Rule matched");
            plan.extend(rule.actions.iter().map(|action| PlannedAction {
                rule_id: rule.id.clone(),
                action: action.clone(),
            }));
            if rule.terminal {
                break;
            }
        }
        plan
    }
}

/// Settle conflicting placement actions according to `policy`.
///
/// Non-placement actions are always kept in order.
pub fn resolve(plan: Vec<PlannedAction>, policy: ConflictPolicy) -> Vec<PlannedAction> {
    let placements: Vec<usize> = plan
        .iter()
        .enumerate()
        .filter(|(_, p)| p.action.is_placement())
        .map(|(i, _)| i)
        .collect();

    let keep = match policy {
        ConflictPolicy::ApplyAll => return plan,
        ConflictPolicy::LastWriteWins => placements.last().copied(),
        ConflictPolicy::FirstWins => placements.first().copied(),
    };

    plan.into_iter()
        .enumerate()
        .filter(|(i, p)| !p.action.is_placement() || Some(*i) == keep)
        .map(|(_, p)| p)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::model::{Category, MessageBody};

    fn message() -> Message {
        Message {
            id: "m1".into(),
            account: "work".into(),
            folder: "INBOX".into(),
            source_ref: "1".into(),
            message_id_header: None,
            sender: "Alice <alice@client.example.com>".into(),
            recipients: vec!["me@example.com".into(), "team@example.com".into()],
            cc: vec![],
            subject: "Invoice #42 overdue".into(),
            timestamp: Utc::now(),
            body: MessageBody::plain("Please pay the attached invoice."),
            headers: BTreeMap::from([("list-id".into(), "<news.example.com>".into())]),
            attachments: vec!["invoice.pdf".into()],
        }
    }

    fn classification(category: Category, priority: Priority) -> ClassificationResult {
        ClassificationResult {
            message_id: "m1".into(),
            category,
            priority,
            action_items: vec![],
            confidence: 0.8,
            provider: "stub".into(),
            model: "stub".into(),
            raw_response: String::new(),
        }
    }

    fn engine(yaml: &str) -> RuleEngine {
        let configs: Vec<RuleConfig> = serde_yaml::from_str(yaml).unwrap();
        RuleEngine::compile(&configs).unwrap()
    }

    fn ids(plan: &[PlannedAction]) -> Vec<&str> {
        plan.iter().map(|p| p.rule_id.as_str()).collect()
    }

    #[test]
    fn operators_on_message_fields() {
        let cases = [
            ("from", "contains", "alice@"),
            ("subject", "starts_with", "INVOICE"),
            ("subject", "ends_with", "overdue"),
            ("subject", "matches", r"#\d+"),
            ("domain", "equals", "client.example.com"),
            ("domain", "glob", "*.EXAMPLE.com"),
            ("to", "equals", "team@example.com"),
            ("header.List-Id", "contains", "news"),
            ("body", "contains", "pay the"),
            ("has_attachments", "equals", "true"),
            ("attachment_count", "gte", "1"),
            ("folder", "equals", "inbox"),
        ];
        for (field, op, value) in cases {
            let yaml = format!(
                "- id: r\n  conditions:\n    - field: {field}\n      operator: {op}\n      value: '{value}'\n  actions:\n    - type: delete\n"
            );
            let e = engine(&yaml);
            assert_eq!(e.evaluate(&message(), None).len(), 1, "{field} {op} {value}");
        }
    }

    #[test]
    fn in_and_not_in() {
        let e = engine(
            "- id: a\n  conditions:\n    - {field: account, operator: in, value: [home, WORK]}\n  actions: [{type: delete}]\n- id: b\n  conditions:\n    - {field: account, operator: not_in, value: [work]}\n  actions: [{type: delete}]\n",
        );
        assert_eq!(ids(&e.evaluate(&message(), None)), vec!["a"]);
    }

    #[test]
    fn exists_and_not_exists() {
        let e = engine(
            "- id: a\n  conditions:\n    - {field: header.x-missing, operator: not_exists}\n  actions: [{type: delete}]\n- id: b\n  conditions:\n    - {field: cc, operator: exists}\n  actions: [{type: delete}]\n",
        );
        assert_eq!(ids(&e.evaluate(&message(), None)), vec!["a"]);
    }

    #[test]
    fn no_conditions_always_matches_and_disabled_never() {
        let e = engine(
            "- id: all\n  actions: [{type: notify}]\n- id: off\n  enabled: false\n  actions: [{type: delete}]\n",
        );
        assert_eq!(ids(&e.evaluate(&message(), None)), vec!["all"]);
    }

    #[test]
    fn priority_order_then_declaration_order() {
        let e = engine(
            "- id: late\n  priority: 10\n  actions: [{type: notify}]\n- id: first\n  priority: 1\n  actions: [{type: notify}]\n- id: second\n  priority: 1\n  actions: [{type: notify}]\n",
        );
        assert_eq!(ids(&e.evaluate(&message(), None)), vec!["first", "second", "late"]);
    }

    #[test]
    fn terminal_stops_evaluation() {
        let e = engine(
            "- id: stop\n  priority: 1\n  terminal: true\n  actions: [{type: move, folder: A}]\n- id: never\n  priority: 2\n  actions: [{type: move, folder: B}]\n",
        );
        assert_eq!(ids(&e.evaluate(&message(), None)), vec!["stop"]);
    }

    #[test]
    fn classification_conditions_fail_without_classification() {
        let e = engine(
            "- id: urgent\n  conditions:\n    - {field: classification.priority, operator: equals, value: urgent}\n  actions: [{type: move, folder: Priority}]\n- id: nocat\n  conditions:\n    - {field: classification.category, operator: not_exists}\n  actions: [{type: notify}]\n",
        );
        assert!(e.evaluate(&message(), None).is_empty());

        let c = classification(Category::WorkClients, Priority::Urgent);
        assert_eq!(ids(&e.evaluate(&message(), Some(&c))), vec!["urgent"]);
    }

    #[test]
    fn priority_gte_uses_ordinal() {
        let e = engine(
            "- id: hi\n  conditions:\n    - {field: classification.priority, operator: gte, value: high}\n  actions: [{type: notify}]\n",
        );
        let urgent = classification(Category::Personal, Priority::Urgent);
        let normal = classification(Category::Personal, Priority::Normal);
        assert_eq!(e.evaluate(&message(), Some(&urgent)).len(), 1);
        assert!(e.evaluate(&message(), Some(&normal)).is_empty());
    }

    #[test]
    fn evaluate_is_deterministic() {
        let e = engine(
            "- id: a\n  actions: [{type: tag, tag: x}, {type: move, folder: A}]\n- id: b\n  actions: [{type: move, folder: B}]\n",
        );
        let c = classification(Category::Other, Priority::Low);
        let first = e.evaluate(&message(), Some(&c));
        let second = e.evaluate(&message(), Some(&c));
        assert_eq!(first, second);
    }

    #[test]
    fn conflict_policies() {
        let plan = vec![
            PlannedAction {
                rule_id: "a".into(),
                action: Action::Move { folder: "A".into() },
            },
            PlannedAction {
                rule_id: "a".into(),
                action: Action::Tag { tag: "x".into() },
            },
            PlannedAction {
                rule_id: "b".into(),
                action: Action::Move { folder: "B".into() },
            },
        ];

        let lww = resolve(plan.clone(), ConflictPolicy::LastWriteWins);
        assert_eq!(lww.len(), 2);
        assert_eq!(lww[0].action, Action::Tag { tag: "x".into() });
        assert_eq!(lww[1].action, Action::Move { folder: "B".into() });

        let fw = resolve(plan.clone(), ConflictPolicy::FirstWins);
        assert_eq!(fw[0].action, Action::Move { folder: "A".into() });
        assert_eq!(fw.len(), 2);

        assert_eq!(resolve(plan.clone(), ConflictPolicy::ApplyAll), plan);
    }

    #[test]
    fn compile_errors() {
        for yaml in [
            "- id: r\n  conditions: [{field: nope, operator: equals, value: x}]\n",
            "- id: r\n  conditions: [{field: subject, operator: near, value: x}]\n",
            "- id: r\n  conditions: [{field: subject, operator: matches, value: '('}]\n",
            "- id: r\n  conditions: [{field: subject, operator: equals}]\n",
            "- id: r\n- id: r\n",
        ] {
            let configs: Vec<RuleConfig> = serde_yaml::from_str(yaml).unwrap();
            assert!(
                matches!(
                    RuleEngine::compile(&configs),
                    Err(ConfigError::InvalidValue { .. })
                ),
                "{yaml}"
            );
        }
    }
}
