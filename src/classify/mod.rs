//! Rule-driven classification engine.
//!
//! A [`RuleSet`] is a table of dimensions. Keyword dimensions score each
//! candidate label by summing the weights of the detectors that fire on a
//! [`SignalBag`], capped at 1.0; labels under the dimension threshold are
//! dropped and the rest are ranked. The freshness dimension buckets the
//! days since last activity instead.
//!
//! Evaluation is pure. A dimension whose evaluator fails comes back
//! `Unclassified` without affecting the others.

mod rules;

use thiserror::Error;
use tracing::warn;

use crate::model::{DimensionResult, LabelScore, UNCLASSIFIED};
use crate::signals::{Flag, SignalBag, TextField};

pub use rules::RULESET_VERSION;

pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.3;
pub const DEFAULT_MAX_SECONDARY: usize = 3;

/// Default detector weights per signal kind
pub mod weight {
    pub const TOPIC: f64 = 0.4;
    pub const DESCRIPTION: f64 = 0.35;
    pub const README: f64 = 0.25;
    pub const NAME: f64 = 0.3;
    pub const FILE: f64 = 0.5;
    pub const LANGUAGE: f64 = 0.4;
    pub const STRUCTURAL: f64 = 0.3;
}

/// Threshold comparisons tolerate float summation noise
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("missing signal: {0}")]
    MissingSignal(&'static str),

    #[error("invalid weight {weight} for label '{label}'")]
    InvalidWeight { label: &'static str, weight: f64 },
}

/// A single test against the signal bag
#[derive(Debug, Clone, PartialEq)]
pub enum Detector {
    Topic(&'static str),
    /// Description, or the readme-derived synopsis
    Description(&'static str),
    Readme(&'static str),
    Name(&'static str),
    /// Exact root file name or `*.ext`
    File(&'static str),
    Language(&'static str),
    Flag(Flag),
    /// `at_least <= stars < below`
    Stars { at_least: u64, below: Option<u64> },
    AgeAtLeastDays(i64),
}

impl Detector {
    /// Evidence string when the detector fires
    fn fire(&self, bag: &SignalBag) -> Option<String> {
        let fired = match self {
            Detector::Topic(t) => bag.topics.contains(*t),
            Detector::Description(k) => bag.mentions(TextField::Description, k),
            Detector::Readme(k) => bag.mentions(TextField::Readme, k),
            Detector::Name(k) => bag.mentions(TextField::Name, k),
            Detector::File(pattern) => bag.has_file(pattern),
            Detector::Language(l) => bag.language.as_deref() == Some(*l),
            Detector::Flag(f) => bag.has_flag(*f),
            Detector::Stars { at_least, below } => {
                bag.stars >= *at_least && below.map(|b| bag.stars < b).unwrap_or(true)
            }
            Detector::AgeAtLeastDays(days) => bag.age_days.map(|a| a >= *days).unwrap_or(false),
        };
        fired.then(|| self.evidence())
    }

    fn evidence(&self) -> String {
        match self {
            Detector::Topic(t) => format!("topic:{}", t),
            Detector::Description(k) => format!("description:{}", k),
            Detector::Readme(k) => format!("readme:{}", k),
            Detector::Name(k) => format!("name:{}", k),
            Detector::File(f) => format!("file:{}", f),
            Detector::Language(l) => format!("language:{}", l),
            Detector::Flag(f) => format!("flag:{}", f.name()),
            Detector::Stars { at_least, below: Some(b) } => format!("stars:{}..{}", at_least, b),
            Detector::Stars { at_least, below: None } => format!("stars:>={}", at_least),
            Detector::AgeAtLeastDays(d) => format!("age:>={}d", d),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightedDetector {
    pub detector: Detector,
    pub weight: f64,
}

impl WeightedDetector {
    /// Override the default weight
    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

pub fn topic(t: &'static str) -> WeightedDetector {
    WeightedDetector { detector: Detector::Topic(t), weight: weight::TOPIC }
}

pub fn description(k: &'static str) -> WeightedDetector {
    WeightedDetector { detector: Detector::Description(k), weight: weight::DESCRIPTION }
}

pub fn readme(k: &'static str) -> WeightedDetector {
    WeightedDetector { detector: Detector::Readme(k), weight: weight::README }
}

pub fn name(k: &'static str) -> WeightedDetector {
    WeightedDetector { detector: Detector::Name(k), weight: weight::NAME }
}

pub fn file(pattern: &'static str) -> WeightedDetector {
    WeightedDetector { detector: Detector::File(pattern), weight: weight::FILE }
}

pub fn language(l: &'static str) -> WeightedDetector {
    WeightedDetector { detector: Detector::Language(l), weight: weight::LANGUAGE }
}

pub fn flag(f: Flag) -> WeightedDetector {
    WeightedDetector { detector: Detector::Flag(f), weight: weight::STRUCTURAL }
}

pub fn stars(at_least: u64, below: Option<u64>) -> WeightedDetector {
    WeightedDetector { detector: Detector::Stars { at_least, below }, weight: weight::STRUCTURAL }
}

pub fn age_at_least(days: i64) -> WeightedDetector {
    WeightedDetector { detector: Detector::AgeAtLeastDays(days), weight: weight::STRUCTURAL }
}

/// Topic, description and readme detectors for each keyword
pub fn keywords(words: &[&'static str]) -> Vec<WeightedDetector> {
    words
        .iter()
        .flat_map(|&w| [topic(w), description(w), readme(w)])
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelRule {
    pub label: &'static str,
    pub detectors: Vec<WeightedDetector>,
}

pub fn label(label: &'static str, detectors: Vec<WeightedDetector>) -> LabelRule {
    LabelRule { label, detectors }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Single,
    Multi,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeywordDimension {
    pub labels: Vec<LabelRule>,
    pub cardinality: Cardinality,
    pub min_confidence: f64,
    pub max_secondary: usize,
}

/// Buckets on days since last push
#[derive(Debug, Clone, PartialEq)]
pub struct FreshnessDimension {
    /// `(max_days_inclusive, label)`, ascending
    pub breakpoints: Vec<(i64, &'static str)>,
    /// Label beyond the last breakpoint
    pub beyond: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DimensionKind {
    Keyword(KeywordDimension),
    Freshness(FreshnessDimension),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub name: &'static str,
    pub kind: DimensionKind,
}

impl Dimension {
    pub fn single(name: &'static str, labels: Vec<LabelRule>) -> Self {
        Self::keyword(name, Cardinality::Single, labels)
    }

    pub fn multi(name: &'static str, labels: Vec<LabelRule>) -> Self {
        Self::keyword(name, Cardinality::Multi, labels)
    }

    fn keyword(name: &'static str, cardinality: Cardinality, labels: Vec<LabelRule>) -> Self {
        Self {
            name,
            kind: DimensionKind::Keyword(KeywordDimension {
                labels,
                cardinality,
                min_confidence: DEFAULT_MIN_CONFIDENCE,
                max_secondary: DEFAULT_MAX_SECONDARY,
            }),
        }
    }

    pub fn with_max_secondary(mut self, max: usize) -> Self {
        if let DimensionKind::Keyword(k) = &mut self.kind {
            k.max_secondary = max;
        }
        self
    }

    pub fn evaluate(&self, bag: &SignalBag) -> Result<DimensionResult, EvalError> {
        match &self.kind {
            DimensionKind::Keyword(k) => evaluate_keyword(self.name, k, bag),
            DimensionKind::Freshness(f) => evaluate_freshness(self.name, f, bag),
        }
    }
}

struct Scored {
    label: &'static str,
    score: f64,
    evidence: Vec<String>,
}

fn evaluate_keyword(
    dimension: &str,
    keyword: &KeywordDimension,
    bag: &SignalBag,
) -> Result<DimensionResult, EvalError> {
    let mut scored = Vec::with_capacity(keyword.labels.len());

    for rule in &keyword.labels {
        let mut score = 0.0;
        let mut evidence = Vec::new();
        for wd in &rule.detectors {
            if !(0.0..=1.0).contains(&wd.weight) {
                return Err(EvalError::InvalidWeight { label: rule.label, weight: wd.weight });
            }
            if let Some(ev) = wd.detector.fire(bag) {
                score += wd.weight;
                evidence.push(ev);
            }
        }
        let score = f64::min(score, 1.0);
        if score + EPSILON >= keyword.min_confidence && score > 0.0 {
            scored.push(Scored { label: rule.label, score, evidence });
        }
    }

    // Stable: equal scores keep declaration order
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut ranked = scored.into_iter();
    let Some(primary) = ranked.next() else {
        return Ok(DimensionResult::unclassified(dimension));
    };

    let secondary: Vec<Scored> = match keyword.cardinality {
        Cardinality::Single => Vec::new(),
        Cardinality::Multi => ranked.take(keyword.max_secondary).collect(),
    };

    let mut evidence = primary.evidence;
    for s in &secondary {
        for ev in &s.evidence {
            if !evidence.contains(ev) {
                evidence.push(ev.clone());
            }
        }
    }

    Ok(DimensionResult {
        dimension: dimension.to_string(),
        primary_label: primary.label.to_string(),
        primary_confidence: round3(primary.score),
        secondary_labels: secondary
            .iter()
            .map(|s| LabelScore { label: s.label.to_string(), confidence: round3(s.score) })
            .collect(),
        evidence,
    })
}

fn evaluate_freshness(
    dimension: &str,
    freshness: &FreshnessDimension,
    bag: &SignalBag,
) -> Result<DimensionResult, EvalError> {
    let days = bag
        .days_since_activity
        .ok_or(EvalError::MissingSignal("pushed_at"))?;

    let bucket = freshness
        .breakpoints
        .iter()
        .find(|(max, _)| days <= *max)
        .map(|(_, label)| *label)
        .unwrap_or(freshness.beyond);

    Ok(DimensionResult {
        dimension: dimension.to_string(),
        primary_label: bucket.to_string(),
        primary_confidence: 1.0,
        secondary_labels: Vec::new(),
        evidence: vec![format!("days_since_activity:{}", days)],
    })
}

/// Confidences are reported to three decimals
fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// An ordered table of dimensions with a version tag
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    pub version: &'static str,
    pub dimensions: Vec<Dimension>,
}

impl RuleSet {
    pub fn dimension_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.dimensions.iter().map(|d| d.name)
    }

    /// One result per dimension in declaration order
    pub fn classify(&self, bag: &SignalBag) -> Vec<DimensionResult> {
        self.dimensions
            .iter()
            .map(|dim| match dim.evaluate(bag) {
                Ok(result) => result,
                Err(e) => {
                    warn!(id = %bag.id, dimension = dim.name, error = %e, "dimension degraded to {}", UNCLASSIFIED);
                    DimensionResult::unclassified(dim.name)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::extract;
    use crate::testing::{fixed_now, record, set};

    fn service_dimension() -> Dimension {
        Dimension::multi(
            "services",
            vec![
                label("Lambda", vec![topic("lambda")]),
                label("Serverless", vec![topic("serverless").weight(0.3)]),
                label("S3", vec![topic("s3")]),
            ],
        )
    }

    #[test]
    fn test_primary_and_secondary_by_score() {
        let mut r = record("org/x");
        r.topics = set(&["lambda", "serverless"]);
        let result = service_dimension().evaluate(&extract(&r)).unwrap();

        assert_eq!(result.primary_label, "Lambda");
        assert_eq!(result.primary_confidence, 0.4);
        assert_eq!(
            result.secondary_labels,
            vec![LabelScore { label: "Serverless".into(), confidence: 0.3 }]
        );
        assert_eq!(result.evidence, vec!["topic:lambda", "topic:serverless"]);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let dim = Dimension::single("d", vec![label("A", vec![topic("a").weight(0.3)])]);
        let mut r = record("org/x");
        r.topics = set(&["a"]);
        assert_eq!(dim.evaluate(&extract(&r)).unwrap().primary_label, "A");

        let dim = Dimension::single("d", vec![label("A", vec![topic("a").weight(0.29)])]);
        assert!(!dim.evaluate(&extract(&r)).unwrap().is_classified());
    }

    #[test]
    fn test_confidence_saturates() {
        let dim = Dimension::single(
            "d",
            vec![label(
                "A",
                vec![topic("a").weight(0.9), topic("b").weight(0.9), description("alpha")],
            )],
        );
        let mut r = record("org/x");
        r.topics = set(&["a", "b"]);
        r.description = Some("alpha".into());

        let result = dim.evaluate(&extract(&r)).unwrap();
        assert_eq!(result.primary_confidence, 1.0);
    }

    #[test]
    fn test_ties_keep_declaration_order() {
        let dim = Dimension::multi(
            "d",
            vec![label("First", vec![topic("x")]), label("Second", vec![topic("x")])],
        );
        let mut r = record("org/x");
        r.topics = set(&["x"]);

        let result = dim.evaluate(&extract(&r)).unwrap();
        assert_eq!(result.primary_label, "First");
        assert_eq!(result.secondary_labels[0].label, "Second");
    }

    #[test]
    fn test_single_cardinality_drops_secondary() {
        let dim = Dimension::single(
            "d",
            vec![label("A", vec![topic("x")]), label("B", vec![topic("x")])],
        );
        let mut r = record("org/x");
        r.topics = set(&["x"]);
        assert!(dim.evaluate(&extract(&r)).unwrap().secondary_labels.is_empty());
    }

    #[test]
    fn test_max_secondary() {
        let dim = Dimension::multi(
            "d",
            vec![
                label("A", vec![topic("x")]),
                label("B", vec![topic("x")]),
                label("C", vec![topic("x")]),
            ],
        )
        .with_max_secondary(1);
        let mut r = record("org/x");
        r.topics = set(&["x"]);
        assert_eq!(dim.evaluate(&extract(&r)).unwrap().secondary_labels.len(), 1);
    }

    #[test]
    fn test_freshness_buckets() {
        let rules = RuleSet::builtin();
        let freshness = rules.dimensions.iter().find(|d| d.name == "freshness").unwrap();

        for (days, expected) in [(0, "Active"), (89, "Active"), (90, "Maintained"), (365, "Maintained"), (366, "Aging"), (731, "Dormant")] {
            let mut r = record("org/x");
            r.pushed_at = Some(fixed_now() - chrono::Duration::days(days));
            let result = freshness.evaluate(&extract(&r)).unwrap();
            assert_eq!(result.primary_label, expected, "days = {}", days);
            assert_eq!(result.primary_confidence, 1.0);
        }
    }

    #[test]
    fn test_failing_dimension_is_isolated() {
        let rules = RuleSet {
            version: "test",
            dimensions: vec![
                Dimension::single("broken", vec![label("A", vec![topic("x").weight(1.5)])]),
                Dimension {
                    name: "freshness",
                    kind: DimensionKind::Freshness(FreshnessDimension {
                        breakpoints: vec![(30, "Fresh")],
                        beyond: "Stale",
                    }),
                },
                Dimension::single("ok", vec![label("X", vec![topic("x")])]),
            ],
        };
        let mut r = record("org/x");
        r.topics = set(&["x"]);

        // No pushed_at and an invalid weight: both degrade, the third still works
        let results = rules.classify(&extract(&r));
        assert_eq!(results.len(), 3);
        assert!(!results[0].is_classified());
        assert!(!results[1].is_classified());
        assert_eq!(results[2].primary_label, "X");
    }

    #[test]
    fn test_builtin_covers_every_dimension() {
        let rules = RuleSet::builtin();
        let mut r = record("org/my-cool-tool");
        r.pushed_at = Some(fixed_now());

        let results = rules.classify(&extract(&r));
        assert_eq!(results.len(), 20);
        let names: Vec<_> = results.iter().map(|d| d.dimension.as_str()).collect();
        let expected: Vec<_> = rules.dimension_names().collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let rules = RuleSet::builtin();
        let mut r = record("org/bedrock-agent-starter");
        r.description = Some("Starter kit for a Bedrock agent with Lambda and DynamoDB".into());
        r.topics = set(&["aws-cdk", "genai"]);
        r.file_hints = set(&["cdk.json", "package.json"]);
        r.language = Some("TypeScript".into());
        r.pushed_at = Some(fixed_now() - chrono::Duration::days(3));

        let bag = extract(&r);
        assert_eq!(rules.classify(&bag), rules.classify(&bag));
    }
}
