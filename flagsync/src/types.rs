use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

pub type ChangeNumber = i64;

/// Watermark of a cache that has never been synchronized.
pub const UNSYNCED: ChangeNumber = -1;

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    #[default]
    Active,
    Archived,
}

/// A feature flag definition.
///
/// Only the fields needed for change-number reconciliation, segment discovery and
/// the kill/prerequisite short-circuits are interpreted here. Matchers keep the rest
/// of their payload untouched for the evaluator.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Split {
    pub name: String,
    #[serde(default)]
    pub traffic_type_name: Option<String>,
    pub change_number: ChangeNumber,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub killed: bool,
    pub default_treatment: String,
    #[serde(default)]
    pub traffic_allocation: Option<u32>,
    #[serde(default)]
    pub traffic_allocation_seed: Option<i64>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub algo: Option<i32>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub configurations: Option<HashMap<String, String>>,
    #[serde(default)]
    pub sets: Option<BTreeSet<String>>,
    #[serde(default)]
    pub prerequisites: Option<Vec<Prerequisite>>,
    #[serde(default)]
    pub impressions_disabled: bool,
}

/// A prerequisite flag and the treatments it must evaluate to.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Prerequisite {
    #[serde(rename = "n")]
    pub flag_name: String,
    #[serde(rename = "ts")]
    pub treatments: Vec<String>,
}

/// A segment defined by matcher conditions rather than explicit membership.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleBasedSegment {
    pub name: String,
    #[serde(default)]
    pub traffic_type_name: Option<String>,
    pub change_number: ChangeNumber,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub excluded: Excluded,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Excluded {
    #[serde(default)]
    pub keys: Option<Vec<String>>,
    #[serde(default)]
    pub segments: Option<Vec<ExcludedSegment>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ExcludedSegment {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExcludedSegmentKind,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ExcludedSegmentKind {
    Standard,
    RuleBased,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default)]
    pub condition_type: Option<String>,
    pub matcher_group: MatcherGroup,
    #[serde(default)]
    pub partitions: Vec<Partition>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MatcherGroup {
    #[serde(default)]
    pub combiner: Option<String>,
    #[serde(default)]
    pub matchers: Vec<Matcher>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Matcher {
    pub matcher_type: String,
    #[serde(default)]
    pub negate: bool,
    #[serde(default)]
    pub user_defined_segment_matcher_data: Option<SegmentMatcherData>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMatcherData {
    pub segment_name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Partition {
    pub treatment: String,
    pub size: u32,
}

const IN_SEGMENT: &str = "IN_SEGMENT";
const IN_RULE_BASED_SEGMENT: &str = "IN_RULE_BASED_SEGMENT";

fn matcher_references<'a>(
    conditions: &'a [Condition],
    matcher_type: &'a str,
) -> impl Iterator<Item = &'a str> + 'a {
    conditions
        .iter()
        .flat_map(|c| c.matcher_group.matchers.iter())
        .filter(move |m| m.matcher_type == matcher_type)
        .filter_map(|m| m.user_defined_segment_matcher_data.as_ref())
        .map(|d| d.segment_name.as_str())
}

/// Common view over cached rule sets.
pub trait RuleEntity: Clone + Send + Sync + 'static {
    fn name(&self) -> &str;
    fn change_number(&self) -> ChangeNumber;
    fn status(&self) -> Status;

    /// Standard segments this entity needs to be evaluated.
    fn segment_names(&self) -> BTreeSet<String>;
}

impl RuleEntity for Split {
    fn name(&self) -> &str {
        &self.name
    }

    fn change_number(&self) -> ChangeNumber {
        self.change_number
    }

    fn status(&self) -> Status {
        self.status
    }

    fn segment_names(&self) -> BTreeSet<String> {
        matcher_references(&self.conditions, IN_SEGMENT)
            .map(String::from)
            .collect()
    }
}

impl Split {
    /// Rule-based segments referenced by this flag's conditions.
    pub fn rule_based_segment_names(&self) -> BTreeSet<String> {
        matcher_references(&self.conditions, IN_RULE_BASED_SEGMENT)
            .map(String::from)
            .collect()
    }

    /// Whether this flag belongs to at least one of the given sets.
    /// An empty filter keeps every flag.
    pub fn matches_flag_sets(&self, filter: &BTreeSet<String>) -> bool {
        if filter.is_empty() {
            return true;
        }
        self.sets
            .as_ref()
            .is_some_and(|sets| sets.iter().any(|s| filter.contains(s)))
    }
}

impl RuleEntity for RuleBasedSegment {
    fn name(&self) -> &str {
        &self.name
    }

    fn change_number(&self) -> ChangeNumber {
        self.change_number
    }

    fn status(&self) -> Status {
        self.status
    }

    fn segment_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = matcher_references(&self.conditions, IN_SEGMENT)
            .map(String::from)
            .collect();

        if let Some(excluded) = &self.excluded.segments {
            names.extend(
                excluded
                    .iter()
                    .filter(|s| s.kind == ExcludedSegmentKind::Standard)
                    .map(|s| s.name.clone()),
            );
        }
        names
    }
}

/// Changes to one rule cache between two watermarks.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RuleChangesPage<T> {
    #[serde(alias = "s")]
    pub since: ChangeNumber,
    #[serde(alias = "t")]
    pub till: ChangeNumber,
    #[serde(alias = "d", default = "Vec::new")]
    pub data: Vec<T>,
}

/// Response of `GET /splitChanges`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RuleChanges {
    pub ff: RuleChangesPage<Split>,
    pub rbs: RuleChangesPage<RuleBasedSegment>,
}

/// Response of `GET /segmentChanges/{name}`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SegmentChanges {
    #[serde(default)]
    pub name: String,
    pub since: ChangeNumber,
    pub till: ChangeNumber,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}
