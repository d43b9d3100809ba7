pub mod cache;
pub mod fingerprint;

use crate::catalog::types::{Kind, Scalar};
use serde::{Deserialize, Serialize};

pub use cache::{
    AnalyticsCache, Aggregator, LruAnalyticsCache, MetaQueryRunner, MetaResult, ResultSource,
};
pub use fingerprint::analytics_hash;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StatisticalAnalysis {
    Count,
    Sum,
    Mean,
    Maximum,
    Minimum,
    Type,
    TopOccurrences,
    TotalTrue,
    TotalFalse,
    PercentageTrue,
    PercentageFalse,
}

/// A property and the statistics requested for it, in request order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetaProperty {
    pub name: String,
    pub statistical_analyses: Vec<StatisticalAnalysis>,
}

impl MetaProperty {
    pub fn new(name: impl Into<String>, statistical_analyses: Vec<StatisticalAnalysis>) -> Self {
        Self {
            name: name.into(),
            statistical_analyses,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ClauseOperator {
    #[default]
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanEqual,
    LessThan,
    LessThanEqual,
    Like,
    And,
    Or,
    Not,
}

/// `Class.property` path, optionally descending through a reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterPath {
    pub class: String,
    pub property: String,
    pub child: Option<Box<FilterPath>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Clause {
    pub operator: ClauseOperator,
    pub on: Option<FilterPath>,
    pub value: Option<Scalar>,
    pub operands: Vec<Clause>,
}

impl Clause {
    pub fn value(value: Scalar) -> Self {
        Self {
            value: Some(value),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalFilter {
    pub root: Clause,
}

/// Execution-strategy knobs. They never change a query's result, so they
/// are excluded from its fingerprint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AnalyticsProps {
    pub use_analytics_engine: bool,
    pub force_recalculate: bool,
}

/// Parameters of an aggregate ("meta") query over one class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetaQuery {
    pub kind: Kind,
    pub class_name: String,
    pub filters: Option<LocalFilter>,
    pub include_meta_count: bool,
    pub properties: Vec<MetaProperty>,
    pub analytics: AnalyticsProps,
}
