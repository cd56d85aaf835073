//! Aggregate functions and their partial states
//!
//! Every function follows the same contract:
//! - `seed`: the empty state
//! - `accumulate`: fold one row into a state
//! - `combine`: merge two states of the same function
//! - `finalize`: turn a state into the result value
//!
//! `combine` is associative and commutative, so partial states computed over
//! disjoint row sets can be merged in any order. Missing values are ignored.

use crate::aggregate::error::{AggregateError, AggregateResult};
use crate::storage::Event;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// How `first`/`last` break ties between rows with equal timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Lower ingestion sequence is earlier
    #[default]
    Ingestion,
    /// Smaller value is earlier
    Value,
}

/// The closed set of aggregate functions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggFunc {
    Sum(String),
    /// `None` counts rows (`count(*)`)
    Count(Option<String>),
    Min(String),
    Max(String),
    First(String),
    Last(String),
    Avg(String),
}

impl AggFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggFunc::Sum(_) => "sum",
            AggFunc::Count(_) => "count",
            AggFunc::Min(_) => "min",
            AggFunc::Max(_) => "max",
            AggFunc::First(_) => "first",
            AggFunc::Last(_) => "last",
            AggFunc::Avg(_) => "avg",
        }
    }

    /// Input column, `None` for `count(*)`
    pub fn column(&self) -> Option<&str> {
        match self {
            AggFunc::Count(column) => column.as_deref(),
            AggFunc::Sum(c)
            | AggFunc::Min(c)
            | AggFunc::Max(c)
            | AggFunc::First(c)
            | AggFunc::Last(c)
            | AggFunc::Avg(c) => Some(c),
        }
    }

    /// Output name used when no alias is given
    pub fn default_alias(&self) -> String {
        match self.column() {
            Some(column) => format!("{}_{}", self.name(), column),
            None => self.name().to_string(),
        }
    }

    /// Empty state for this function
    pub fn seed(&self) -> AggState {
        match self {
            AggFunc::Sum(_) => AggState::Sum(None),
            AggFunc::Count(_) => AggState::Count(0),
            AggFunc::Min(_) => AggState::Min(None),
            AggFunc::Max(_) => AggState::Max(None),
            AggFunc::First(_) => AggState::First(None),
            AggFunc::Last(_) => AggState::Last(None),
            AggFunc::Avg(_) => AggState::Avg { sum: 0.0, count: 0 },
        }
    }
}

impl std::fmt::Display for AggFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.column().unwrap_or("*"))
    }
}

/// An aggregate function with its output name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateExpr {
    pub func: AggFunc,
    pub alias: String,
}

impl AggregateExpr {
    pub fn new(func: AggFunc) -> Self {
        let alias = func.default_alias();
        Self { func, alias }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }
}

impl std::fmt::Display for AggregateExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} as {}", self.func, self.alias)
    }
}

/// A candidate row for `first`/`last`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pick {
    pub ts: i64,
    pub seq: u64,
    pub value: f64,
}

impl Pick {
    /// Total order of candidates under a tie-break policy
    fn cmp_with(&self, other: &Pick, tie: TieBreak) -> Ordering {
        let by_time = self.ts.cmp(&other.ts);
        match tie {
            TieBreak::Ingestion => by_time.then(self.seq.cmp(&other.seq)),
            TieBreak::Value => by_time
                .then(self.value.total_cmp(&other.value))
                .then(self.seq.cmp(&other.seq)),
        }
    }
}

/// Keep whichever pick comes first (or last) in the tie-break order
fn choose(current: &mut Option<Pick>, candidate: Pick, want: Ordering, tie: TieBreak) {
    match current {
        Some(existing) if candidate.cmp_with(existing, tie) != want => {}
        _ => *current = Some(candidate),
    }
}

/// Partial aggregate state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggState {
    Sum(Option<f64>),
    Count(u64),
    Min(Option<f64>),
    Max(Option<f64>),
    First(Option<Pick>),
    Last(Option<Pick>),
    Avg { sum: f64, count: u64 },
}

impl AggState {
    /// Fold one row into the state
    pub fn accumulate(&mut self, func: &AggFunc, event: &Event, tie: TieBreak) {
        let value = func.column().and_then(|c| event.numeric(c));

        match (self, value) {
            (AggState::Count(n), _) if func.column().is_none() => *n += 1,
            (AggState::Count(n), Some(_)) => *n += 1,
            (AggState::Sum(sum), Some(v)) => *sum = Some(sum.unwrap_or(0.0) + v),
            (AggState::Min(min), Some(v)) => *min = Some(min.map_or(v, |m| m.min(v))),
            (AggState::Max(max), Some(v)) => *max = Some(max.map_or(v, |m| m.max(v))),
            (AggState::First(pick), Some(v)) => choose(
                pick,
                Pick {
                    ts: event.timestamp,
                    seq: event.seq,
                    value: v,
                },
                Ordering::Less,
                tie,
            ),
            (AggState::Last(pick), Some(v)) => choose(
                pick,
                Pick {
                    ts: event.timestamp,
                    seq: event.seq,
                    value: v,
                },
                Ordering::Greater,
                tie,
            ),
            (AggState::Avg { sum, count }, Some(v)) => {
                *sum += v;
                *count += 1;
            }
            _ => {}
        }
    }

    /// Merge another partial state of the same function
    pub fn combine(&mut self, other: &AggState, tie: TieBreak) -> AggregateResult<()> {
        match (self, other) {
            (AggState::Sum(a), AggState::Sum(b)) => {
                if let Some(b) = b {
                    *a = Some(a.unwrap_or(0.0) + b);
                }
            }
            (AggState::Count(a), AggState::Count(b)) => *a += b,
            (AggState::Min(a), AggState::Min(b)) => {
                if let Some(b) = b {
                    *a = Some(a.map_or(*b, |m| m.min(*b)));
                }
            }
            (AggState::Max(a), AggState::Max(b)) => {
                if let Some(b) = b {
                    *a = Some(a.map_or(*b, |m| m.max(*b)));
                }
            }
            (AggState::First(a), AggState::First(b)) => {
                if let Some(b) = b {
                    choose(a, *b, Ordering::Less, tie);
                }
            }
            (AggState::Last(a), AggState::Last(b)) => {
                if let Some(b) = b {
                    choose(a, *b, Ordering::Greater, tie);
                }
            }
            (AggState::Avg { sum, count }, AggState::Avg { sum: s, count: c }) => {
                *sum += s;
                *count += c;
            }
            (a, b) => {
                return Err(AggregateError::StateMismatch(format!(
                    "cannot combine {:?} with {:?}",
                    a, b
                )))
            }
        }
        Ok(())
    }

    /// Result value, `None` when no non-null input was seen
    pub fn finalize(&self) -> Option<f64> {
        match self {
            AggState::Sum(v) | AggState::Min(v) | AggState::Max(v) => *v,
            AggState::Count(n) => Some(*n as f64),
            AggState::First(p) | AggState::Last(p) => p.map(|p| p.value),
            AggState::Avg { count: 0, .. } => None,
            AggState::Avg { sum, count } => Some(sum / *count as f64),
        }
    }

    /// Check the state belongs to the given function
    pub fn matches(&self, func: &AggFunc) -> bool {
        matches!(
            (self, func),
            (AggState::Sum(_), AggFunc::Sum(_))
                | (AggState::Count(_), AggFunc::Count(_))
                | (AggState::Min(_), AggFunc::Min(_))
                | (AggState::Max(_), AggFunc::Max(_))
                | (AggState::First(_), AggFunc::First(_))
                | (AggState::Last(_), AggFunc::Last(_))
                | (AggState::Avg { .. }, AggFunc::Avg(_))
        )
    }
}
