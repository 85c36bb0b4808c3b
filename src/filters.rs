//! Filter model and the mutable, user-editable filter state.
//!
//! A filter is either literal (compared via its operator/value pair) or
//! fuzzy (its value is matched against the column's distinct contents by a
//! similarity scorer). The fuzzy variant is chosen when the column's
//! catalog category is Enum or Embedding; everything else stays literal.

use serde::{Deserialize, Serialize};

/// Default accepted-match threshold for a freshly extracted fuzzy filter.
pub const DEFAULT_MIN_SIMILARITY: f64 = 0.4;

/// The six comparison tokens the extractor is allowed to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
}

impl Operator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
        }
    }

    /// Ordering operators compare numerically when the value parses as a
    /// number; string comparison would apply lexicographic semantics.
    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le
        )
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// One candidate column value with its similarity score against the
/// filter's current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub value: String,
    pub score: f64,
}

/// Resolution lifecycle of a fuzzy filter's match set. Transitions are
/// strictly Unresolved -> Pending -> Resolved within one resolution cycle;
/// editing the value resets the state to Unresolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatchState {
    Unresolved,
    Pending,
    Resolved(Vec<Match>),
}

/// How a filter is applied: literally via its operator, or through
/// similarity matches against the column's distinct values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Resolution {
    Literal,
    Fuzzy {
        matches: MatchState,
        min_similarity: f64,
        /// Bumped on every value edit; a resolution response carrying a
        /// stale version is discarded instead of overwriting newer state.
        version: u64,
    },
}

impl Resolution {
    pub fn fuzzy() -> Self {
        Resolution::Fuzzy {
            matches: MatchState::Unresolved,
            min_similarity: DEFAULT_MIN_SIMILARITY,
            version: 0,
        }
    }
}

/// A structured constraint derived from one free-text requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub requirement: String,
    pub table: String,
    pub column: String,
    pub operator: Operator,
    pub value: String,
    #[serde(default)]
    pub disabled: bool,
    pub resolution: Resolution,
}

impl Filter {
    /// Accepted matches at the current threshold. A derived view, never
    /// stored: threshold changes must not require a re-fetch.
    pub fn accepted_matches(&self) -> Vec<&Match> {
        match &self.resolution {
            Resolution::Fuzzy {
                matches: MatchState::Resolved(matches),
                min_similarity,
                ..
            } => matches.iter().filter(|m| m.score >= *min_similarity).collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_fuzzy(&self) -> bool {
        matches!(self.resolution, Resolution::Fuzzy { .. })
    }
}

/// Ordered filter set from one extraction cycle. Keyed by sequence order;
/// `(table, column)` is not unique across the set. Replaced wholesale on
/// each successful parse, never merged across cycles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSet {
    pub filters: Vec<Filter>,
}

impl FilterSet {
    pub fn new(filters: Vec<Filter>) -> Self {
        Self { filters }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn get(&self, idx: usize) -> Option<&Filter> {
        self.filters.get(idx)
    }

    /// Enabled filters with their position in the set.
    pub fn enabled(&self) -> impl Iterator<Item = (usize, &Filter)> {
        self.filters.iter().enumerate().filter(|(_, f)| !f.disabled)
    }

    pub fn set_disabled(&mut self, idx: usize, disabled: bool) -> bool {
        match self.filters.get_mut(idx) {
            Some(filter) => {
                filter.disabled = disabled;
                true
            }
            None => false,
        }
    }

    /// Change a filter's value. For fuzzy filters this invalidates the
    /// match set and bumps the resolution version so that any in-flight
    /// resolution against the old value is discarded on arrival.
    pub fn edit_value(&mut self, idx: usize, value: impl Into<String>) -> bool {
        match self.filters.get_mut(idx) {
            Some(filter) => {
                filter.value = value.into();
                if let Resolution::Fuzzy {
                    matches, version, ..
                } = &mut filter.resolution
                {
                    *matches = MatchState::Unresolved;
                    *version += 1;
                }
                true
            }
            None => false,
        }
    }

    /// Adjust the accepted-match threshold. Pure state change: the stored
    /// match set is untouched and nothing is re-fetched.
    pub fn set_min_similarity(&mut self, idx: usize, threshold: f64) -> bool {
        match self.filters.get_mut(idx) {
            Some(Filter {
                resolution:
                    Resolution::Fuzzy {
                        min_similarity, ..
                    },
                ..
            }) => {
                *min_similarity = threshold.clamp(0.0, 1.0);
                true
            }
            _ => false,
        }
    }

    /// One-line-per-filter summary of the enabled filters, used as the
    /// assistant turn when the user asks for an updated filter set.
    pub fn summary(&self) -> String {
        let lines: Vec<String> = self
            .enabled()
            .map(|(_, f)| {
                let applied = if f.is_fuzzy() {
                    let accepted: Vec<&str> =
                        f.accepted_matches().iter().map(|m| m.value.as_str()).collect();
                    format!("matches [{}]", accepted.join(", "))
                } else {
                    format!("{} {}", f.operator, f.value)
                };
                format!(
                    "- {}.{} {} (from: {})",
                    f.table, f.column, applied, f.requirement
                )
            })
            .collect();
        if lines.is_empty() {
            "No filters are currently enabled.".to_string()
        } else {
            format!("Current filters:\n{}", lines.join("\n"))
        }
    }
}
