//! Threshold ranges for the `threshold_branch` operator.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::ports::is_valid_handle_name;

pub const MIN_RANGES: usize = 2;
pub const MAX_RANGES: usize = 10;

/// One half-open score interval `[min, max)`. `max = None` means unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRange {
    pub min: f64,
    #[serde(default)]
    pub max: Option<f64>,
    pub output: String,
}

impl ThresholdRange {
    pub fn new(min: f64, max: Option<f64>, output: &str) -> Self {
        Self {
            min,
            max,
            output: output.to_string(),
        }
    }

    fn contains(&self, score: f64) -> bool {
        score >= self.min && self.max.map_or(true, |max| score < max)
    }
}

/// A validated, ascending, contiguous and exhaustive set of ranges.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ThresholdRanges(Vec<ThresholdRange>);

impl ThresholdRanges {
    /// Validate a range list. Returns every violated rule.
    pub fn new(ranges: Vec<ThresholdRange>) -> Result<Self, Vec<String>> {
        let mut problems = Vec::new();

        if ranges.len() < MIN_RANGES || ranges.len() > MAX_RANGES {
            problems.push(format!(
                "expected between {} and {} ranges, got {}",
                MIN_RANGES,
                MAX_RANGES,
                ranges.len()
            ));
        }

        let mut seen = HashSet::new();
        for range in &ranges {
            if !range.min.is_finite() || range.max.is_some_and(|m| !m.is_finite()) {
                problems.push(format!("range '{}' has a non-finite bound", range.output));
            }
            if let Some(max) = range.max {
                if max <= range.min {
                    problems.push(format!("range '{}' has max {} <= min {}", range.output, max, range.min));
                }
            }
            if !is_valid_handle_name(&range.output) {
                problems.push(format!("output '{}' must match [a-z0-9_]+", range.output));
            }
            if !seen.insert(range.output.as_str()) {
                problems.push(format!("duplicate output '{}'", range.output));
            }
        }

        for pair in ranges.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if b.min <= a.min {
                problems.push(format!("ranges must be ascending by min ('{}' after '{}')", b.output, a.output));
            }
            match a.max {
                Some(max) if max != b.min => problems.push(format!(
                    "gap or overlap between '{}' (max {}) and '{}' (min {})",
                    a.output, max, b.output, b.min
                )),
                _ => {}
            }
        }

        let unbounded = ranges.iter().filter(|r| r.max.is_none()).count();
        if unbounded != 1 {
            problems.push(format!("exactly one range must have max = null, found {}", unbounded));
        } else if ranges.last().is_some_and(|r| r.max.is_some()) {
            problems.push("the range with max = null must be last".to_string());
        }

        if let Some(first) = ranges.first() {
            if first.min > 0.0 {
                problems.push(format!("first range must start at or below 0, starts at {}", first.min));
            }
        }

        if problems.is_empty() {
            Ok(Self(ranges))
        } else {
            Err(problems)
        }
    }

    /// Default ranges: `[0,30)` low, `[30,60)` medium, `[60,100)` high, `[100,inf)` critical.
    pub fn default_ranges() -> Self {
        Self(vec![
            ThresholdRange::new(0.0, Some(30.0), "low"),
            ThresholdRange::new(30.0, Some(60.0), "medium"),
            ThresholdRange::new(60.0, Some(100.0), "high"),
            ThresholdRange::new(100.0, None, "critical"),
        ])
    }

    /// Output handle of the range containing `score`.
    ///
    /// The first range has no lower floor, so scores below its `min` (negative
    /// scores after score scaling, for instance) route to it. Only NaN has no
    /// range.
    pub fn route(&self, score: f64) -> Option<&str> {
        let first = self.0.first()?;
        if score < first.min {
            return Some(first.output.as_str());
        }
        self.0
            .iter()
            .find(|r| r.contains(score))
            .map(|r| r.output.as_str())
    }

    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|r| r.output.as_str())
    }

    pub fn ranges(&self) -> &[ThresholdRange] {
        &self.0
    }
}
