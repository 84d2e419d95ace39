// Pagekeeper - Client runtime freshness and telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Metric records
//!
//! A [`MetricObservation`] is what the page's metric source reports (a Core
//! Web Vital firing, for instance). The pipeline stamps it with a timestamp
//! and the page context and turns it into an immutable [`MetricRecord`],
//! which is what the remote store receives.

use crate::error::{PagekeeperError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Qualitative rating of a metric value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rating {
    /// Within the recommended threshold
    Good,
    /// Between the recommended and the poor threshold
    NeedsImprovement,
    /// Beyond the poor threshold
    Poor,
}

impl Rating {
    /// Label used on the wire and in exported metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::NeedsImprovement => "needs-improvement",
            Self::Poor => "poor",
        }
    }

    /// Rate a value against the standard Core Web Vitals thresholds
    ///
    /// Returns `None` for metric names without published thresholds.
    pub fn for_metric(name: &str, value: f64) -> Option<Self> {
        let (good, poor) = match name {
            "LCP" => (2500.0, 4000.0),
            "FCP" => (1800.0, 3000.0),
            "INP" => (200.0, 500.0),
            "FID" => (100.0, 300.0),
            "TTFB" => (800.0, 1800.0),
            "CLS" => (0.1, 0.25),
            _ => return None,
        };

        Some(if value <= good {
            Self::Good
        } else if value <= poor {
            Self::NeedsImprovement
        } else {
            Self::Poor
        })
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how the page was running when the metric was observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricContext {
    /// Page path (`/services/pricing`)
    pub path: String,
    /// Deployment environment (`production`, `preview`, ...)
    pub environment: String,
    /// Navigation type reported by the browser (`navigate`, `reload`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation_type: Option<String>,
}

impl MetricContext {
    /// Create a context without a navigation type
    pub fn new(path: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            environment: environment.into(),
            navigation_type: None,
        }
    }
}

/// Raw observation emitted by the page's metric source
#[derive(Debug, Clone, PartialEq)]
pub struct MetricObservation {
    /// Metric name (`LCP`, `CLS`, ...)
    pub name: String,
    /// Observed value
    pub value: f64,
    /// Rating, when the source computes one
    pub rating: Option<Rating>,
    /// Unique id of this observation
    pub id: String,
    /// Navigation type, when known
    pub navigation_type: Option<String>,
}

impl MetricObservation {
    /// Create an observation without rating or navigation type
    pub fn new(name: impl Into<String>, value: f64, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            rating: None,
            id: id.into(),
            navigation_type: None,
        }
    }

    /// Set the rating reported by the source
    pub fn with_rating(mut self, rating: Rating) -> Self {
        self.rating = Some(rating);
        self
    }

    /// Set the navigation type
    pub fn with_navigation_type(mut self, navigation_type: impl Into<String>) -> Self {
        self.navigation_type = Some(navigation_type.into());
        self
    }
}

/// Immutable metric record, as shipped to the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    name: String,
    value: f64,
    rating: Rating,
    id: String,
    timestamp: DateTime<Utc>,
    context: MetricContext,
}

impl MetricRecord {
    /// Build a record from an observation
    ///
    /// Observations without a rating are rated with [`Rating::for_metric`];
    /// metrics without published thresholds must carry their own rating.
    /// The observation's navigation type overrides the one in `context`.
    pub fn from_observation(
        observation: MetricObservation,
        mut context: MetricContext,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        if !observation.value.is_finite() {
            return Err(PagekeeperError::InvalidRecord(format!(
                "{} has non-finite value {}",
                observation.name, observation.value
            )));
        }
        if observation.name.is_empty() {
            return Err(PagekeeperError::InvalidRecord(
                "metric name is empty".to_string(),
            ));
        }

        let rating = observation
            .rating
            .or_else(|| Rating::for_metric(&observation.name, observation.value))
            .ok_or_else(|| {
                PagekeeperError::InvalidRecord(format!(
                    "{} has no rating and no known thresholds",
                    observation.name
                ))
            })?;

        if observation.navigation_type.is_some() {
            context.navigation_type = observation.navigation_type;
        }

        Ok(Self {
            name: observation.name,
            value: observation.value,
            rating,
            id: observation.id,
            timestamp,
            context,
        })
    }

    /// Metric name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metric value
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Rating
    pub fn rating(&self) -> Rating {
        self.rating
    }

    /// Observation id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Observation time
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Page context
    pub fn context(&self) -> &MetricContext {
        &self.context
    }
}
