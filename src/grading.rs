use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const PASS_MARK: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GradeBadge {
    Excellent,
    Good,
    Average,
    NeedsImprovement,
    NotAvailable,
}

impl GradeBadge {
    /// Scored bands, highest first. `NotAvailable` is reserved for missing scores.
    pub const BANDS: [GradeBadge; 4] = [
        GradeBadge::Excellent,
        GradeBadge::Good,
        GradeBadge::Average,
        GradeBadge::NeedsImprovement,
    ];

    pub fn label(self) -> &'static str {
        match self {
            GradeBadge::Excellent => "Excellent",
            GradeBadge::Good => "Good",
            GradeBadge::Average => "Average",
            GradeBadge::NeedsImprovement => "Needs Improvement",
            GradeBadge::NotAvailable => "N/A",
        }
    }

    pub fn tone(self) -> &'static str {
        match self {
            GradeBadge::Excellent => "success",
            GradeBadge::Good => "info",
            GradeBadge::Average => "warning",
            GradeBadge::NeedsImprovement => "danger",
            GradeBadge::NotAvailable => "muted",
        }
    }

    /// Inclusive lower bound of the band, in percent.
    pub fn min_percent(self) -> Option<f64> {
        match self {
            GradeBadge::Excellent => Some(90.0),
            GradeBadge::Good => Some(75.0),
            GradeBadge::Average => Some(PASS_MARK),
            GradeBadge::NeedsImprovement => Some(0.0),
            GradeBadge::NotAvailable => None,
        }
    }
}

/// Band for a percentage. Values outside 0..=100 are clamped; missing or NaN is N/A.
pub fn grade_badge(percent: Option<f64>) -> GradeBadge {
    let Some(p) = percent.filter(|p| !p.is_nan()) else {
        return GradeBadge::NotAvailable;
    };
    let p = p.clamp(0.0, 100.0);
    GradeBadge::BANDS
        .into_iter()
        .find(|b| b.min_percent().is_some_and(|min| p >= min))
        .unwrap_or(GradeBadge::NeedsImprovement)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeView {
    pub badge: GradeBadge,
    pub label: &'static str,
    pub tone: &'static str,
}

impl From<GradeBadge> for BadgeView {
    fn from(badge: GradeBadge) -> Self {
        Self {
            badge,
            label: badge.label(),
            tone: badge.tone(),
        }
    }
}

pub fn badge_view(percent: Option<f64>) -> BadgeView {
    grade_badge(percent).into()
}

/// `Int(10*x + 0.5) / 10`, the one-decimal rounding used on report screens.
pub fn round_1(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

pub fn percentage(score: Option<f64>, max_score: f64) -> Option<f64> {
    let s = score?;
    if max_score.is_nan() || max_score <= 0.0 || s.is_nan() {
        return None;
    }
    Some(100.0 * s / max_score)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandDistribution {
    pub excellent: usize,
    pub good: usize,
    pub average: usize,
    pub needs_improvement: usize,
    pub not_available: usize,
}

impl BandDistribution {
    pub fn add(&mut self, badge: GradeBadge) {
        match badge {
            GradeBadge::Excellent => self.excellent += 1,
            GradeBadge::Good => self.good += 1,
            GradeBadge::Average => self.average += 1,
            GradeBadge::NeedsImprovement => self.needs_improvement += 1,
            GradeBadge::NotAvailable => self.not_available += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSummary {
    pub count: usize,
    pub missing: usize,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub pass_count: usize,
    pub distribution: BandDistribution,
}

/// Summary over percentages. Missing entries are counted but excluded from the statistics.
pub fn summarize<I>(scores: I) -> ScoreSummary
where
    I: IntoIterator<Item = Option<f64>>,
{
    let mut summary = ScoreSummary::default();
    let mut values: Vec<f64> = Vec::new();
    for s in scores {
        summary.distribution.add(grade_badge(s));
        match s.filter(|v| !v.is_nan()) {
            Some(v) => values.push(v),
            None => summary.missing += 1,
        }
    }
    if values.is_empty() {
        return summary;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let n = values.len();
    summary.count = n;
    summary.mean = Some(values.iter().sum::<f64>() / n as f64);
    summary.median = Some(if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    });
    summary.min = values.first().copied();
    summary.max = values.last().copied();
    summary.pass_count = values.iter().filter(|v| **v >= PASS_MARK).count();
    summary
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}
