use crate::config::RouterConfig;
use crate::models::{KnowledgeMode, QuestionLabel, RetrievalMetrics, Route, RouteDecision};
use serde::Serialize;
use std::collections::BTreeMap;

/// Maps a classifier label and retrieval metrics to a route.
///
/// | density | diversity | label | route |
/// |---|---|---|---|
/// | high | any | GRAMMAR or UNKNOWN | CORPUS |
/// | low | any | LITERATURE | GENERAL |
/// | medium | >= min or label HYBRID | any | HYBRID |
/// | low | any | GRAMMAR | CORPUS, degraded |
///
/// Anything else is HYBRID with degraded confidence. Low density with an
/// UNKNOWN label also asks the learner to clarify.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeRouter {
    config: RouterConfig,
}

impl KnowledgeRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn decide(
        &self,
        label: QuestionLabel,
        metrics: RetrievalMetrics,
        mode: KnowledgeMode,
    ) -> RouteDecision {
        if let Some(route) = mode.forced_route() {
            return RouteDecision {
                route,
                confidence: 1.0,
                metrics,
                label,
                overridden: true,
                needs_clarification: false,
                explanation: format!("{route} requested explicitly"),
            };
        }

        let config = &self.config;
        let support = self.corpus_support(&metrics);
        let high = metrics.density >= config.high_density;
        let low = metrics.density < config.low_density;
        let medium = !high && !low;
        let diverse = metrics.diversity >= config.min_diversity;

        let (route, confidence, explanation) = match label {
            QuestionLabel::Grammar | QuestionLabel::Unknown if high => (
                Route::Corpus,
                support,
                format!(
                    "strong corpus hits (density {:.2}) for a {label} question",
                    metrics.density
                ),
            ),
            QuestionLabel::Literature if low => (
                Route::General,
                1.0 - support,
                format!(
                    "little corpus coverage (density {:.2}) for a literature question",
                    metrics.density
                ),
            ),
            _ if medium && (diverse || label == QuestionLabel::Hybrid) => (
                Route::Hybrid,
                support,
                format!(
                    "medium corpus coverage (density {:.2}, {} sources)",
                    metrics.density, metrics.diversity
                ),
            ),
            QuestionLabel::Grammar if low => (
                Route::Corpus,
                support * config.degraded_factor,
                format!(
                    "grammar question with weak corpus coverage (density {:.2}), answering from the corpus anyway",
                    metrics.density
                ),
            ),
            _ => (
                Route::Hybrid,
                support * config.degraded_factor,
                format!(
                    "unclear signals (density {:.2}, label {label}), combining corpus and general knowledge",
                    metrics.density
                ),
            ),
        };

        let needs_clarification = low && label == QuestionLabel::Unknown;
        tracing::debug!(
            %route,
            confidence,
            %label,
            density = metrics.density,
            diversity = metrics.diversity,
            "route decided"
        );

        RouteDecision {
            route,
            confidence: confidence.clamp(0.0, 1.0),
            metrics,
            label,
            overridden: false,
            needs_clarification,
            explanation,
        }
    }

    /// Weighted combination of density and saturated diversity, in [0, 1].
    fn corpus_support(&self, metrics: &RetrievalMetrics) -> f32 {
        let config = &self.config;
        let saturation = config.diversity_saturation.max(1);
        let diversity = metrics.diversity.min(saturation) as f32 / saturation as f32;
        let total_weight = config.density_weight + config.diversity_weight;
        if total_weight <= 0.0 {
            return 0.0;
        }
        ((config.density_weight * metrics.density + config.diversity_weight * diversity)
            / total_weight)
            .clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RoutingStats {
    pub total: u64,
    pub per_route: BTreeMap<Route, u64>,
    pub overridden: u64,
    pub clarifications: u64,
    #[serde(skip)]
    confidence_sum: f64,
}

impl RoutingStats {
    pub fn record(&mut self, decision: &RouteDecision) {
        self.total += 1;
        *self.per_route.entry(decision.route).or_insert(0) += 1;
        if decision.overridden {
            self.overridden += 1;
        }
        if decision.needs_clarification {
            self.clarifications += 1;
        }
        self.confidence_sum += f64::from(decision.confidence);
    }

    pub fn average_confidence(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.confidence_sum / self.total as f64
        }
    }

    /// Share of queries per route, as percentages.
    pub fn route_percentages(&self) -> BTreeMap<Route, f64> {
        self.per_route
            .iter()
            .map(|(route, count)| (*route, *count as f64 * 100.0 / self.total.max(1) as f64))
            .collect()
    }
}
