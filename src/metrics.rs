use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::decider::Decision;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub operation: String,
    pub resource: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    pub result: &'static str,
    pub reason: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResponseLabels {
    pub allowed: &'static str,
}

pub struct InjectorMetrics {
    pub admission_requests_total: Family<RequestLabels, Counter>,
    pub decisions_total: Family<DecisionLabels, Counter>,
    pub admission_responses_total: Family<ResponseLabels, Counter>,
    pub admission_request_duration_seconds: Histogram,
}

const DURATION_BUCKETS: [f64; 14] = [
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

impl InjectorMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let admission_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "injector_admission_requests",
            "Total number of admission requests received",
            admission_requests_total.clone(),
        );

        let decisions_total = Family::<DecisionLabels, Counter>::default();
        registry.register(
            "injector_decisions",
            "Injection decisions by result and skip reason",
            decisions_total.clone(),
        );

        let admission_responses_total = Family::<ResponseLabels, Counter>::default();
        registry.register(
            "injector_admission_responses",
            "Total number of admission responses sent",
            admission_responses_total.clone(),
        );

        let admission_request_duration_seconds = Histogram::new(DURATION_BUCKETS.iter().copied());
        registry.register(
            "injector_admission_request_duration_seconds",
            "Duration of admission request processing in seconds",
            admission_request_duration_seconds.clone(),
        );

        Self {
            admission_requests_total,
            decisions_total,
            admission_responses_total,
            admission_request_duration_seconds,
        }
    }

    pub fn record_decision(&self, decision: &Decision) {
        let labels = match decision {
            Decision::Required(_) => DecisionLabels {
                result: "inject",
                reason: "required",
            },
            Decision::NotRequired(reason) => DecisionLabels {
                result: "skip",
                reason: reason.as_str(),
            },
        };
        self.decisions_total.get_or_create(&labels).inc();
    }

    pub fn record_response(&self, allowed: bool) {
        self.admission_responses_total
            .get_or_create(&ResponseLabels {
                allowed: if allowed { "true" } else { "false" },
            })
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use prometheus_client::encoding::text::encode;

    use super::*;
    use crate::decider::SkipReason;
    use crate::sidecar::SidecarConfig;

    #[test]
    fn test_decisions_are_labelled_by_reason() {
        let mut registry = Registry::default();
        let metrics = InjectorMetrics::new(&mut registry);

        metrics.record_decision(&Decision::Required(SidecarConfig::default()));
        metrics.record_decision(&Decision::NotRequired(SkipReason::IgnoredNamespace));
        metrics.record_decision(&Decision::NotRequired(SkipReason::IgnoredNamespace));

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains(r#"injector_decisions_total{result="inject",reason="required"} 1"#));
        assert!(out.contains(
            r#"injector_decisions_total{result="skip",reason="ignored_namespace"} 2"#
        ));
    }
}
