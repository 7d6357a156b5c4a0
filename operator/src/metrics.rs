use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::crd::Phase;

const NAMESPACE: &str = "knative_lambda_operator";

/// Outcome label of one reconcile invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    Success,
    Requeue,
    Error,
    Conflict,
}

impl ReconcileResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileResult::Success => "success",
            ReconcileResult::Requeue => "requeue",
            ReconcileResult::Error => "error",
            ReconcileResult::Conflict => "conflict",
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconcile_total: IntCounterVec,
    reconcile_duration: HistogramVec,
    build_duration: HistogramVec,
    builds_total: IntCounterVec,
    errors_total: IntCounterVec,
    phase_transitions: IntCounterVec,
    notifications_total: IntCounterVec,
    cloudevents_total: IntCounterVec,
    invocations_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconcile_total = counter_vec(
            "reconcile_total",
            "Reconcile invocations by phase and result",
            &["phase", "result"],
        )?;
        let reconcile_duration = histogram_vec(
            "reconcile_duration_seconds",
            "Time spent in one reconcile invocation",
            &["phase"],
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
        )?;
        let build_duration = histogram_vec(
            "build_duration_seconds",
            "Wall time of finished builds",
            &["runtime", "result"],
            vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0, 1800.0],
        )?;
        let builds_total = counter_vec("builds_total", "Finished builds", &["runtime", "result"])?;
        let errors_total = counter_vec(
            "errors_total",
            "Errors by component and type",
            &["component", "error_type"],
        )?;
        let phase_transitions = counter_vec(
            "phase_transitions_total",
            "Phase changes written to status",
            &["from", "to"],
        )?;
        let notifications_total = counter_vec(
            "notifications_total",
            "Dispatched notifications by type and result",
            &["type", "result"],
        )?;

        let cloudevents_total = counter_vec(
            "cloudevents_total",
            "CloudEvents handled by the receiver by type and result",
            &["type", "result"],
        )?;
        let invocations_total = counter_vec(
            "function_invocations_total",
            "Function invocations reported through response events",
            &["function", "namespace", "result"],
        )?;

        for collector in [
            Box::new(reconcile_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(reconcile_duration.clone()),
            Box::new(build_duration.clone()),
            Box::new(builds_total.clone()),
            Box::new(errors_total.clone()),
            Box::new(phase_transitions.clone()),
            Box::new(notifications_total.clone()),
            Box::new(cloudevents_total.clone()),
            Box::new(invocations_total.clone()),
        ] {
            registry.register(collector)?;
        }

        Ok(Self {
            registry,
            reconcile_total,
            reconcile_duration,
            build_duration,
            builds_total,
            errors_total,
            phase_transitions,
            notifications_total,
            cloudevents_total,
            invocations_total,
        })
    }

    pub fn record_reconcile(&self, phase: Phase, result: ReconcileResult, elapsed: Duration) {
        self.reconcile_total
            .with_label_values(&[phase.as_str(), result.as_str()])
            .inc();
        self.reconcile_duration
            .with_label_values(&[phase.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_build(&self, runtime: &str, success: bool, elapsed: Option<Duration>) {
        let result = if success { "success" } else { "failure" };
        self.builds_total.with_label_values(&[runtime, result]).inc();
        if let Some(elapsed) = elapsed {
            self.build_duration
                .with_label_values(&[runtime, result])
                .observe(elapsed.as_secs_f64());
        }
    }

    pub fn record_error(&self, component: &str, error_type: &str) {
        self.errors_total
            .with_label_values(&[component, error_type])
            .inc();
    }

    pub fn record_transition(&self, from: Phase, to: Phase) {
        if from != to {
            self.phase_transitions
                .with_label_values(&[from.as_str(), to.as_str()])
                .inc();
        }
    }

    pub fn record_notification(&self, kind: &str, delivered: bool) {
        let result = if delivered { "success" } else { "failure" };
        self.notifications_total
            .with_label_values(&[kind, result])
            .inc();
    }

    pub fn record_cloudevent(&self, kind: &str, result: &str) {
        self.cloudevents_total.with_label_values(&[kind, result]).inc();
    }

    pub fn record_invocation(&self, function: &str, namespace: &str, success: bool) {
        let result = if success { "success" } else { "error" };
        self.invocations_total
            .with_label_values(&[function, namespace, result])
            .inc();
    }

    /// Text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> prometheus::Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)
}

fn histogram_vec(
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> prometheus::Result<HistogramVec> {
    HistogramVec::new(
        HistogramOpts::new(name, help).namespace(NAMESPACE).buckets(buckets),
        labels,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_namespaced_series() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reconcile(Phase::Building, ReconcileResult::Requeue, Duration::from_millis(20));
        metrics.record_build("python", true, Some(Duration::from_secs(42)));
        metrics.record_error("build", "build_failed");
        metrics.record_transition(Phase::Pending, Phase::Building);
        metrics.record_notification("BuildStarted", true);

        let text = metrics.encode().unwrap();
        assert!(text.contains(
            r#"knative_lambda_operator_reconcile_total{phase="Building",result="requeue"} 1"#
        ));
        assert!(text.contains(
            r#"knative_lambda_operator_builds_total{result="success",runtime="python"} 1"#
        ));
        assert!(text.contains(
            r#"knative_lambda_operator_errors_total{component="build",error_type="build_failed"} 1"#
        ));
        assert!(text.contains(
            r#"knative_lambda_operator_phase_transitions_total{from="Pending",to="Building"} 1"#
        ));
        assert!(text.contains("knative_lambda_operator_build_duration_seconds_bucket"));
        assert!(text.contains("knative_lambda_operator_notifications_total"));
    }

    #[test]
    fn unchanged_phase_is_not_a_transition() {
        let metrics = Metrics::new().unwrap();
        metrics.record_transition(Phase::Ready, Phase::Ready);
        assert!(!metrics.encode().unwrap().contains("phase_transitions_total{"));
    }
}
