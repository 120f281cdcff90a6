//! Prometheus metrics for the control plane
//!
//! One registry per process, shared as [`SharedMetrics`] between the capture
//! workers, the workflows, the gateway and the `/metrics` handler.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

pub type SharedMetrics = Arc<ControllerMetrics>;

pub struct ControllerMetrics {
    registry: Registry,
    captures: IntCounterVec,
    workflows: IntCounterVec,
    workflow_duration: HistogramVec,
    gateway_calls: IntCounterVec,
    gateway_duration: HistogramVec,
    jobs: IntCounterVec,
}

fn result_label(ok: bool) -> &'static str {
    if ok {
        "success"
    } else {
        "error"
    }
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let captures = IntCounterVec::new(
            Opts::new(
                "ferry_capture_events_total",
                "Watch notifications handled, by capturer and outcome",
            ),
            &["capturer", "outcome"],
        )?;
        let workflows = IntCounterVec::new(
            Opts::new(
                "ferry_workflow_runs_total",
                "Workflow invocations, by workflow and result",
            ),
            &["workflow", "result"],
        )?;
        let workflow_duration = HistogramVec::new(
            HistogramOpts::new(
                "ferry_workflow_duration_seconds",
                "Workflow duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["workflow"],
        )?;
        let gateway_calls = IntCounterVec::new(
            Opts::new(
                "ferry_gateway_calls_total",
                "Cluster API calls, by operation and result",
            ),
            &["operation", "result"],
        )?;
        let gateway_duration = HistogramVec::new(
            HistogramOpts::new(
                "ferry_gateway_call_duration_seconds",
                "Cluster API call latency in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["operation"],
        )?;

        let jobs = IntCounterVec::new(
            Opts::new(
                "ferry_cron_job_results_total",
                "Finished CronJob runs, by result",
            ),
            &["result"],
        )?;

        registry.register(Box::new(captures.clone()))?;
        registry.register(Box::new(workflows.clone()))?;
        registry.register(Box::new(workflow_duration.clone()))?;
        registry.register(Box::new(gateway_calls.clone()))?;
        registry.register(Box::new(gateway_duration.clone()))?;
        registry.register(Box::new(jobs.clone()))?;

        Ok(Self {
            registry,
            captures,
            workflows,
            workflow_duration,
            gateway_calls,
            gateway_duration,
            jobs,
        })
    }

    pub fn record_capture(&self, capturer: &str, outcome: &str) {
        self.captures.with_label_values(&[capturer, outcome]).inc();
    }

    pub fn record_workflow(&self, workflow: &str, ok: bool, duration_secs: f64) {
        self.workflows
            .with_label_values(&[workflow, result_label(ok)])
            .inc();
        self.workflow_duration
            .with_label_values(&[workflow])
            .observe(duration_secs);
    }

    pub fn record_gateway_call(&self, operation: &str, ok: bool, duration_secs: f64) {
        self.gateway_calls
            .with_label_values(&[operation, result_label(ok)])
            .inc();
        self.gateway_duration
            .with_label_values(&[operation])
            .observe(duration_secs);
    }

    pub fn record_job(&self, result: &str) {
        self.jobs.with_label_values(&[result]).inc();
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
