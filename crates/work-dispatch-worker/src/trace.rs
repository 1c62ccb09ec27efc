use crate::unit::WorkData;
use tracing::Span;

/// Decides whether, and how, a unit execution is traced
pub trait Tracer: Send + Sync {
    fn unit_span(&self, unit: &str, work: &WorkData<'_>) -> Span;
}

/// Opens an `info` span for items that ask for tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct SpanTracer;

impl Tracer for SpanTracer {
    fn unit_span(&self, unit: &str, work: &WorkData<'_>) -> Span {
        if !work.item.trace_enabled {
            return Span::none();
        }
        tracing::info_span!(
            "unit",
            unit = %unit,
            message_id = %work.item.message_id,
            target = %work.target,
            workspace = work.item.workspace_id.as_deref().unwrap_or(""),
        )
    }
}

/// Never traces
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn unit_span(&self, _unit: &str, _work: &WorkData<'_>) -> Span {
        Span::none()
    }
}
