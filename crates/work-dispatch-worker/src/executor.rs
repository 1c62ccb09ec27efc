use crate::error::{panic_message, UnitFailure};
use crate::metrics::DispatchMetrics;
use crate::trace::Tracer;
use crate::unit::{ProcessingUnit, UnitInput, WorkData};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, Instrument};

/// Runs one unit on one target, containing its errors and panics
pub struct UnitExecutor {
    metrics: Arc<DispatchMetrics>,
    tracer: Arc<dyn Tracer>,
}

impl UnitExecutor {
    pub fn new(metrics: Arc<DispatchMetrics>, tracer: Arc<dyn Tracer>) -> Self {
        UnitExecutor { metrics, tracer }
    }

    pub async fn execute(
        &self,
        unit: &dyn ProcessingUnit,
        input: UnitInput,
        work: &WorkData<'_>,
    ) -> Result<(), UnitFailure> {
        let name = unit.name();
        let span = self.tracer.unit_span(name, work);

        debug!(unit = %name, message_id = %work.item.message_id, "Executing on {}", work.target);
        self.metrics.unit_started(name);
        let started = Instant::now();

        let outcome = AssertUnwindSafe(unit.execute(input, work))
            .catch_unwind()
            .instrument(span)
            .await;

        let elapsed = started.elapsed().as_secs_f64();
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some((format!("{:#}", e), false)),
            Err(panic) => Some((panic_message(panic.as_ref()), true)),
        };
        self.metrics.unit_finished(name, elapsed, failure.is_none());

        match failure {
            None => Ok(()),
            Some((message, panicked)) => {
                error!(
                    unit = %name,
                    message_id = %work.item.message_id,
                    panicked,
                    "Processing unit failed on {}: {}",
                    work.target,
                    message
                );
                Err(UnitFailure {
                    unit: name.to_string(),
                    target: work.target.to_string(),
                    message,
                    panicked,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::NoopTracer;
    use crate::unit::Target;
    use async_trait::async_trait;
    use work_dispatch_core::{ElementRef, ElementStatus, Priority, WorkItem};

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
    }

    struct Scripted(Behaviour);

    #[async_trait]
    impl ProcessingUnit for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn is_handled(&self, _target: &Target) -> bool {
            true
        }

        async fn execute(&self, _input: UnitInput, _work: &WorkData<'_>) -> anyhow::Result<()> {
            match self.0 {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => anyhow::bail!("bad input"),
                Behaviour::Panic => panic!("index out of bounds"),
            }
        }
    }

    async fn run(behaviour: Behaviour, metrics: &Arc<DispatchMetrics>) -> Result<(), UnitFailure> {
        let executor = UnitExecutor::new(metrics.clone(), Arc::new(NoopTracer));
        let item = WorkItem::builder()
            .message_id("m1")
            .vertex("v1")
            .priority(Priority::Normal)
            .build()
            .unwrap();
        let target = Target::element(ElementRef::Vertex("v1".into()), ElementStatus::New);
        let work = WorkData {
            item: &item,
            target: &target,
        };
        executor
            .execute(&Scripted(behaviour), UnitInput::Empty, &work)
            .await
    }

    #[tokio::test]
    async fn test_outcomes_are_contained() {
        let metrics = Arc::new(DispatchMetrics::new().unwrap());

        run(Behaviour::Succeed, &metrics).await.unwrap();

        let failed = run(Behaviour::Fail, &metrics).await.unwrap_err();
        assert_eq!(failed.unit, "scripted");
        assert_eq!(failed.target, "vertex v1");
        assert_eq!(failed.message, "bad input");
        assert!(!failed.panicked);

        let panicked = run(Behaviour::Panic, &metrics).await.unwrap_err();
        assert!(panicked.panicked);
        assert_eq!(panicked.message, "index out of bounds");

        assert_eq!(metrics.unit_counts("scripted"), (3, 2, 0));
    }
}
