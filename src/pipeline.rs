//! Transformation Pipeline (C4): ordered phases {pre, transform, validation,
//! post}, per-phase error handlers, a middleware chain, and a typed observer.

use crate::context::ExecutionContext;
use crate::error::{MappingEngineError, Result};
use crate::stages::{Stage, StageOutput};
use crate::types::Mapping;
use std::sync::Arc;
use std::time::Instant;

/// The four fixed phases a pipeline executes, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Pre,
    Transform,
    Validation,
    Post,
}

const PHASE_ORDER: [Phase; 4] = [Phase::Pre, Phase::Transform, Phase::Validation, Phase::Post];

/// Decision returned by a phase error handler: whether the pipeline should
/// keep going (possibly with replacement data) or abort.
pub struct HandlerDecision {
    pub continue_execution: bool,
    pub data: Option<StageOutput>,
}

pub type ErrorHandler = Arc<dyn Fn(&MappingEngineError, &StageOutput) -> HandlerDecision + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewarePoint {
    Before,
    After,
}

pub type Middleware = Arc<dyn Fn(&StageOutput, &ExecutionContext, MiddlewarePoint) + Send + Sync>;

/// Typed pipeline events, replacing ad hoc `onProgress`/`onComplete`/`onError`
/// callbacks with a single observer abstraction (spec section 9).
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageStart { stage: String },
    StageComplete { stage: String, execution_time_ms: u64 },
    StageError { stage: String, message: String },
}

pub trait Observer: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// An observer that forwards every event to `tracing`, matching the
/// teacher's logging density for per-stage lifecycle events.
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::StageStart { stage } => tracing::debug!(stage, "stage started"),
            PipelineEvent::StageComplete { stage, execution_time_ms } => {
                tracing::debug!(stage, execution_time_ms, "stage completed")
            }
            PipelineEvent::StageError { stage, message } => tracing::warn!(stage, message, "stage failed"),
        }
    }
}

/// Ordered composition of stages across the four phases (C4). Pipelines are
/// reusable and may be concurrently invoked from different contexts; the
/// stages they hold must be stateless or synchronize their own state.
pub struct Pipeline {
    stages: std::collections::HashMap<Phase, Vec<Arc<dyn Stage>>>,
    error_handlers: std::collections::HashMap<Phase, ErrorHandler>,
    middleware: Vec<Middleware>,
    observers: Vec<Arc<dyn Observer>>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub async fn execute(&self, data: serde_json::Value, ctx: &mut ExecutionContext, mapping: &Mapping) -> Result<StageOutput> {
        let mut current = StageOutput::passthrough(data);

        for phase in PHASE_ORDER {
            let Some(stages) = self.stages.get(&phase) else { continue };
            for stage in stages {
                for mw in &self.middleware {
                    mw(&current, ctx, MiddlewarePoint::Before);
                }

                self.emit(&PipelineEvent::StageStart { stage: stage.name().to_string() });
                let start = Instant::now();
                let result = stage.apply(&current, ctx, mapping).await;
                let elapsed_ms = start.elapsed().as_millis() as u64;

                match result {
                    Ok(output) => {
                        self.emit(&PipelineEvent::StageComplete {
                            stage: stage.name().to_string(),
                            execution_time_ms: elapsed_ms,
                        });
                        for mw in &self.middleware {
                            mw(&output, ctx, MiddlewarePoint::After);
                        }
                        current = output;
                    }
                    Err(err) => {
                        self.emit(&PipelineEvent::StageError {
                            stage: stage.name().to_string(),
                            message: err.to_string(),
                        });
                        let decision = match self.error_handlers.get(&phase) {
                            Some(handler) => handler(&err, &current),
                            None => HandlerDecision { continue_execution: false, data: None },
                        };
                        if !decision.continue_execution {
                            return Err(err);
                        }
                        if let Some(replacement) = decision.data {
                            current = replacement;
                        }
                    }
                }
            }
        }

        Ok(current)
    }

    fn emit(&self, event: &PipelineEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}

/// Collects stages into phase lists plus per-phase handlers, matching the
/// teacher's builder-struct convention.
pub struct PipelineBuilder {
    stages: std::collections::HashMap<Phase, Vec<Arc<dyn Stage>>>,
    error_handlers: std::collections::HashMap<Phase, ErrorHandler>,
    middleware: Vec<Middleware>,
    observers: Vec<Arc<dyn Observer>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            stages: std::collections::HashMap::new(),
            error_handlers: std::collections::HashMap::new(),
            middleware: Vec::new(),
            observers: Vec::new(),
        }
    }

    pub fn add_stage(mut self, phase: Phase, stage: Arc<dyn Stage>) -> Self {
        self.stages.entry(phase).or_default().push(stage);
        self
    }

    pub fn on_phase_error(mut self, phase: Phase, handler: ErrorHandler) -> Self {
        self.error_handlers.insert(phase, handler);
        self
    }

    pub fn with_middleware(mut self, mw: Middleware) -> Self {
        self.middleware.push(mw);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
            error_handlers: self.error_handlers,
            middleware: self.middleware,
            observers: self.observers,
        }
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextConfig, ContextMetadata};
    use crate::stages::FieldMappingStage;
    use crate::types::Rule;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(ContextMetadata::default(), ContextConfig::default())
    }

    #[tokio::test]
    async fn runs_phases_in_order_and_produces_output() {
        let mapping = Mapping::new(
            "m",
            1,
            vec![Rule::Direct { source_field: "id".into(), target_field: "customerId".into() }],
        )
        .unwrap();

        let pipeline = Pipeline::builder()
            .add_stage(Phase::Transform, Arc::new(FieldMappingStage))
            .build();

        let mut context = ctx();
        let output = pipeline
            .execute(serde_json::json!({"id": 1}), &mut context, &mapping)
            .await
            .unwrap();
        assert_eq!(output.data["customerId"], 1);
    }

    #[tokio::test]
    async fn error_handler_continue_false_aborts() {
        struct AlwaysFails;
        #[async_trait::async_trait]
        impl Stage for AlwaysFails {
            fn name(&self) -> &'static str {
                "AlwaysFails"
            }
            async fn apply(&self, _input: &StageOutput, _ctx: &mut ExecutionContext, _mapping: &Mapping) -> Result<StageOutput> {
                Err(crate::error::MappingEngineError::stage_failure("AlwaysFails", "boom"))
            }
        }

        let mapping = Mapping::new("m", 1, vec![]).unwrap();
        let pipeline = Pipeline::builder().add_stage(Phase::Pre, Arc::new(AlwaysFails)).build();
        let mut context = ctx();
        let result = pipeline.execute(serde_json::json!({}), &mut context, &mapping).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn middleware_observes_every_stage_invocation() {
        let mapping = Mapping::new(
            "m",
            1,
            vec![Rule::Direct { source_field: "id".into(), target_field: "id".into() }],
        )
        .unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let pipeline = Pipeline::builder()
            .add_stage(Phase::Transform, Arc::new(FieldMappingStage))
            .with_middleware(Arc::new(move |_data, _ctx, _point| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .build();

        let mut context = ctx();
        pipeline.execute(serde_json::json!({"id": 1}), &mut context, &mapping).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2); // before + after
    }
}
