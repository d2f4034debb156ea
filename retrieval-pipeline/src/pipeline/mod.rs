pub mod config;
pub mod diagnostics;
pub mod stages;

pub use config::{ExpansionMode, RetrievalConfig, RetrievalTuning};
pub use diagnostics::RetrievalDiagnostics;

use async_trait::async_trait;
use common::error::AppError;
use std::time::{Duration, Instant};
use tracing::info;

use crate::RankedContext;
use stages::PipelineContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Collect,
    Fuse,
    Rerank,
    ExpandAugment,
    Assemble,
}

#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn kind(&self) -> StageKind;
    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError>;
}

pub type BoxedStage = Box<dyn PipelineStage>;

#[derive(Debug, Default, Clone)]
pub struct PipelineStageTimings {
    timings: Vec<(StageKind, Duration)>,
}

impl PipelineStageTimings {
    pub fn record(&mut self, kind: StageKind, duration: Duration) {
        self.timings.push((kind, duration));
    }

    pub fn into_vec(self) -> Vec<(StageKind, Duration)> {
        self.timings
    }

    fn get_stage_ms(&self, kind: StageKind) -> u128 {
        self.timings
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, d)| d.as_millis())
            .unwrap_or(0)
    }

    pub fn collect_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Collect)
    }

    pub fn rerank_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Rerank)
    }

    pub fn expand_augment_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::ExpandAugment)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CollectCandidatesStage;

#[async_trait]
impl PipelineStage for CollectCandidatesStage {
    fn kind(&self) -> StageKind {
        StageKind::Collect
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        stages::collect_candidates(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FuseStage;

#[async_trait]
impl PipelineStage for FuseStage {
    fn kind(&self) -> StageKind {
        StageKind::Fuse
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        stages::fuse_and_bound(ctx)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RerankStage;

#[async_trait]
impl PipelineStage for RerankStage {
    fn kind(&self) -> StageKind {
        StageKind::Rerank
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        stages::rerank(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExpandAugmentStage;

#[async_trait]
impl PipelineStage for ExpandAugmentStage {
    fn kind(&self) -> StageKind {
        StageKind::ExpandAugment
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        stages::expand_and_augment(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AssembleStage;

#[async_trait]
impl PipelineStage for AssembleStage {
    fn kind(&self) -> StageKind {
        StageKind::Assemble
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        stages::assemble(ctx).await
    }
}

fn hybrid_stages() -> Vec<BoxedStage> {
    vec![
        Box::new(CollectCandidatesStage),
        Box::new(FuseStage),
        Box::new(RerankStage),
        Box::new(ExpandAugmentStage),
        Box::new(AssembleStage),
    ]
}

/// Drives the hybrid retrieval stages over the context and assembles the
/// ranked output.
pub async fn run_pipeline(mut ctx: PipelineContext<'_>) -> Result<RankedContext, AppError> {
    for stage in hybrid_stages() {
        let start = Instant::now();
        stage.execute(&mut ctx).await?;
        ctx.record_stage_duration(stage.kind(), start.elapsed());
    }

    let timings = ctx.take_stage_timings();
    info!(
        user_id = %ctx.user_id,
        strategy = %ctx.used_strategy,
        chunks = ctx.results.len(),
        triples = ctx.triples.len(),
        collect_ms = timings.collect_ms() as u64,
        rerank_ms = timings.rerank_ms() as u64,
        expand_ms = timings.expand_augment_ms() as u64,
        "Retrieval pipeline finished"
    );

    Ok(RankedContext {
        chunks: std::mem::take(&mut ctx.results),
        triples: std::mem::take(&mut ctx.triples),
        used_strategy: ctx.used_strategy,
        diagnostics: std::mem::take(&mut ctx.diagnostics),
    })
}
