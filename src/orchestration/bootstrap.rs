//! # Engine Bootstrap
//!
//! Wires the engine together: logging, both store pools, migrations, the
//! optional legacy-content repair pass, the config registry, and the
//! recovery sweeper (run once at startup, then spawned on its interval).

use crate::config::EngineConfig;
use crate::content::store::PgContentStore;
use crate::database::StorePools;
use crate::error::{EvalError, Result};
use crate::logging::init_structured_logging;
use crate::orchestration::dispatcher::TaskDispatcher;
use crate::orchestration::evaluator::Evaluator;
use crate::orchestration::lifecycle::{BatchLifecycle, DocumentSource, FsDocumentSource};
use crate::orchestration::recovery::RecoverySweeper;
use crate::registry::ConfigRegistry;
use std::sync::Arc;
use tracing::info;

/// A fully wired engine instance.
pub struct Engine {
    lifecycle: Arc<BatchLifecycle>,
    sweeper: Arc<RecoverySweeper>,
    registry: Arc<ConfigRegistry>,
    pools: StorePools,
}

impl Engine {
    /// Boot with the default filesystem document source and no evaluator
    /// wired in; useful for tooling that only stages and inspects batches.
    pub async fn boot(config: EngineConfig) -> Result<Self> {
        Self::boot_with(config, Arc::new(NullEvaluator), Arc::new(FsDocumentSource)).await
    }

    /// Boot with explicit evaluator and document-source implementations.
    pub async fn boot_with(
        config: EngineConfig,
        evaluator: Arc<dyn Evaluator>,
        document_source: Arc<dyn DocumentSource>,
    ) -> Result<Self> {
        init_structured_logging();

        let pools = StorePools::connect(&config).await?;
        pools.migrate().await?;

        let content_store = Arc::new(PgContentStore::new(pools.content.clone()));

        // Startup migration for records persisted before write-time
        // validation existed; see the config switch for repair vs report
        let legacy = content_store
            .repair_legacy_records(config.repair_legacy_padding)
            .await
            .map_err(|e| EvalError::MalformedContent(e.to_string()))?;
        if legacy.malformed > 0 && !config.repair_legacy_padding {
            info!(
                malformed = legacy.malformed,
                "Legacy malformed content present; set DOCEVAL_REPAIR_LEGACY_PADDING=true to repair"
            );
        }

        let registry = Arc::new(ConfigRegistry::new());
        registry.refresh(&pools.control).await?;

        let dispatcher = Arc::new(TaskDispatcher::new(
            pools.control.clone(),
            evaluator,
            content_store.clone(),
        ));
        let lifecycle = Arc::new(BatchLifecycle::new(
            pools.control.clone(),
            content_store.clone(),
            registry.clone(),
            document_source,
            dispatcher,
            config.clone(),
        ));

        let sweeper = Arc::new(RecoverySweeper::new(
            pools.control.clone(),
            content_store,
            config,
        ));

        // Startup sweep repairs anything a previous process left behind,
        // then the interval loop takes over
        sweeper.run_once().await.map_err(|e| {
            EvalError::DatabaseError(format!("startup recovery sweep failed: {e}"))
        })?;
        tokio::spawn(sweeper.clone().run_loop());

        info!("Engine booted");
        Ok(Self {
            lifecycle,
            sweeper,
            registry,
            pools,
        })
    }

    pub fn lifecycle(&self) -> &BatchLifecycle {
        &self.lifecycle
    }

    pub fn sweeper(&self) -> &RecoverySweeper {
        &self.sweeper
    }

    pub fn registry(&self) -> &ConfigRegistry {
        &self.registry
    }

    pub fn pools(&self) -> &StorePools {
        &self.pools
    }
}

/// Placeholder evaluator for boots that never dispatch; every call reports
/// unavailability, which leaves tasks QUEUED.
struct NullEvaluator;

#[async_trait::async_trait]
impl Evaluator for NullEvaluator {
    async fn evaluate(
        &self,
        _request: crate::orchestration::evaluator::EvaluationRequest,
    ) -> std::result::Result<
        crate::orchestration::evaluator::EvaluationResponse,
        crate::orchestration::evaluator::EvaluatorError,
    > {
        Err(crate::orchestration::evaluator::EvaluatorError::Unavailable(
            "no evaluator configured".to_string(),
        ))
    }
}
