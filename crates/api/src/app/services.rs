//! Engine wiring: record store, job store, result sink, AI callers.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};

use recap_ai::{AiCaller, AiCallers, HttpAiCaller, HttpAiConfig};
use recap_infra::dataset::{InMemoryRecordStore, PostgresRecordStore, RecordStore};
use recap_infra::jobs::{
    BatchJobManager, BatchScheduler, DatasetWorkSource, InMemoryJobStore, InMemoryResultSink,
    JobStore, PostgresJobStore, PostgresResultSink, RecordContentPreparer, ResultSink,
    SchedulerSettings,
};

use crate::app::config::ApiConfig;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppServices {
    pub jobs: BatchJobManager,
}

impl AppServices {
    /// Wire a manager from its storage collaborators.
    pub fn new(
        records: Arc<dyn RecordStore>,
        store: Arc<dyn JobStore>,
        sink: Arc<dyn ResultSink>,
        callers: AiCallers,
        settings: SchedulerSettings,
    ) -> Self {
        let scheduler = BatchScheduler::new(
            store,
            Arc::new(DatasetWorkSource::new(records.clone())),
            Arc::new(RecordContentPreparer::new(records).with_cluster_limit(settings.cluster_limit)),
            callers.default_caller().clone(),
            sink,
        )
        .with_callers(callers)
        .with_settings(settings);

        Self {
            jobs: BatchJobManager::new(scheduler),
        }
    }

    /// In-memory job store and result sink over the given dataset (dev/test).
    pub fn in_memory(
        records: Arc<dyn RecordStore>,
        callers: AiCallers,
        settings: SchedulerSettings,
    ) -> Self {
        Self::new(
            records,
            InMemoryJobStore::arc(),
            Arc::new(InMemoryResultSink::new()),
            callers,
            settings,
        )
    }
}

/// Build services from process configuration and recover stale jobs.
pub async fn build_services(config: &ApiConfig) -> Result<AppServices> {
    let callers = build_callers(config);
    let models: Vec<&str> = callers.models().collect();
    info!(?models, "ai models registered");

    let settings = SchedulerSettings {
        record_timeout: config.record_call_timeout,
        cluster_timeout: config.cluster_call_timeout,
        ..SchedulerSettings::default()
    };

    let services = match &config.database_url {
        Some(url) => build_persistent_services(url, callers, settings).await?,
        None => {
            warn!("DATABASE_URL not set; using in-memory stores with an empty dataset");
            AppServices::in_memory(Arc::new(InMemoryRecordStore::new()), callers, settings)
        }
    };

    let recovered = services
        .jobs
        .recover_interrupted()
        .await
        .context("failed to recover interrupted jobs")?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "marked stale jobs as interrupted");
    }

    Ok(services)
}

/// One HTTP caller per configured model, all on the same endpoint.
/// `AI_MODEL` is the default.
pub fn build_callers(config: &ApiConfig) -> AiCallers {
    let http = |model: &str| -> Arc<dyn AiCaller> {
        let mut ai = HttpAiConfig::new(&config.ai_base_url, model);
        if let Some(key) = &config.ai_api_key {
            ai = ai.with_api_key(key);
        }
        Arc::new(HttpAiCaller::new(ai))
    };

    let default = http(&config.ai_model);
    let mut callers = AiCallers::new(default.clone()).with_model(config.ai_model.clone(), default);
    for model in config.ai_models.iter().filter(|m| **m != config.ai_model) {
        callers = callers.with_model(model.clone(), http(model));
    }
    callers
}

async fn build_persistent_services(
    database_url: &str,
    callers: AiCallers,
    settings: SchedulerSettings,
) -> Result<AppServices> {
    let pool = Arc::new(
        PgPool::connect(database_url)
            .await
            .context("failed to connect to Postgres")?,
    );

    let records = PostgresRecordStore::from_arc(pool.clone());
    records.migrate().await.context("failed to migrate records")?;
    let store = PostgresJobStore::from_arc(pool.clone());
    store.migrate().await.context("failed to migrate batch_jobs")?;
    let sink = PostgresResultSink::from_arc(pool);
    sink.migrate()
        .await
        .context("failed to migrate analysis_results")?;

    info!("using Postgres stores");
    Ok(AppServices::new(
        Arc::new(records),
        Arc::new(store),
        Arc::new(sink),
        callers,
        settings,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_configured_model_gets_its_own_caller() {
        let config = ApiConfig {
            ai_model: "gpt-4o-mini".to_string(),
            ai_models: vec!["azure-gpt4".to_string(), "gpt-4o-mini".to_string()],
            ..ApiConfig::default()
        };

        let callers = build_callers(&config);

        assert_eq!(callers.models().collect::<Vec<_>>(), vec!["azure-gpt4", "gpt-4o-mini"]);
        assert_eq!(
            callers.resolve(None).unwrap().provider(),
            "openai-compatible:gpt-4o-mini"
        );
        assert_eq!(
            callers.resolve(Some("azure-gpt4")).unwrap().provider(),
            "openai-compatible:azure-gpt4"
        );
        assert!(callers.resolve(Some("claude")).is_err());
    }
}
