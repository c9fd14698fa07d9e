use std::sync::Arc;

use jobscope_core::{CompanyInsight, JobFilters, MarketInsight, SearchResult};
use jobscope_storage::{KnowledgeStore, StorageError};

use crate::SearchCoordinator;

/// Read-only surface handed to downstream consumers (content generation, analytics).
#[derive(Clone)]
pub struct KnowledgeService {
    coordinator: Arc<SearchCoordinator>,
    store: KnowledgeStore,
}

impl KnowledgeService {
    pub fn new(coordinator: Arc<SearchCoordinator>, store: KnowledgeStore) -> Self {
        Self { coordinator, store }
    }

    pub async fn search(
        &self,
        query: &str,
        filters: &JobFilters,
        limit: usize,
    ) -> Result<Vec<SearchResult>, StorageError> {
        self.coordinator.search(query, filters, limit).await
    }

    pub async fn company_insights(&self, name: &str) -> Result<CompanyInsight, StorageError> {
        self.store.company_insights(name).await
    }

    pub async fn market_insights(&self) -> Result<MarketInsight, StorageError> {
        self.store.aggregate_insights().await
    }
}
