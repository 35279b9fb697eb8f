use crate::error::AppError;
use crate::models::{
    CostAndUsageQuery, CostAndUsageResult, Dimension, DimensionValue, ReportingWindow,
};
use async_trait::async_trait;

pub mod cost_explorer;
pub mod sigv4;

/// The two billing-API capabilities the collector depends on.
#[async_trait]
pub trait BillingApi: Send + Sync {
    async fn list_dimension_values(
        &self,
        dimension: Dimension,
        window: &ReportingWindow,
    ) -> Result<Vec<DimensionValue>, AppError>;

    async fn query_cost_and_usage(
        &self,
        query: &CostAndUsageQuery,
    ) -> Result<CostAndUsageResult, AppError>;
}
