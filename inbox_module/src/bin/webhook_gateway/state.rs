use std::sync::Arc;

use inbox_module::ingestion::IngestionPipeline;

#[derive(Clone)]
pub(super) struct GatewayState {
    pub(super) pipeline: Arc<IngestionPipeline>,
    pub(super) verify_token: Option<String>,
}
