use async_trait::async_trait;

use crate::error::BackendError;
use crate::model::{LogSearch, OptionMap};

use super::opensearch::{OpenSearchClient, Transport};
use super::{LogClient, LogSearchResult};

/// Elasticsearch reached through a Kibana instance: the same compiled query
/// DSL, tunneled through Kibana's console proxy with the `kbn-xsrf` header.
/// Everything else (paging, follow, entry mapping) is the OpenSearch path.
pub struct KibanaClient {
    inner: OpenSearchClient,
}

impl KibanaClient {
    pub fn new(options: &OptionMap) -> Result<Self, BackendError> {
        Ok(KibanaClient {
            inner: OpenSearchClient::with_transport(options, Transport::KibanaProxy)?,
        })
    }
}

#[async_trait]
impl LogClient for KibanaClient {
    async fn get(&self, search: &LogSearch) -> Result<Box<dyn LogSearchResult>, BackendError> {
        self.inner.get(search).await
    }
}
