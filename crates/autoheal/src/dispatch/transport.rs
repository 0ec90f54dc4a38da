//! Remote command transport between the coordinator and node agents.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::TransportError;
use crate::executor::NodeExecutor;
use crate::types::{AttemptResult, ExecuteRequest};

/// Runs an attempt on a remote node and returns its result.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn execute(&self, request: &ExecuteRequest) -> Result<AttemptResult, TransportError>;
}

/// Node id to agent base URL.
#[derive(Debug, Clone, Default)]
pub struct NodeInventory {
    nodes: BTreeMap<String, String>,
}

impl NodeInventory {
    #[must_use]
    pub fn new(nodes: BTreeMap<String, String>) -> Self {
        Self { nodes }
    }

    /// Resolve a node id to its agent URL.
    ///
    /// # Errors
    /// Returns `NodeNotFound` if the node is not in the inventory.
    pub fn resolve(&self, node_id: &str) -> Result<&str, TransportError> {
        self.nodes
            .get(node_id)
            .map(String::as_str)
            .ok_or_else(|| TransportError::NodeNotFound(node_id.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Transport that calls `POST {agent}/api/v1/execute` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    inventory: NodeInventory,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with a per-request timeout.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(inventory: NodeInventory, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { inventory, client })
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn execute(&self, request: &ExecuteRequest) -> Result<AttemptResult, TransportError> {
        let base = self.inventory.resolve(&request.node_id)?;
        let url = format!("{}/api/v1/execute", base.trim_end_matches('/'));

        debug!(node_id = %request.node_id, url = %url, attempt = request.attempt_number, "Dispatching to node agent");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    TransportError::Unreachable {
                        node_id: request.node_id.clone(),
                        reason: e.to_string(),
                    }
                } else {
                    TransportError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Protocol {
                status: status.as_u16(),
                message,
            });
        }

        response.json::<AttemptResult>().await.map_err(|e| TransportError::Protocol {
            status: status.as_u16(),
            message: format!("invalid attempt result: {e}"),
        })
    }
}

/// In-process transport to executors living in this process.
///
/// Used for single-host deployments and tests.
#[derive(Default, Clone)]
pub struct LocalTransport {
    executors: HashMap<String, Arc<NodeExecutor>>,
}

impl LocalTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its node id.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<NodeExecutor>) -> Self {
        self.executors
            .insert(executor.node_id().to_string(), executor);
        self
    }
}

#[async_trait]
impl RemoteTransport for LocalTransport {
    async fn execute(&self, request: &ExecuteRequest) -> Result<AttemptResult, TransportError> {
        let executor = self
            .executors
            .get(&request.node_id)
            .ok_or_else(|| TransportError::NodeNotFound(request.node_id.clone()))?;
        Ok(executor.execute(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionKind, AttemptStatus};
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(node: &str) -> ExecuteRequest {
        ExecuteRequest {
            attempt_id: Uuid::new_v4(),
            node_id: node.into(),
            action: ActionKind::ClearCache,
            attempt_number: 1,
        }
    }

    fn inventory(url: &str) -> NodeInventory {
        NodeInventory::new(BTreeMap::from([("n1".to_string(), url.to_string())]))
    }

    #[tokio::test]
    async fn test_http_round_trip() {
        let server = MockServer::start().await;
        let result = AttemptResult::bare(AttemptStatus::Succeeded, "freed 512 MB");
        Mock::given(method("POST"))
            .and(path("/api/v1/execute"))
            .and(body_partial_json(serde_json::json!({
                "node_id": "n1",
                "action": {"kind": "clear_cache"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(&result))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(inventory(&server.uri()), Duration::from_secs(5)).unwrap();
        let got = transport.execute(&request("n1")).await.unwrap();
        assert_eq!(got.status, AttemptStatus::Succeeded);
        assert_eq!(got.detail, "freed 512 MB");
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let transport = HttpTransport::new(NodeInventory::default(), Duration::from_secs(1)).unwrap();
        let err = transport.execute(&request("ghost")).await.unwrap_err();
        assert!(matches!(err, TransportError::NodeNotFound(ref n) if n == "ghost"));
    }

    #[tokio::test]
    async fn test_agent_error_is_protocol() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(inventory(&server.uri()), Duration::from_secs(5)).unwrap();
        let err = transport.execute(&request("n1")).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport =
            HttpTransport::new(inventory(&format!("http://{addr}")), Duration::from_secs(2)).unwrap();
        let err = transport.execute(&request("n1")).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_local_transport_unknown_node() {
        let err = LocalTransport::new().execute(&request("n9")).await.unwrap_err();
        assert!(matches!(err, TransportError::NodeNotFound(_)));
    }
}
