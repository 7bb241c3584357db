//! Mock webhook server capturing notification deliveries

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, Request, ResponseTemplate,
};

pub struct MockWebhookServer {
    pub server: MockServer,
    captured: Arc<Mutex<Vec<Value>>>,
}

impl MockWebhookServer {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
            captured: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Accept and capture every POST /webhook body
    pub async fn mock_success(&self) {
        let captured = self.captured.clone();
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(move |req: &Request| {
                if let Ok(body) = req.body_json::<Value>() {
                    captured.lock().push(body);
                }
                ResponseTemplate::new(200)
            })
            .mount(&self.server)
            .await;
    }

    pub async fn mock_failure(&self, status_code: u16) {
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(status_code))
            .mount(&self.server)
            .await;
    }

    pub fn captured(&self) -> Vec<Value> {
        self.captured.lock().clone()
    }

    pub fn webhook_url(&self) -> String {
        format!("{}/webhook", self.server.uri())
    }
}
