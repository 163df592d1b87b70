/*!
Stub de l'API d'ingestion pour tests sans collecteur réel

Démarre un serveur wiremock qui accepte `POST /api/ingest` avec le jeton
`Bearer test-token`, et permet de scripter les réponses (acquittements par
élément, 429, erreurs HTTP). Toutes les requêtes reçues restent consultables.
*/

use crate::contract_helpers::{rate_limit_body, results_body};
use serde_json::Value;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const INGEST_PATH: &str = "/api/ingest";
pub const TEST_TOKEN: &str = "test-token";

/// Acquitte chaque élément du lot reçu
struct AcceptAll;

impl Respond for AcceptAll {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        match serde_json::from_slice::<Vec<Value>>(&request.body) {
            Ok(records) => {
                let acks = vec![(true, None); records.len()];
                ResponseTemplate::new(200).set_body_json(results_body(&acks))
            }
            Err(e) => {
                log::warn!("[MOCK] Unparseable batch: {}", e);
                ResponseTemplate::new(400).set_body_string("body must be a JSON array")
            }
        }
    }
}

/// Serveur d'ingestion simulé
pub struct MockIngestApi {
    server: MockServer,
}

impl MockIngestApi {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// URL complète de l'endpoint d'ingestion
    pub fn url(&self) -> String {
        format!("{}{}", self.server.uri(), INGEST_PATH)
    }

    pub fn token(&self) -> String {
        TEST_TOKEN.to_string()
    }

    fn ingest() -> wiremock::MockBuilder {
        Mock::given(method("POST"))
            .and(path(INGEST_PATH))
            .and(header("authorization", format!("Bearer {TEST_TOKEN}").as_str()))
    }

    /// Acquitte tous les éléments de chaque lot
    pub async fn accept_all(&self) {
        Self::ingest().respond_with(AcceptAll).mount(&self.server).await;
    }

    /// Répond toujours avec ces résultats, dans l'ordre du lot
    pub async fn respond_with_results(&self, results: &[(bool, Option<&str>)]) {
        Self::ingest()
            .respond_with(ResponseTemplate::new(200).set_body_json(results_body(results)))
            .mount(&self.server)
            .await;
    }

    /// 429 sur chaque requête
    pub async fn rate_limit(&self, ms_before_next: u64) {
        Self::ingest()
            .respond_with(ResponseTemplate::new(429).set_body_json(rate_limit_body(ms_before_next)))
            .mount(&self.server)
            .await;
    }

    /// 429 sur la première requête seulement. À monter avant `accept_all`.
    pub async fn rate_limit_once(&self, ms_before_next: u64) {
        Self::ingest()
            .respond_with(ResponseTemplate::new(429).set_body_json(rate_limit_body(ms_before_next)))
            .up_to_n_times(1)
            .mount(&self.server)
            .await;
    }

    pub async fn fail_with_status(&self, status: u16) {
        Self::ingest()
            .respond_with(ResponseTemplate::new(status).set_body_string("stub failure"))
            .mount(&self.server)
            .await;
    }

    async fn requests(&self) -> Vec<Request> {
        self.server.received_requests().await.unwrap_or_default()
    }

    pub async fn request_count(&self) -> usize {
        self.requests().await.len()
    }

    /// Corps de chaque requête reçue, décodés comme tableaux JSON
    pub async fn received_batches(&self) -> Vec<Vec<Value>> {
        self.requests()
            .await
            .iter()
            .filter_map(|r| serde_json::from_slice::<Vec<Value>>(&r.body).ok())
            .collect()
    }

    /// Vrai si chaque requête portait le jeton attendu
    pub async fn all_requests_authorized(&self) -> bool {
        let expected = format!("Bearer {TEST_TOKEN}");
        self.requests().await.iter().all(|r| {
            r.headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == expected)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn post(api: &MockIngestApi, token: &str, body: Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(api.url())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_accept_all_acks_every_item() {
        let api = MockIngestApi::start().await;
        api.accept_all().await;

        let response = post(&api, TEST_TOKEN, json!([{"n": 1}, {"n": 2}])).await;
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["results"].as_array().unwrap().len(), 2);
        assert_eq!(body["results"][1]["success"], true);

        assert_eq!(api.received_batches().await, vec![vec![json!({"n": 1}), json!({"n": 2})]]);
        assert!(api.all_requests_authorized().await);
    }

    #[tokio::test]
    async fn test_wrong_token_is_not_matched() {
        let api = MockIngestApi::start().await;
        api.accept_all().await;

        let response = post(&api, "wrong", json!([])).await;
        assert_eq!(response.status(), 404);
        assert_eq!(api.request_count().await, 1);
        assert!(!api.all_requests_authorized().await);
    }

    #[tokio::test]
    async fn test_rate_limit_once_then_accept() {
        let api = MockIngestApi::start().await;
        api.rate_limit_once(1500).await;
        api.accept_all().await;

        let first = post(&api, TEST_TOKEN, json!([{}])).await;
        assert_eq!(first.status(), 429);
        let body: Value = first.json().await.unwrap();
        assert_eq!(body["msBeforeNext"], 1500);

        let second = post(&api, TEST_TOKEN, json!([{}])).await;
        assert_eq!(second.status(), 200);
    }

    #[tokio::test]
    async fn test_scripted_results() {
        let api = MockIngestApi::start().await;
        api.respond_with_results(&[(true, None), (false, Some("bad payload"))]).await;

        let body: Value = post(&api, TEST_TOKEN, json!([{}, {}])).await.json().await.unwrap();
        assert_eq!(body["results"][0], json!({"success": true}));
        assert_eq!(body["results"][1], json!({"success": false, "message": "bad payload"}));
    }
}
