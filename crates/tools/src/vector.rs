//! HTTP-backed vector-search adapter.
//!
//! Every retrieval corpus (scripture, tradition-text, encyclopedia,
//! commentary) is one instance of [`VectorSearchTool`] pointed at its
//! backend. The backend is an opaque network service; this adapter only
//! owns the wire shape of a search call and its ranked-passage result.

use std::time::Duration;

use serde::Deserialize;

use rawi_domain::config::SearchBackendConfig;
use rawi_domain::content::Passage;
use rawi_domain::error::{Error, Result};

use crate::{SearchError, SearchTool};

#[derive(Debug)]
pub struct VectorSearchTool {
    name: String,
    description: String,
    base_url: String,
    api_key: Option<String>,
    corpus_language: String,
    client: reqwest::Client,
}

/// Wire shape of one backend hit.
#[derive(Debug, Deserialize)]
struct WireHit {
    text: String,
    title: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    results: Vec<WireHit>,
}

impl VectorSearchTool {
    pub fn from_config(cfg: &SearchBackendConfig) -> Result<Self> {
        let api_key = match (&cfg.auth.key, &cfg.auth.env) {
            (Some(key), _) => Some(key.clone()),
            (None, Some(env_var)) => Some(std::env::var(env_var).map_err(|_| {
                Error::Auth(format!(
                    "environment variable '{env_var}' not set for search backend '{}'",
                    cfg.name
                ))
            })?),
            (None, None) => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            name: cfg.name.clone(),
            description: cfg.description.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            corpus_language: cfg.corpus_language.clone(),
            client,
        })
    }

    fn classify(&self, e: reqwest::Error) -> SearchError {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            SearchError::Transient(e.to_string())
        } else {
            SearchError::InvalidQuery(e.to_string())
        }
    }

    fn hit_to_passage(&self, hit: WireHit) -> Passage {
        Passage {
            text: hit.text,
            title: hit.title,
            language: hit
                .language
                .unwrap_or_else(|| self.corpus_language.clone()),
            source_id: hit.id.unwrap_or_default(),
        }
    }
}

#[async_trait::async_trait]
impl SearchTool for VectorSearchTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn search(
        &self,
        query: &str,
        language_hint: Option<&str>,
    ) -> std::result::Result<Vec<Passage>, SearchError> {
        if query.trim().is_empty() {
            return Err(SearchError::InvalidQuery("empty query".into()));
        }

        let url = format!("{}/search", self.base_url);
        let mut body = serde_json::json!({ "query": query });
        if let Some(hint) = language_hint {
            body["language_hint"] = serde_json::json!(hint);
        }

        tracing::debug!(tool = %self.name, url = %url, "search request");

        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("x-api-key", key);
        }

        let resp = req.send().await.map_err(|e| self.classify(e))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(SearchError::Transient(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SearchError::InvalidQuery(format!(
                "HTTP {} - {text}",
                status.as_u16()
            )));
        }

        let wire: WireResponse = resp
            .json()
            .await
            .map_err(|e| SearchError::Transient(format!("malformed response: {e}")))?;

        Ok(wire
            .results
            .into_iter()
            .map(|h| self.hit_to_passage(h))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rawi_domain::config::AuthConfig;

    fn config() -> SearchBackendConfig {
        SearchBackendConfig {
            name: "search_quran".into(),
            description: "Semantic search over the Quran".into(),
            base_url: "https://search.example.com/quran/".into(),
            auth: AuthConfig::default(),
            corpus_language: "ar".into(),
            timeout_secs: 20,
        }
    }

    #[test]
    fn base_url_is_normalized() {
        let tool = VectorSearchTool::from_config(&config()).unwrap();
        assert_eq!(tool.base_url, "https://search.example.com/quran");
        assert_eq!(tool.name(), "search_quran");
    }

    #[test]
    fn missing_auth_env_is_an_error() {
        let mut cfg = config();
        cfg.auth.env = Some("RAWI_TEST_SEARCH_KEY_MISSING".into());
        let err = VectorSearchTool::from_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("RAWI_TEST_SEARCH_KEY_MISSING"));
    }

    #[test]
    fn hits_default_to_corpus_language() {
        let tool = VectorSearchTool::from_config(&config()).unwrap();
        let passage = tool.hit_to_passage(WireHit {
            text: "ومن يتق الله".into(),
            title: "Quran 65:2".into(),
            language: None,
            id: Some("65:2".into()),
        });
        assert_eq!(passage.language, "ar");
        assert_eq!(passage.source_id, "65:2");
    }

    #[tokio::test]
    async fn empty_query_is_rejected_without_a_network_call() {
        let tool = VectorSearchTool::from_config(&config()).unwrap();
        let err = tool.search("   ", None).await.unwrap_err();
        assert!(matches!(err, SearchError::InvalidQuery(_)));
    }

    #[test]
    fn wire_response_parses_ranked_hits() {
        let json = r#"{
            "results": [
                { "text": "a", "title": "Quran 2:153", "language": "ar", "id": "2:153" },
                { "text": "b", "title": "Quran 94:6" }
            ]
        }"#;
        let wire: WireResponse = serde_json::from_str(json).unwrap();
        assert_eq!(wire.results.len(), 2);
        assert!(wire.results[1].language.is_none());
    }
}
