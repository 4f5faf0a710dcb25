//! Similarity search through a Supabase stored procedure.

use crate::openai::check_status;
use crate::retrieval::{RetrievalMatch, SimilaritySearch};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

pub const DEFAULT_MATCH_FUNCTION: &str = "match_person";

pub struct SupabaseSearch {
    client: Client,
    base_url: String,
    service_key: SecretString,
    function: String,
}

#[derive(Debug, Serialize)]
struct MatchRequest<'a> {
    query_embedding: &'a [f32],
    match_threshold: f32,
    match_count: usize,
}

impl SupabaseSearch {
    pub fn new(base_url: &str, service_key: SecretString) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            function: DEFAULT_MATCH_FUNCTION.to_string(),
        }
    }

    pub fn with_function(mut self, function: &str) -> Self {
        self.function = function.to_string();
        self
    }

    pub fn rpc_url(&self) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, self.function)
    }
}

#[async_trait]
impl SimilaritySearch for SupabaseSearch {
    async fn match_records(
        &self,
        embedding: &[f32],
        threshold: f32,
        count: usize,
    ) -> Result<Vec<RetrievalMatch>> {
        let request = MatchRequest {
            query_embedding: embedding,
            match_threshold: threshold,
            match_count: count,
        };
        let key = self.service_key.expose_secret();
        let response = self
            .client
            .post(self.rpc_url())
            .header("apikey", key)
            .bearer_auth(key)
            .json(&request)
            .send()
            .await?;
        let response = check_status(response, "similarity search").await?;
        let matches = response.json::<Vec<RetrievalMatch>>().await?;
        tracing::debug!("similarity search returned {} records", matches.len());
        Ok(matches)
    }
}
