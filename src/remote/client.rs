// ABOUTME: HTTP client for the Query API GraphQL endpoint
// ABOUTME: Posts sync queries, attaches bearer auth, and decodes feedback pages

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::time::Duration;

use super::auth::{Credentials, TokenProvider};
use super::models::{FeedbackPage, GraphQlRequest, QueryApiResponse};
use crate::utils::sanitize_url;

/// Sends one page request and returns the decoded page.
///
/// Implementations report every failure (network, HTTP status, undecodable
/// body, GraphQL errors) as an error; the fetch loop retries them all.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    async fn fetch_page(&self, request: &GraphQlRequest) -> Result<FeedbackPage>;
}

pub struct QueryApiClient {
    client: Client,
    url: String,
    auth: Option<TokenProvider>,
}

impl QueryApiClient {
    pub fn new(url: String, credentials: Option<Credentials>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let auth = credentials.map(|credentials| TokenProvider::new(client.clone(), credentials));

        Ok(Self { client, url, auth })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl QueryTransport for QueryApiClient {
    async fn fetch_page(&self, request: &GraphQlRequest) -> Result<FeedbackPage> {
        let mut builder = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .json(request);

        if let Some(ref auth) = self.auth {
            builder = builder.bearer_auth(auth.token().await?);
        }

        let response = builder.send().await.with_context(|| {
            format!(
                "Failed to send request to Query API at {}",
                sanitize_url(&self.url)
            )
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read Query API response body")?;

        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED {
                if let Some(ref auth) = self.auth {
                    // The next attempt fetches a fresh token
                    auth.invalidate().await;
                }
                anyhow::bail!("Query API authentication failed (401): {}", body);
            }

            anyhow::bail!("Query API request failed with status {}: {}", status, body);
        }

        tracing::trace!("GraphQL response:\n{}", body);

        QueryApiResponse::from_body(&body)?.into_page()
    }
}
