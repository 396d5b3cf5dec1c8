// ABOUTME: Query API transport - GraphQL models, HTTP client, and authentication
// ABOUTME: The sync engine only depends on the QueryTransport trait defined here

pub mod auth;
pub mod client;
pub mod models;

pub use auth::{Credentials, TokenProvider};
pub use client::{QueryApiClient, QueryTransport};
pub use models::{FeedbackPage, GraphQlRequest, Node, NodeValues, QueryApiResponse, QueryVariables};
