// ABOUTME: Data structures for Query API GraphQL requests and responses
// ABOUTME: These are serialized to JSON for API communication

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A GraphQL request body: the rendered query plus its variables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphQlRequest {
    pub query: String,
    pub variables: QueryVariables,
}

/// Named parameters of the sync query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryVariables {
    pub initial_finish_date_field: String,
    pub survey_id_field: String,
    pub num_records_per_request: usize,
    /// Kept as a string: the default start id ("-1") is not a valid record id.
    pub start_survey_id: String,
    /// Epoch seconds
    pub start_timestamp: i64,
    /// Epoch seconds
    pub end_timestamp: i64,
}

/// The values of one requested field. The Query API returns every field as a
/// list; only the first entry is consumed.
///
/// Entries are kept as raw JSON. Custom fields may hold nulls, numbers or
/// booleans, and one odd entry must not make the whole page undecodable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeValues {
    #[serde(default)]
    pub values: Option<Vec<Option<Value>>>,
}

impl NodeValues {
    /// First non-null scalar entry, rendered as text.
    pub fn first_scalar(&self) -> Option<String> {
        self.values
            .as_ref()?
            .iter()
            .flatten()
            .find_map(|value| match value {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                Value::Null | Value::Array(_) | Value::Object(_) => None,
            })
    }
}

/// One feedback record, keyed by the alias each field was requested under.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Node(pub BTreeMap<String, Option<NodeValues>>);

impl Node {
    /// First non-null scalar value of the given field, as text.
    pub fn first_value(&self, field: &str) -> Option<String> {
        self.0.get(field)?.as_ref()?.first_scalar()
    }

    /// Builder used by tests and tooling to assemble single-valued nodes.
    pub fn with_value(mut self, field: &str, value: &str) -> Self {
        self.0.insert(
            field.to_string(),
            Some(NodeValues {
                values: Some(vec![Some(Value::String(value.to_string()))]),
            }),
        );
        self
    }
}

/// One page of feedback: the nodes plus the total count matching the filter.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FeedbackPage {
    #[serde(rename = "totalCount")]
    pub total_count: u64,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryApiResponse {
    pub data: Option<DataWrapper>,
    #[serde(default)]
    pub errors: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataWrapper {
    pub feedback: Option<FeedbackPage>,
}

impl QueryApiResponse {
    /// Parse a raw response body.
    pub fn from_body(body: &str) -> Result<Self> {
        serde_json::from_str(body).context("Failed to parse Query API response")
    }

    /// Unwrap the feedback page, treating GraphQL errors as a failed request.
    pub fn into_page(self) -> Result<FeedbackPage> {
        if let Some(errors) = self.errors.filter(|errors| !errors.is_empty()) {
            let rendered = serde_json::to_string(&errors).unwrap_or_default();
            bail!("Query API returned {} error(s): {}", errors.len(), rendered);
        }

        self.data
            .and_then(|data| data.feedback)
            .context("Query API response is missing data.feedback")
    }
}
