// ABOUTME: Query builder for the paginated, watermark-bounded feedback query
// ABOUTME: Renders the GraphQL template once and fills in per-page variables

use chrono::{DateTime, Utc};

use super::sink::{FINISH_DATE_ALIAS, SURVEY_ID_ALIAS};
use super::watermark::Watermark;
use crate::remote::models::{GraphQlRequest, QueryVariables};

/// Hard ceiling on records per page, regardless of configuration.
pub const MAX_RECORDS_PER_REQUEST: usize = 1000;

/// Clamp a configured page size to `1..=MAX_RECORDS_PER_REQUEST`.
/// Zero means "use the ceiling".
pub fn clamp_page_size(requested: usize) -> usize {
    if requested == 0 {
        MAX_RECORDS_PER_REQUEST
    } else {
        requested.min(MAX_RECORDS_PER_REQUEST)
    }
}

/// Where to start when nothing has been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPoint {
    pub timestamp: DateTime<Utc>,
    /// Sent verbatim; typically "-1" so the first record at `timestamp` is included.
    pub survey_id: String,
}

/// Field ids and caller-supplied GraphQL fragments the query is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFields {
    pub survey_id_field: String,
    pub initial_finish_date_field: String,
    /// Extra conjuncts of the `and` filter, passed through untouched.
    pub business_filter: String,
    /// Extra node selections, passed through untouched.
    pub custom_nodes: String,
}

/// Builds the sync query for one page.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    template: String,
    survey_id_field: String,
    initial_finish_date_field: String,
}

impl QueryBuilder {
    pub fn new(fields: &QueryFields) -> Self {
        let template = render_template(&fields.business_filter, &fields.custom_nodes);
        tracing::info!("GraphQL template:\n{}", template);

        Self {
            template,
            survey_id_field: fields.survey_id_field.clone(),
            initial_finish_date_field: fields.initial_finish_date_field.clone(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Build the request for the page following `watermark` (or `default_start`
    /// when nothing has been consumed), bounded above by `snapshot_cutoff`.
    pub fn build(
        &self,
        watermark: Option<&Watermark>,
        default_start: &StartPoint,
        snapshot_cutoff: DateTime<Utc>,
        page_size: usize,
    ) -> GraphQlRequest {
        let (start_timestamp, start_survey_id) = match watermark {
            Some(watermark) => (watermark.epoch_secs(), watermark.survey_id.to_string()),
            None => (
                default_start.timestamp.timestamp(),
                default_start.survey_id.clone(),
            ),
        };

        let request = GraphQlRequest {
            query: self.template.clone(),
            variables: QueryVariables {
                initial_finish_date_field: self.initial_finish_date_field.clone(),
                survey_id_field: self.survey_id_field.clone(),
                num_records_per_request: clamp_page_size(page_size),
                start_survey_id,
                start_timestamp,
                end_timestamp: snapshot_cutoff.timestamp(),
            },
        };

        tracing::trace!("GraphQL request variables: {:?}", request.variables);
        request
    }
}

/// The lower bound `finishDate > start OR (finishDate >= start AND surveyId > startId)`
/// together with ascending (finishDate, surveyId) order means "everything after
/// the watermark". The `>=` branch only matters at equality.
fn render_template(business_filter: &str, custom_nodes: &str) -> String {
    format!(
        r#"query syncQuery(
    $endTimestamp: String!,
    $initialFinishDateField: ID!,
    $numRecordsPerRequest: Int!,
    $surveyIdField: ID!,
    $startSurveyId: String!,
    $startTimestamp: String!
) {{
  feedback(
    first: $numRecordsPerRequest
    orderBy: [
      {{ direction: ASC  fieldId: $initialFinishDateField }}
      {{ direction: ASC  fieldId: $surveyIdField }}
    ]
    filter: {{ and: [
      {business_filter}
      {{ fieldIds: [ $initialFinishDateField ], lt: $endTimestamp }}
      {{ or: [
        {{ fieldIds: [ $initialFinishDateField ], gt: $startTimestamp }}
        {{ and: [
          {{ fieldIds: [ $initialFinishDateField ], gte: $startTimestamp }}
          {{ fieldIds: [ $surveyIdField ], gt: $startSurveyId }}
        ] }}
      ] }}
    ] }}
  ) {{
    totalCount
    nodes {{
      {survey_id_alias}: fieldData(fieldId: $surveyIdField) {{ values }}
      {finish_date_alias}: fieldData(fieldId: $initialFinishDateField) {{ values }}
      {custom_nodes}
    }}
  }}
}}"#,
        business_filter = business_filter,
        custom_nodes = custom_nodes,
        survey_id_alias = SURVEY_ID_ALIAS,
        finish_date_alias = FINISH_DATE_ALIAS,
    )
}
