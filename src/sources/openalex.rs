//! OpenAlex discovery source implementation.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

use crate::models::{Paper, PaperBuilder, RelationshipType, SourceType};
use crate::sources::{
    endpoint, DiscoveryQuery, Source, SourceCapabilities, SourceError, SourceResponse,
};
use crate::utils::{api_retry_config, with_retry, HttpClient};

const OPENALEX_API_BASE: &str = "https://api.openalex.org";

/// OpenAlex discovery source
///
/// Resolves the source paper to an OpenAlex work id, then walks the graph with
/// the `cited_by`, `cites` and `related_to` work filters.
#[derive(Debug, Clone)]
pub struct OpenAlexSource {
    client: HttpClient,
    base_url: String,
    email: Option<String>,
}

impl OpenAlexSource {
    /// Create a new OpenAlex source; an email joins the polite pool
    pub fn new(email: Option<String>) -> Result<Self, SourceError> {
        let client = match &email {
            Some(email) => HttpClient::with_user_agent(&format!(
                "{}/{} (mailto:{})",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                email
            ))?,
            None => HttpClient::new()?,
        };
        Ok(Self {
            client,
            base_url: OPENALEX_API_BASE.to_string(),
            email,
        })
    }

    /// Point the source at another API host (used by tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let url = endpoint(&self.base_url, path);
        with_retry(api_retry_config(), || {
            let mut request = self.client.get(&url).query(params);
            if let Some(email) = &self.email {
                request = request.query(&[("mailto", email.as_str())]);
            }
            self.client.fetch_json(request, "OpenAlex")
        })
        .await
    }

    /// Short work id (`W123...`) of the source paper
    async fn resolve_work_id(&self, query: &DiscoveryQuery) -> Result<String, SourceError> {
        let work: OAWork = match &query.paper.doi {
            Some(doi) => self.get_json(&format!("works/doi:{}", doi), &[]).await?,
            None => {
                if query.paper.title.trim().is_empty() {
                    return Err(SourceError::InvalidRequest(
                        "OpenAlex lookup needs a DOI or a title".to_string(),
                    ));
                }
                let data: OAWorksResponse = self
                    .get_json(
                        "works",
                        &[
                            ("search", query.paper.title.clone()),
                            ("per-page", "1".to_string()),
                        ],
                    )
                    .await?;
                data.results.into_iter().next().ok_or_else(|| {
                    SourceError::NotFound(format!("no work titled '{}'", query.paper.title))
                })?
            }
        };

        work.id
            .as_deref()
            .map(short_id)
            .ok_or_else(|| SourceError::Parse("OpenAlex work without id".to_string()))
    }
}

#[async_trait]
impl Source for OpenAlexSource {
    fn id(&self) -> &str {
        "openalex"
    }

    fn name(&self) -> &str {
        "OpenAlex"
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::CITES
            | SourceCapabilities::CITED_BY
            | SourceCapabilities::SEMANTIC_SIMILARITY
    }

    fn reliability_score(&self) -> f64 {
        0.8
    }

    fn default_relevance(&self, relationship: RelationshipType) -> f64 {
        match relationship {
            RelationshipType::Cites | RelationshipType::CitedBy => 0.6,
            _ => 0.55,
        }
    }

    async fn discover(&self, query: &DiscoveryQuery) -> Result<SourceResponse, SourceError> {
        let filter = match query.relationship {
            RelationshipType::Cites => "cited_by",
            RelationshipType::CitedBy => "cites",
            RelationshipType::SemanticSimilarity => "related_to",
            other => return Err(SourceError::UnsupportedRelationship(other)),
        };

        let work_id = self.resolve_work_id(query).await?;
        let data: OAWorksResponse = self
            .get_json(
                "works",
                &[
                    ("filter", format!("{}:{}", filter, work_id)),
                    ("per-page", query.max_results.to_string()),
                ],
            )
            .await?;

        let total = data.meta.and_then(|m| m.count);
        let papers: Vec<Paper> = data
            .results
            .into_iter()
            .filter_map(parse_work)
            .take(query.max_results)
            .collect();

        let response = SourceResponse::new(papers, work_id);
        Ok(match total {
            Some(total) => response.total_results(total),
            None => response,
        })
    }
}

/// `https://openalex.org/W2741809807` -> `W2741809807`
fn short_id(id: &str) -> String {
    id.rsplit('/').next().unwrap_or(id).to_string()
}

fn parse_work(work: OAWork) -> Option<Paper> {
    let title = work.title.filter(|t| !t.is_empty())?;
    let paper_id = work.id.as_deref().map(short_id).unwrap_or_else(|| title.clone());
    let r#abstract = work.abstract_inverted_index.as_ref().map(rebuild_abstract);
    let venue = work
        .primary_location
        .and_then(|loc| loc.source)
        .and_then(|source| source.display_name);
    let url = work.doi.clone().or(work.id);

    Some(
        PaperBuilder::new(paper_id, title, SourceType::OpenAlex)
            .authors(
                work.authorships
                    .into_iter()
                    .filter_map(|a| a.author.and_then(|author| author.display_name)),
            )
            .abstract_text(r#abstract)
            .doi(work.doi)
            .year(work.publication_year)
            .venue(venue)
            .url(url)
            .citations(work.cited_by_count)
            .build(),
    )
}

/// OpenAlex ships abstracts as word -> positions; put the words back in order
fn rebuild_abstract(index: &HashMap<String, Vec<usize>>) -> String {
    let mut positioned: Vec<(usize, &str)> = index
        .iter()
        .flat_map(|(word, positions)| positions.iter().map(move |p| (*p, word.as_str())))
        .collect();
    positioned.sort_unstable_by_key(|(position, _)| *position);
    positioned
        .into_iter()
        .map(|(_, word)| word)
        .collect::<Vec<_>>()
        .join(" ")
}

// ===== OpenAlex API Types =====

#[derive(Debug, Deserialize)]
struct OAWorksResponse {
    meta: Option<OAMeta>,
    #[serde(default)]
    results: Vec<OAWork>,
}

#[derive(Debug, Deserialize)]
struct OAMeta {
    count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OAWork {
    id: Option<String>,
    doi: Option<String>,
    title: Option<String>,
    publication_year: Option<i32>,
    cited_by_count: Option<u32>,
    #[serde(default)]
    authorships: Vec<OAAuthorship>,
    primary_location: Option<OALocation>,
    abstract_inverted_index: Option<HashMap<String, Vec<usize>>>,
}

#[derive(Debug, Deserialize)]
struct OAAuthorship {
    author: Option<OAAuthor>,
}

#[derive(Debug, Deserialize)]
struct OAAuthor {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OALocation {
    source: Option<OASource>,
}

#[derive(Debug, Deserialize)]
struct OASource {
    display_name: Option<String>,
}
