//! CrossRef discovery source implementation.

use async_trait::async_trait;
use serde::Deserialize;

use crate::models::{Paper, PaperBuilder, RelationshipType, SourceType};
use crate::sources::{
    endpoint, DiscoveryQuery, Source, SourceCapabilities, SourceError, SourceResponse,
};
use crate::utils::{api_retry_config, with_retry, HttpClient};

const CROSSREF_API_BASE: &str = "https://api.crossref.org";

/// Confidence for a reference entry CrossRef could not match to a DOI
const UNMATCHED_REFERENCE_CONFIDENCE: f64 = 0.4;

/// CrossRef discovery source
///
/// Uses the deposited reference lists for `Cites` and bibliographic search for
/// `SemanticSimilarity`. CrossRef does not expose citing works publicly.
#[derive(Debug, Clone)]
pub struct CrossRefSource {
    client: HttpClient,
    base_url: String,
    mailto: Option<String>,
}

impl CrossRefSource {
    pub fn new(mailto: Option<String>) -> Result<Self, SourceError> {
        let user_agent = match &mailto {
            Some(mail) => format!(
                "{}/{} (mailto:{})",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                mail
            ),
            None => format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        };
        Ok(Self {
            client: HttpClient::with_user_agent(&user_agent)?,
            base_url: CROSSREF_API_BASE.to_string(),
            mailto,
        })
    }

    /// Point the source at another API host (used by tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn polite(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.mailto {
            Some(mail) => request.query(&[("mailto", mail.as_str())]),
            None => request,
        }
    }

    async fn references(&self, doi: &str, max_results: usize) -> Result<Vec<Paper>, SourceError> {
        let url = endpoint(&self.base_url, &format!("works/{}", urlencoding::encode(doi)));

        let data: CRWorkResponse = with_retry(api_retry_config(), || {
            let request = self.polite(self.client.get(&url));
            self.client.fetch_json(request, "CrossRef")
        })
        .await?;

        Ok(data
            .message
            .reference
            .into_iter()
            .filter_map(parse_reference)
            .take(max_results)
            .collect())
    }

    async fn bibliographic_search(
        &self,
        query: &DiscoveryQuery,
    ) -> Result<(Vec<Paper>, usize), SourceError> {
        let url = endpoint(&self.base_url, "works");
        let title = query.paper.query_text();
        // One extra row in case the source paper itself comes back first
        let rows = (query.max_results + 1).to_string();

        let data: CRSearchResponse = with_retry(api_retry_config(), || {
            let request = self.polite(
                self.client
                    .get(&url)
                    .query(&[("query.bibliographic", title.as_str()), ("rows", rows.as_str())]),
            );
            self.client.fetch_json(request, "CrossRef")
        })
        .await?;

        let max_score = data
            .message
            .items
            .iter()
            .filter_map(|item| item.score)
            .fold(0.0_f64, f64::max);

        let own_doi = query.paper.doi.as_deref();
        let papers = data
            .message
            .items
            .into_iter()
            .filter(|item| {
                own_doi.is_none()
                    || item.doi.as_deref().map(str::to_lowercase).as_deref() != own_doi
            })
            .filter_map(|item| parse_item(item, max_score))
            .take(query.max_results)
            .collect();

        Ok((papers, data.message.total_results))
    }
}

#[async_trait]
impl Source for CrossRefSource {
    fn id(&self) -> &str {
        "crossref"
    }

    fn name(&self) -> &str {
        "CrossRef"
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::CITES | SourceCapabilities::SEMANTIC_SIMILARITY
    }

    fn reliability_score(&self) -> f64 {
        0.85
    }

    fn default_relevance(&self, relationship: RelationshipType) -> f64 {
        match relationship {
            RelationshipType::Cites => 0.7,
            _ => 0.5,
        }
    }

    async fn discover(&self, query: &DiscoveryQuery) -> Result<SourceResponse, SourceError> {
        match query.relationship {
            RelationshipType::Cites => {
                let doi = query.paper.doi.as_deref().ok_or_else(|| {
                    SourceError::InvalidRequest("CrossRef reference lookup needs a DOI".to_string())
                })?;
                let papers = self.references(doi, query.max_results).await?;
                Ok(SourceResponse::new(papers, doi))
            }
            RelationshipType::SemanticSimilarity => {
                let (papers, total) = self.bibliographic_search(query).await?;
                Ok(SourceResponse::new(papers, query.paper.query_text()).total_results(total))
            }
            other => Err(SourceError::UnsupportedRelationship(other)),
        }
    }
}

fn parse_reference(reference: CRReference) -> Option<Paper> {
    let title = reference
        .article_title
        .or(reference.volume_title)
        .or(reference.unstructured)?;
    let matched = reference.doi.is_some();

    let builder = PaperBuilder::new(
        reference.key.unwrap_or_else(|| title.clone()),
        title,
        SourceType::CrossRef,
    )
    .authors(reference.author)
    .doi(reference.doi.clone())
    .year(reference.year.and_then(|y| y.trim().parse().ok()))
    .venue(reference.journal_title)
    .url(reference.doi.map(|doi| format!("https://doi.org/{}", doi)));

    Some(if matched {
        builder.build()
    } else {
        builder.confidence(UNMATCHED_REFERENCE_CONFIDENCE).build()
    })
}

fn parse_item(item: CRItem, max_score: f64) -> Option<Paper> {
    let title = item.title.into_iter().next().filter(|t| !t.is_empty())?;
    let authors = item.author.into_iter().map(|a| match (a.given, a.family) {
        (Some(given), Some(family)) => format!("{} {}", given, family),
        (None, Some(family)) => family,
        (Some(given), None) => given,
        (None, None) => a.name.unwrap_or_default(),
    });
    let year = item
        .issued
        .and_then(|issued| issued.date_parts.into_iter().next())
        .and_then(|parts| parts.into_iter().next().flatten());

    let builder = PaperBuilder::new(item.doi.clone().unwrap_or_else(|| title.clone()), title, SourceType::CrossRef)
        .authors(authors)
        .doi(item.doi)
        .year(year)
        .venue(item.container_title.into_iter().next())
        .url(item.url)
        .citations(item.is_referenced_by_count);

    Some(match item.score {
        Some(score) if max_score > 0.0 => builder.relevance(score / max_score).build(),
        _ => builder.build(),
    })
}

// ===== CrossRef API Types =====

#[derive(Debug, Deserialize)]
struct CRWorkResponse {
    message: CRWork,
}

#[derive(Debug, Deserialize)]
struct CRWork {
    #[serde(default)]
    reference: Vec<CRReference>,
}

#[derive(Debug, Deserialize)]
struct CRReference {
    key: Option<String>,
    #[serde(rename = "DOI")]
    doi: Option<String>,
    #[serde(rename = "article-title")]
    article_title: Option<String>,
    #[serde(rename = "volume-title")]
    volume_title: Option<String>,
    #[serde(rename = "journal-title")]
    journal_title: Option<String>,
    author: Option<String>,
    year: Option<String>,
    unstructured: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CRSearchResponse {
    message: CRMessage,
}

#[derive(Debug, Deserialize)]
struct CRMessage {
    #[serde(rename = "total-results", default)]
    total_results: usize,
    #[serde(default)]
    items: Vec<CRItem>,
}

#[derive(Debug, Deserialize)]
struct CRItem {
    #[serde(rename = "DOI")]
    doi: Option<String>,
    #[serde(default)]
    title: Vec<String>,
    #[serde(default)]
    author: Vec<CRAuthor>,
    #[serde(rename = "container-title", default)]
    container_title: Vec<String>,
    issued: Option<CRDate>,
    #[serde(rename = "is-referenced-by-count")]
    is_referenced_by_count: Option<u32>,
    score: Option<f64>,
    #[serde(rename = "URL")]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CRAuthor {
    given: Option<String>,
    family: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CRDate {
    #[serde(rename = "date-parts", default)]
    date_parts: Vec<Vec<Option<i32>>>,
}
