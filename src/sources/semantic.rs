//! Semantic Scholar discovery source implementation.

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::Deserialize;

use crate::models::{Paper, PaperBuilder, RelationshipType, SourceType};
use crate::sources::{
    endpoint, DiscoveryQuery, Source, SourceCapabilities, SourceError, SourceResponse,
};
use crate::utils::{api_retry_config, with_retry, HttpClient};

const SEMANTIC_API_ROOT: &str = "https://api.semanticscholar.org";

const PAPER_FIELDS: &str =
    "paperId,title,authors,venue,year,externalIds,citationCount,influentialCitationCount,url";

/// Relevance added for citations Semantic Scholar marks as influential
const INFLUENTIAL_BOOST: f64 = 0.15;

/// Semantic Scholar discovery source
///
/// Uses the Graph API for references and citations and the Recommendations API
/// for content similarity.
#[derive(Debug, Clone)]
pub struct SemanticScholarSource {
    client: HttpClient,
    root_url: String,
    api_key: Option<String>,
}

impl SemanticScholarSource {
    pub fn new(api_key: Option<String>) -> Result<Self, SourceError> {
        Ok(Self {
            client: HttpClient::new()?,
            root_url: SEMANTIC_API_ROOT.to_string(),
            api_key,
        })
    }

    /// Point the source at another API host (used by tests)
    pub fn with_base_url(mut self, root_url: impl Into<String>) -> Self {
        self.root_url = root_url.into();
        self
    }

    fn graph_url(&self, path: &str) -> String {
        endpoint(&endpoint(&self.root_url, "graph/v1"), path)
    }

    fn recommendations_url(&self, path: &str) -> String {
        endpoint(&endpoint(&self.root_url, "recommendations/v1"), path)
    }

    /// Add API key to request headers if available
    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<T, SourceError> {
        with_retry(api_retry_config(), || {
            let request = self.authorize(self.client.get(url).query(params));
            self.client.fetch_json(request, "Semantic Scholar")
        })
        .await
    }

    /// Semantic Scholar id for the source paper: `DOI:<doi>` or a title match
    async fn resolve_paper_id(&self, query: &DiscoveryQuery) -> Result<String, SourceError> {
        if let Some(doi) = &query.paper.doi {
            return Ok(format!("DOI:{}", doi));
        }
        if query.paper.title.trim().is_empty() {
            return Err(SourceError::InvalidRequest(
                "Semantic Scholar lookup needs a DOI or a title".to_string(),
            ));
        }

        let search: S2SearchResponse = self
            .get_json(
                &self.graph_url("paper/search"),
                &[
                    ("query", query.paper.title.clone()),
                    ("limit", "1".to_string()),
                    ("fields", "paperId".to_string()),
                ],
            )
            .await?;

        search
            .data
            .into_iter()
            .find_map(|p| p.paper_id)
            .ok_or_else(|| SourceError::NotFound(format!("no paper titled '{}'", query.paper.title)))
    }

    fn parse_paper(&self, data: S2Paper, relationship: RelationshipType, influential: bool) -> Option<Paper> {
        let title = data.title.filter(|t| !t.is_empty())?;
        let paper_id = data.paper_id.unwrap_or_else(|| title.clone());
        let doi = data.external_ids.and_then(|ids| ids.doi);
        let url = data
            .url
            .or_else(|| doi.as_ref().map(|doi| format!("https://doi.org/{}", doi)));

        let builder = PaperBuilder::new(paper_id, title, SourceType::SemanticScholar)
            .authors(data.authors.into_iter().filter_map(|a| a.name))
            .doi(doi)
            .year(data.year)
            .venue(data.venue)
            .url(url)
            .citations(data.citation_count)
            .influential_citations(data.influential_citation_count);

        Some(if influential {
            builder
                .relevance(self.default_relevance(relationship) + INFLUENTIAL_BOOST)
                .extra("is_influential", serde_json::Value::Bool(true))
                .build()
        } else {
            builder.build()
        })
    }
}

#[async_trait]
impl Source for SemanticScholarSource {
    fn id(&self) -> &str {
        "semantic_scholar"
    }

    fn name(&self) -> &str {
        "Semantic Scholar"
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::CITES
            | SourceCapabilities::CITED_BY
            | SourceCapabilities::SEMANTIC_SIMILARITY
    }

    fn reliability_score(&self) -> f64 {
        0.9
    }

    fn default_relevance(&self, relationship: RelationshipType) -> f64 {
        match relationship {
            RelationshipType::Cites => 0.75,
            RelationshipType::CitedBy => 0.7,
            _ => 0.65,
        }
    }

    async fn discover(&self, query: &DiscoveryQuery) -> Result<SourceResponse, SourceError> {
        if !self.supports(query.relationship) {
            return Err(SourceError::UnsupportedRelationship(query.relationship));
        }

        let paper_id = self.resolve_paper_id(query).await?;
        let params = [
            ("fields", PAPER_FIELDS.to_string()),
            ("limit", query.max_results.to_string()),
        ];

        let papers: Vec<Paper> = match query.relationship {
            RelationshipType::Cites => {
                let data: S2EdgeResponse = self
                    .get_json(&self.graph_url(&format!("paper/{}/references", paper_id)), &params)
                    .await?;
                data.data
                    .into_iter()
                    .filter_map(|edge| {
                        let influential = edge.is_influential.unwrap_or(false);
                        edge.cited_paper
                            .and_then(|p| self.parse_paper(p, query.relationship, influential))
                    })
                    .collect()
            }
            RelationshipType::CitedBy => {
                let data: S2EdgeResponse = self
                    .get_json(&self.graph_url(&format!("paper/{}/citations", paper_id)), &params)
                    .await?;
                data.data
                    .into_iter()
                    .filter_map(|edge| {
                        let influential = edge.is_influential.unwrap_or(false);
                        edge.citing_paper
                            .and_then(|p| self.parse_paper(p, query.relationship, influential))
                    })
                    .collect()
            }
            _ => {
                let data: S2RecommendationResponse = self
                    .get_json(
                        &self.recommendations_url(&format!("papers/forpaper/{}", paper_id)),
                        &params,
                    )
                    .await?;
                data.recommended_papers
                    .into_iter()
                    .filter_map(|p| self.parse_paper(p, query.relationship, false))
                    .collect()
            }
        };

        Ok(SourceResponse::new(
            papers.into_iter().take(query.max_results).collect(),
            paper_id,
        ))
    }
}

// ===== Semantic Scholar API Types =====

#[derive(Debug, Deserialize)]
struct S2SearchResponse {
    #[serde(default)]
    data: Vec<S2Paper>,
}

#[derive(Debug, Deserialize)]
struct S2EdgeResponse {
    #[serde(default)]
    data: Vec<S2Edge>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Edge {
    cited_paper: Option<S2Paper>,
    citing_paper: Option<S2Paper>,
    is_influential: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2RecommendationResponse {
    #[serde(default)]
    recommended_papers: Vec<S2Paper>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Paper {
    paper_id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    authors: Vec<S2Author>,
    venue: Option<String>,
    year: Option<i32>,
    external_ids: Option<S2ExternalIds>,
    citation_count: Option<u32>,
    influential_citation_count: Option<u32>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct S2Author {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct S2ExternalIds {
    #[serde(rename = "DOI")]
    doi: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourcePaper;
    use mockito::Matcher;

    fn source(base: &str) -> SemanticScholarSource {
        SemanticScholarSource::new(Some("test-key".to_string()))
            .unwrap()
            .with_base_url(base)
    }

    #[tokio::test]
    async fn test_citations_with_influential_boost() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/graph/v1/paper/DOI:10.1000/source/citations")
            .match_query(Matcher::UrlEncoded("limit".into(), "5".into()))
            .match_header("x-api-key", "test-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data": [
                    {"isInfluential": true, "citingPaper": {"paperId": "abc", "title": "Influential Follow-up",
                      "authors": [{"name": "Grace Hopper"}], "year": 2022,
                      "externalIds": {"DOI": "10.1000/Follow"}, "citationCount": 7}},
                    {"isInfluential": false, "citingPaper": {"paperId": "def", "title": "Minor Follow-up"}},
                    {"citingPaper": {"paperId": "ghi", "title": null}}
                ]}"#,
            )
            .create_async()
            .await;

        let query = DiscoveryQuery::new(
            SourcePaper::new("Source").with_doi("10.1000/source"),
            RelationshipType::CitedBy,
            5,
        );
        let response = source(&server.url()).discover(&query).await.unwrap();
        mock.assert_async().await;

        assert_eq!(response.query, "DOI:10.1000/source");
        assert_eq!(response.papers.len(), 2);
        let influential = &response.papers[0];
        assert_eq!(influential.doi.as_deref(), Some("10.1000/follow"));
        assert_eq!(influential.url.as_deref(), Some("https://doi.org/10.1000/follow"));
        assert!((influential.relevance.unwrap() - 0.85).abs() < 1e-9);
        assert_eq!(response.papers[1].relevance, None);
    }

    #[tokio::test]
    async fn test_recommendations_resolve_id_by_title() {
        let mut server = mockito::Server::new_async().await;
        let search = server
            .mock("GET", "/graph/v1/paper/search")
            .match_query(Matcher::UrlEncoded("query".into(), "Graph Neural Networks".into()))
            .with_status(200)
            .with_body(r#"{"data": [{"paperId": "s2id"}]}"#)
            .create_async()
            .await;
        let recommendations = server
            .mock("GET", "/recommendations/v1/papers/forpaper/s2id")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"recommendedPapers": [
                    {"paperId": "r1", "title": "Related One", "authors": [{"name": "A"}]},
                    {"paperId": "r2", "title": "Related Two", "authors": [{"name": "B"}]}
                ]}"#,
            )
            .create_async()
            .await;

        let query = DiscoveryQuery::new(
            SourcePaper::new("Graph Neural Networks"),
            RelationshipType::SemanticSimilarity,
            1,
        );
        let response = source(&server.url()).discover(&query).await.unwrap();
        search.assert_async().await;
        recommendations.assert_async().await;

        assert_eq!(response.papers.len(), 1);
        assert_eq!(response.papers[0].paper_id, "r1");
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/graph/v1/paper/DOI:10.1000/source/references")
            .match_query(Matcher::Any)
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let query = DiscoveryQuery::new(
            SourcePaper::new("Source").with_doi("10.1000/source"),
            RelationshipType::Cites,
            5,
        );
        let result = source(&server.url()).discover(&query).await;
        mock.assert_async().await;
        assert!(matches!(result, Err(SourceError::Api { status: 400, .. })));
    }
}
