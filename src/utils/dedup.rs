//! Cross-source deduplication of discovered papers.

use std::collections::HashSet;
use strsim::jaro_winkler;

use crate::models::DiscoveredPaper;

/// Title similarity at or above which two papers may be the same work
const TITLE_SIMILARITY_THRESHOLD: f64 = 0.95;

/// Find duplicate papers based on DOI, title similarity and author overlap
///
/// Returns groups of paper indices that are duplicates of each other
pub fn find_duplicates(papers: &[DiscoveredPaper]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut processed: HashSet<usize> = HashSet::new();

    for i in 0..papers.len() {
        if processed.contains(&i) {
            continue;
        }

        let mut group = vec![i];
        for (j, other) in papers.iter().enumerate().skip(i + 1) {
            if !processed.contains(&j) && are_duplicates(&papers[i], other) {
                group.push(j);
                processed.insert(j);
            }
        }

        if group.len() > 1 {
            groups.push(group);
        }
        processed.insert(i);
    }

    groups
}

/// Check if two papers are likely the same work found by different sources
fn are_duplicates(a: &DiscoveredPaper, b: &DiscoveredPaper) -> bool {
    // Copies from the same source are distinct results (e.g. cited and citing)
    if a.source == b.source {
        return false;
    }

    if let (Some(doi_a), Some(doi_b)) = (&a.doi, &b.doi) {
        return doi_a.eq_ignore_ascii_case(doi_b);
    }

    let title_a = normalize_title(&a.title);
    let title_b = normalize_title(&b.title);
    if title_a.is_empty() || title_b.is_empty() {
        return false;
    }

    (title_a == title_b || jaro_winkler(&title_a, &title_b) >= TITLE_SIMILARITY_THRESHOLD)
        && authors_match(a, b)
}

/// Check if authors approximately match
fn authors_match(a: &DiscoveredPaper, b: &DiscoveredPaper) -> bool {
    let authors_a: HashSet<String> = a.authors.iter().map(|s| s.trim().to_lowercase()).collect();
    let authors_b: HashSet<String> = b.authors.iter().map(|s| s.trim().to_lowercase()).collect();

    // Missing author info can't contradict a title match
    if authors_a.is_empty() || authors_b.is_empty() {
        return true;
    }

    authors_a.intersection(&authors_b).next().is_some()
}

/// Normalize a title for comparison
fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Merge duplicate groups, keeping the most relevant copy of each.
///
/// Order of the surviving papers is preserved.
pub fn deduplicate_papers(papers: Vec<DiscoveredPaper>) -> Vec<DiscoveredPaper> {
    let groups = find_duplicates(&papers);
    if groups.is_empty() {
        return papers;
    }

    let mut to_remove: HashSet<usize> = HashSet::new();
    for group in groups {
        let keep = group
            .iter()
            .copied()
            .max_by(|x, y| {
                papers[*x]
                    .relevance_score
                    .total_cmp(&papers[*y].relevance_score)
                    .then(y.cmp(x))
            })
            .unwrap_or(group[0]);
        to_remove.extend(group.into_iter().filter(|idx| *idx != keep));
    }

    papers
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !to_remove.contains(i))
        .map(|(_, p)| p)
        .collect()
}
