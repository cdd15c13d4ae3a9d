use anyhow::{Result, bail};
use serde::Serialize;

/// Page rules always outrank category rules.
pub const PAGE_RULE_PRIORITY: i64 = 999;
pub const CONTENT_AREA_SCORE: i64 = 3;
pub const CATEGORY_SCORE: i64 = 2;
pub const MAX_RULE_CATEGORIES: usize = 4;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Link {
    pub link_id: i64,
    pub url: String,
    pub text: String,
}

/// What a rule matches. A rule is created as one variant and never changes
/// kind afterwards.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum RuleMatch {
    Page {
        page_id: i64,
    },
    Categories {
        content_area: Option<String>,
        categories: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Rule {
    pub rule_id: i64,
    pub link_id: i64,
    pub fallback: bool,
    pub priority: i64,
    pub matcher: RuleMatch,
}

impl RuleMatch {
    /// Validate and classify raw rule inputs. Category names are normalized
    /// and de-duplicated (first occurrence wins) before the category count is
    /// fixed. A present `page_id` always wins over category inputs.
    pub fn classify(
        page_id: Option<i64>,
        content_area: Option<&str>,
        categories: &[String],
    ) -> Result<Self> {
        if let Some(page_id) = page_id {
            if page_id <= 0 {
                bail!("page id must be positive, got {page_id}");
            }
            return Ok(Self::Page { page_id });
        }

        let content_area = content_area.and_then(normalize_category_name);
        let categories = dedup_categories(categories);
        if content_area.is_none() && categories.is_empty() {
            bail!("a category rule needs a content area or at least one category");
        }
        if categories.len() > MAX_RULE_CATEGORIES {
            bail!(
                "a category rule holds at most {MAX_RULE_CATEGORIES} categories, got {}",
                categories.len()
            );
        }
        Ok(Self::Categories {
            content_area,
            categories,
        })
    }

    /// Score for the candidate feed ordering. Page rules are pinned above
    /// every possible category score.
    pub fn priority(&self) -> i64 {
        match self {
            Self::Page { .. } => PAGE_RULE_PRIORITY,
            Self::Categories {
                content_area,
                categories,
            } => {
                let content_area_score = if content_area.is_some() {
                    CONTENT_AREA_SCORE
                } else {
                    0
                };
                content_area_score + CATEGORY_SCORE * categories.len() as i64
            }
        }
    }

    pub fn is_page(&self) -> bool {
        matches!(self, Self::Page { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Page { .. } => "page",
            Self::Categories { .. } => "category",
        }
    }
}

/// Canonical category form: trimmed, spaces collapsed to underscores.
/// Returns None for blank input.
pub fn normalize_category_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.replace(' ', "_"))
}

fn dedup_categories(categories: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in categories {
        if let Some(normalized) = normalize_category_name(raw)
            && !out.contains(&normalized)
        {
            out.push(normalized);
        }
    }
    out
}
