use anyhow::{Context, Result, anyhow};
use reqwest::Url;
use serde::Serialize;

use crate::config::ToolConfig;
use crate::runtime::ResolvedPaths;
use crate::store;

/// Placeholder operators embed in link text where the tracked URL belongs.
pub const URL_PLACEHOLDER: &str = "{{{url}}}";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RenderedLink {
    pub link_id: i64,
    pub url: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageLinksReport {
    pub page_id: i64,
    pub page_title: String,
    pub links: Vec<RenderedLink>,
}

/// The campaign source identifies the placing site: its host (scheme
/// stripped) plus the content language as a path segment.
pub fn utm_source(server: &str, language: &str) -> String {
    let host = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("http://"))
        .unwrap_or(server);
    format!("{}/{language}", host.trim_end_matches('/'))
}

/// Final tracked URL for one link: the stored destination with campaign
/// parameters appended to whatever query it already carries. The link id
/// rides in `utm_campaign` so clicks attribute per link.
pub fn campaign_url(destination: &str, link_id: i64, source: &str) -> Result<String> {
    let mut url = Url::parse(destination)
        .with_context(|| format!("link URL does not parse: {destination}"))?;
    url.query_pairs_mut()
        .append_pair("utm_source", source)
        .append_pair("utm_medium", "website")
        .append_pair("utm_campaign", &link_id.to_string());
    Ok(url.to_string())
}

/// Substitute every URL placeholder in the display text.
pub fn rendered_text(text: &str, final_url: &str) -> String {
    text.replace(URL_PLACEHOLDER, final_url)
}

/// Display payload for one page's assigned links: tracked URLs plus
/// placeholder-substituted text. Pure data, no markup.
pub fn render_links_for_page(
    paths: &ResolvedPaths,
    config: &ToolConfig,
    page_ref: &str,
) -> Result<PageLinksReport> {
    let server = config.site_server().ok_or_else(|| {
        anyhow!(
            "no site server configured.\nSet [site] server (or [wiki] api_url) in config.toml so rendered URLs carry utm_source."
        )
    })?;
    let source = utm_source(&server, config.site_language());

    let connection = store::open_connection(&paths.db_path)?;
    let page_id = store::resolve_page_ref(&connection, page_ref)?;
    let page = store::find_page_by_id(&connection, page_id)?
        .with_context(|| format!("page {page_id} not found in the local mirror"))?;

    let mut links = Vec::new();
    for link in store::links_for_page_id(&connection, page_id)? {
        let url = campaign_url(&link.url, link.link_id, &source)?;
        let text = rendered_text(&link.text, &url);
        links.push(RenderedLink {
            link_id: link.link_id,
            url,
            text,
        });
    }

    Ok(PageLinksReport {
        page_id: page.page_id,
        page_title: page.title,
        links,
    })
}
