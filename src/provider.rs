use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;

use crate::context::RequestContext;
use crate::download::DownloadReport;
use crate::error::Result;
use crate::models::{Chapter, Manga, MangaInfo, SearchOptions};

/// A source adapter plugged into the engine
///
/// Ids passed to and returned from these methods are provider-local; the
/// `<provider>:<id>` form only exists at the engine boundary.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn site_url(&self) -> &str;

    /// One-time setup; repeated calls are no-ops
    async fn initialize(&self, ctx: &RequestContext) -> Result<()>;

    async fn search(&self, ctx: &RequestContext, query: &str, options: &SearchOptions) -> Result<Vec<Manga>>;

    async fn get_manga(&self, ctx: &RequestContext, id: &str) -> Result<MangaInfo>;

    async fn get_chapter(&self, ctx: &RequestContext, chapter_id: &str) -> Result<Chapter>;

    /// Best-effort lookup of the series a chapter belongs to; `None` is not an error
    async fn try_get_manga_for_chapter(&self, ctx: &RequestContext, chapter_id: &str) -> Result<Option<Manga>>;

    async fn download_chapter(
        &self,
        ctx: &RequestContext,
        chapter_id: &str,
        dest_dir: &Path,
    ) -> Result<DownloadReport>;

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id().to_string(),
            name: self.name().to_string(),
            description: self.description().to_string(),
            site_url: self.site_url().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub site_url: String,
}
