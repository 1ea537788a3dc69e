//! Engine configuration.
use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix of the numbering scope, `"<namespace>:<typeCode>"`.
    pub number_namespace: String,
    /// Prefix of the approval step tag, `"<prefix><typeCode>"`.
    pub approval_tag_prefix: String,
    /// Zero padding of the built-in document number counter.
    pub number_width: usize,
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            number_namespace: "dynamic".into(),
            approval_tag_prefix: "dynamic_".into(),
            number_width: 5,
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(raw).context("failed to parse engine config")?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.number_namespace.trim().is_empty() {
            anyhow::bail!("number_namespace must not be empty");
        }
        if self.default_page_size == 0 || self.max_page_size < self.default_page_size {
            anyhow::bail!(
                "page sizes must satisfy 0 < default_page_size ({}) <= max_page_size ({})",
                self.default_page_size,
                self.max_page_size
            );
        }
        Ok(())
    }

    pub fn number_scope(&self, type_code: &str) -> String {
        format!("{}:{}", self.number_namespace, type_code)
    }

    pub fn approval_tag(&self, type_code: &str) -> String {
        format!("{}{}", self.approval_tag_prefix, type_code)
    }
}

/// 1-based page request. `per_page == 0` selects the configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 0,
        }
    }
}

impl Pagination {
    pub fn new(page: u32, per_page: u32) -> Self {
        Self { page, per_page }
    }

    pub(crate) fn resolve(self, config: &EngineConfig) -> (u32, u32) {
        let per_page = match self.per_page {
            0 => config.default_page_size,
            n => n.min(config.max_page_size),
        };
        (self.page.max(1), per_page.max(1))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: u32,
}

impl<T> Page<T> {
    pub(crate) fn slice(all: Vec<T>, pagination: Pagination, config: &EngineConfig) -> Self {
        let (page, per_page) = pagination.resolve(config);
        let total = all.len();
        let total_pages = total.div_ceil(per_page as usize) as u32;
        let skip = (page as usize - 1) * per_page as usize;
        let items = all.into_iter().skip(skip).take(per_page as usize).collect();

        Page {
            items,
            total,
            page,
            per_page,
            total_pages,
        }
    }

    pub(crate) fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<Page<U>, E> {
        Ok(Page {
            items: self.items.into_iter().map(f).collect::<Result<Vec<_>, E>>()?,
            total: self.total,
            page: self.page,
            per_page: self.per_page,
            total_pages: self.total_pages,
        })
    }
}
