use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{Result, UndoError};

use super::undo::layout;

/// Configuration for undo segment management.
///
/// Loadable from TOML; every field has a default so partial files work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UndoOptions {
    /// Size of every page in bytes. Power of two between 4 KiB and 64 KiB.
    pub page_size: u32,
    /// Free-offset threshold under which a one-page segment is cached at
    /// commit. Defaults to three quarters of the page size.
    pub reuse_limit: Option<u32>,
    /// Extents reserved while creating a new undo segment.
    pub segment_create_extents: u32,
    /// Extents reserved while adding a page to an undo segment.
    pub page_add_extents: u32,
    /// Size cap, in pages, written into new rollback segment headers.
    pub rseg_max_size: u32,
}

impl Default for UndoOptions {
    fn default() -> Self {
        Self {
            page_size: 16 * 1024,
            reuse_limit: None,
            segment_create_extents: 2,
            page_add_extents: 1,
            rseg_max_size: u32::MAX - 1,
        }
    }
}

impl UndoOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the page size.
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Overrides the reuse limit.
    pub fn reuse_limit(mut self, bytes: u32) -> Self {
        self.reuse_limit = Some(bytes);
        self
    }

    /// Sets the extents reserved per segment creation.
    pub fn segment_create_extents(mut self, n: u32) -> Self {
        self.segment_create_extents = n;
        self
    }

    /// Sets the extents reserved per added page.
    pub fn page_add_extents(mut self, n: u32) -> Self {
        self.page_add_extents = n;
        self
    }

    /// Sets the rollback segment size cap.
    pub fn rseg_max_size(mut self, pages: u32) -> Self {
        self.rseg_max_size = pages;
        self
    }

    /// Effective reuse limit in bytes.
    pub fn effective_reuse_limit(&self) -> usize {
        self.reuse_limit
            .map(|limit| limit as usize)
            .unwrap_or(3 * self.page_size as usize / 4)
    }

    /// Number of undo slots on a rollback segment header page.
    pub fn n_slots(&self) -> usize {
        self.page_size as usize / 16
    }

    /// Checks the options for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || !(4096..=65536).contains(&self.page_size) {
            return Err(UndoError::Invalid(
                "page size must be a power of two between 4096 and 65536",
            ));
        }
        let page_size = self.page_size as usize;
        let limit = self.effective_reuse_limit();
        if limit <= layout::HEADER_REGION_END + layout::log_hdr::XA_HDR_SIZE {
            return Err(UndoError::Invalid("reuse limit leaves no room for records"));
        }
        if limit + layout::log_hdr::XA_HDR_SIZE + layout::HEADER_CREATE_MARGIN >= page_size {
            return Err(UndoError::Invalid(
                "reuse limit leaves no room for another log header",
            ));
        }
        if self.segment_create_extents == 0 || self.page_add_extents == 0 {
            return Err(UndoError::Invalid("extent reservations must be positive"));
        }
        if self.rseg_max_size < 2 {
            return Err(UndoError::Invalid("rollback segment cap below two pages"));
        }
        Ok(())
    }

    /// Parses and validates options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: UndoOptions =
            toml::from_str(text).map_err(|err| UndoError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Loads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
