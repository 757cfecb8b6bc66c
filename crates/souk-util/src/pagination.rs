use serde::Deserialize;

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE_SIZE: u32 = 500;

/// Forward cursor over an id-ordered log.
#[derive(Debug, Default, Deserialize)]
pub struct AfterParams {
    pub after: Option<i64>,
    pub limit: Option<u32>,
}

impl AfterParams {
    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }
}
