use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

diesel::define_sql_function! {
    /// Represents the sql `lower` function, used for case insensitive name lookups.
    fn lower(x: diesel::sql_types::Varchar) -> diesel::sql_types::Varchar;
}

lazy_static! {
    pub static ref NOT_BLANK_REGEX: Regex = Regex::new(r".*\S.*").expect("Failed to compile regex");
}

/// Wrapper to display an Option, formatting None as '-'.
pub struct OptFmt<T>(pub Option<T>);

impl<T: fmt::Display> fmt::Display for OptFmt<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref t) = self.0 {
            fmt::Display::fmt(t, f)
        } else {
            f.write_str("-")
        }
    }
}

#[derive(Deserialize)]
pub struct PageParameters {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl PageParameters {
    /// Effective page size, falling back to the given default and capped at 100.
    pub fn limit_or(&self, default: u32) -> i64 {
        i64::from(self.limit.unwrap_or(default).clamp(1, 100))
    }

    pub fn offset(&self, limit: i64) -> i64 {
        i64::from(self.page.unwrap_or(0)) * limit
    }

    /// Number of pages needed to show `total_count` entries with the given page size.
    pub fn page_count(total_count: i64, limit: i64) -> i64 {
        if total_count <= 0 {
            0
        } else {
            (total_count + limit - 1) / limit
        }
    }
}

#[derive(Serialize)]
pub struct PaginatedResponse<T> {
    pub entries: Vec<T>,
    pub page: u32,
    pub page_count: i64,
    pub total_count: i64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(entries: Vec<T>, params: &PageParameters, limit: i64, total_count: i64) -> Self {
        Self {
            entries,
            page: params.page.unwrap_or(0),
            page_count: PageParameters::page_count(total_count, limit),
            total_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(PageParameters::page_count(0, 10), 0);
        assert_eq!(PageParameters::page_count(1, 10), 1);
        assert_eq!(PageParameters::page_count(10, 10), 1);
        assert_eq!(PageParameters::page_count(11, 10), 2);
    }

    #[test]
    fn limit_is_capped() {
        let params = PageParameters {
            page: None,
            limit: Some(1000),
        };
        assert_eq!(params.limit_or(10), 100);
    }
}
