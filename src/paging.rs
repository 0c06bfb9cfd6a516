//! Page navigation over segmented queries.
//!
//! A [`PagingInfo`] travels between caller and store. The caller sets
//! `navigate_to_page_index`; the store answers with a page of results and a new
//! `PagingInfo` whose `next_page` and `previous_pages` hold the continuation
//! tokens needed to move forward or back. Tokens are plain strings of the form
//! `next_partition_key|next_row_key|next_table_name|target_location`.
//! A `|` or `\` inside a field is written with a leading `\`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Replica a continuation should be served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageLocation {
    Primary,
    Secondary,
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageLocation::Primary => f.write_str("Primary"),
            StorageLocation::Secondary => f.write_str("Secondary"),
        }
    }
}

/// Position to resume a segmented query from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContinuationToken {
    pub next_partition_key: String,
    pub next_row_key: String,
    pub next_table_name: String,
    pub target_location: Option<StorageLocation>,
}

impl ContinuationToken {
    /// Token pointing at a row of the current table
    pub fn at(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            next_partition_key: partition_key.into(),
            next_row_key: row_key.into(),
            next_table_name: String::new(),
            target_location: Some(StorageLocation::Primary),
        }
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|",
            escape(&self.next_partition_key),
            escape(&self.next_row_key),
            escape(&self.next_table_name)
        )?;
        if let Some(location) = self.target_location {
            write!(f, "{}", location)?;
        }
        Ok(())
    }
}

impl FromStr for ContinuationToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts = split_fields(s)?;
        if parts.len() != 4 {
            return Err(Error::BadRequest(format!(
                "malformed continuation token '{}': expected 4 fields, found {}",
                s,
                parts.len()
            )));
        }

        let target_location = match parts[3].as_str() {
            "Primary" => Some(StorageLocation::Primary),
            "Secondary" => Some(StorageLocation::Secondary),
            _ => None,
        };

        let mut parts = parts.into_iter();
        Ok(Self {
            next_partition_key: parts.next().unwrap_or_default(),
            next_row_key: parts.next().unwrap_or_default(),
            next_table_name: parts.next().unwrap_or_default(),
            target_location,
        })
    }
}

fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        if c == '|' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Split on unescaped `|`, removing the escapes
fn split_fields(s: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => {
                    return Err(Error::BadRequest(format!(
                        "malformed continuation token '{}': dangling escape",
                        s
                    )))
                }
            },
            '|' => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    Ok(fields)
}

/// Paging envelope exchanged with the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagingInfo {
    /// Page size; `None` fetches a whole segment
    pub element_count: Option<usize>,
    pub next_page: Option<String>,
    /// `previous_pages[i]` starts page `i + 1`
    pub previous_pages: Vec<String>,
    pub current_page: usize,
    pub navigate_to_page_index: usize,
}

impl PagingInfo {
    pub fn with_page_size(element_count: usize) -> Self {
        Self {
            element_count: Some(element_count),
            ..Default::default()
        }
    }

    /// Request page `index` on the next call
    pub fn navigate_to(mut self, index: usize) -> Self {
        self.navigate_to_page_index = index;
        self
    }

    fn navigating_forward(&self) -> bool {
        self.navigate_to_page_index > self.current_page
    }

    /// Token that starts the requested page.
    ///
    /// `Ok(None)` means "from the beginning". Moving forward past the last page
    /// yields `Err(NotFound)`, which callers turn into an empty page.
    pub fn start_token(&self) -> Result<Option<ContinuationToken>> {
        if self.navigate_to_page_index == 0 {
            return Ok(None);
        }

        let raw = if self.navigating_forward() {
            self.next_page
                .as_deref()
                .ok_or_else(|| Error::NotFound("no further pages".to_string()))?
        } else {
            self.previous_pages
                .get(self.navigate_to_page_index - 1)
                .map(String::as_str)
                .ok_or_else(|| {
                    Error::BadRequest(format!(
                        "page {} was never visited",
                        self.navigate_to_page_index
                    ))
                })?
        };

        raw.parse().map(Some)
    }

    /// Paging info describing the page just served
    pub fn advance(&self, next: Option<ContinuationToken>) -> PagingInfo {
        let (current_page, previous_pages) = if self.navigating_forward() {
            let mut previous = self.previous_pages.clone();
            if let Some(token) = &self.next_page {
                previous.push(token.clone());
            }
            (self.current_page + 1, previous)
        } else {
            let keep = self.navigate_to_page_index.min(self.previous_pages.len());
            (
                self.navigate_to_page_index,
                self.previous_pages[..keep].to_vec(),
            )
        };

        PagingInfo {
            element_count: self.element_count,
            next_page: next.map(|t| t.to_string()),
            previous_pages,
            current_page,
            navigate_to_page_index: current_page + 1,
        }
    }

    /// Paging info returned with an empty page
    pub fn exhausted(&self) -> PagingInfo {
        PagingInfo {
            element_count: self.element_count,
            ..Default::default()
        }
    }
}

/// One page of results plus the info needed to move on
#[derive(Debug, Clone)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub paging_info: PagingInfo,
}

impl<T> PagedResult<T> {
    pub fn new(items: Vec<T>, paging_info: PagingInfo) -> Self {
        Self { items, paging_info }
    }

    pub fn empty(paging_info: PagingInfo) -> Self {
        Self {
            items: Vec::new(),
            paging_info,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Convert into a serializable envelope
    pub fn into_paged_items(self) -> PagedItems<T> {
        PagedItems {
            result_list: self.items,
            paging_info: Some(self.paging_info),
        }
    }
}

impl<T> IntoIterator for PagedResult<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// Serializable page envelope for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagedItems<T> {
    pub result_list: Vec<T>,
    pub paging_info: Option<PagingInfo>,
}

impl<T> PagedItems<T> {
    pub fn select<U>(self, f: impl FnMut(T) -> U) -> PagedItems<U> {
        PagedItems {
            result_list: self.result_list.into_iter().map(f).collect(),
            paging_info: self.paging_info,
        }
    }
}

impl<T> Default for PagedItems<T> {
    fn default() -> Self {
        Self {
            result_list: Vec::new(),
            paging_info: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        let token = ContinuationToken::at("orders", "0042");
        let text = token.to_string();
        assert_eq!(text, "orders|0042||Primary");
        assert_eq!(text.parse::<ContinuationToken>().unwrap(), token);
    }

    #[test]
    fn test_token_keys_with_separators() {
        let token = ContinuationToken::at("a|b", r"c\d|");
        let text = token.to_string();
        assert_eq!(text, r"a\|b|c\\d\|||Primary");
        assert_eq!(text.parse::<ContinuationToken>().unwrap(), token);
        assert!(r"a|b|t|\".parse::<ContinuationToken>().is_err());
    }

    #[test]
    fn test_token_without_location() {
        let token: ContinuationToken = "a|b|t|".parse().unwrap();
        assert_eq!(token.target_location, None);
        assert_eq!(token.next_table_name, "t");
        assert_eq!(token.to_string(), "a|b|t|");
        assert!("a|b".parse::<ContinuationToken>().is_err());
    }

    #[test]
    fn test_navigation_bookkeeping() {
        let first = PagingInfo::with_page_size(2);
        assert_eq!(first.start_token().unwrap(), None);

        let after_first = first.advance(Some(ContinuationToken::at("p", "c")));
        assert_eq!(after_first.current_page, 0);
        assert_eq!(after_first.navigate_to_page_index, 1);

        let second_token = after_first.start_token().unwrap().unwrap();
        assert_eq!(second_token.next_row_key, "c");

        let after_second = after_first.advance(Some(ContinuationToken::at("p", "e")));
        assert_eq!(after_second.current_page, 1);
        assert_eq!(after_second.previous_pages, vec!["p|c||Primary".to_string()]);

        let back = after_second.clone().navigate_to(0);
        assert_eq!(back.start_token().unwrap(), None);
        let after_back = back.advance(Some(ContinuationToken::at("p", "c")));
        assert_eq!(after_back.current_page, 0);
        assert!(after_back.previous_pages.is_empty());
    }

    #[test]
    fn test_forward_past_end_is_not_found() {
        let last = PagingInfo::with_page_size(2).advance(None);
        assert!(last.start_token().unwrap_err().is_not_found());
    }
}
