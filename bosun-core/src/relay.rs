//! Relay-style cursor pagination over ordered sequences.
//!
//! See <https://relay.dev/graphql/connections.htm>.

use serde::{Deserialize, Serialize};

use crate::error::{BosunError, Result};

/// Connection arguments as received from the API layer.
///
/// Counts are signed because clients may send negative values; those are
/// rejected rather than clamped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageArgs {
    pub after: Option<String>,
    pub before: Option<String>,
    pub first: Option<i64>,
    pub last: Option<i64>,
}

impl PageArgs {
    pub fn first(count: i64) -> Self {
        Self {
            first: Some(count),
            ..Default::default()
        }
    }

    pub fn last(count: i64) -> Self {
        Self {
            last: Some(count),
            ..Default::default()
        }
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.after = Some(cursor.into());
        self
    }

    pub fn before(mut self, cursor: impl Into<String>) -> Self {
        self.before = Some(cursor.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge<T> {
    pub cursor: String,
    pub node: T,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection<T> {
    pub edges: Vec<Edge<T>>,
    pub page_info: PageInfo,
}

impl<T> Connection<T> {
    pub fn empty() -> Self {
        Self {
            edges: Vec::new(),
            page_info: PageInfo::default(),
        }
    }

    pub fn cursors(&self) -> Vec<&str> {
        self.edges.iter().map(|edge| edge.cursor.as_str()).collect()
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Connection<U> {
        Connection {
            edges: self
                .edges
                .into_iter()
                .map(|edge| Edge {
                    cursor: edge.cursor,
                    node: f(edge.node),
                })
                .collect(),
            page_info: self.page_info,
        }
    }
}

/// Windows `nodes` according to `args`.
///
/// `after`/`before` cut strictly around their anchors (a missing anchor
/// yields an empty page), then `first` keeps a prefix and `last` a suffix.
/// A page flag is set whenever anything was cut on that side.
pub fn paginate<T, I, F>(nodes: I, cursor_of: F, args: &PageArgs) -> Result<Connection<T>>
where
    I: IntoIterator<Item = T>,
    F: Fn(&T) -> String,
{
    let first = non_negative("first", args.first)?;
    let last = non_negative("last", args.last)?;

    let mut edges: Vec<Edge<T>> = nodes
        .into_iter()
        .map(|node| Edge {
            cursor: cursor_of(&node),
            node,
        })
        .collect();
    let total = edges.len();

    let mut start = 0;
    let mut end = total;

    if let Some(after) = &args.after {
        match edges.iter().position(|edge| &edge.cursor == after) {
            Some(index) => start = index + 1,
            None => return Ok(Connection::empty()),
        }
    }
    if let Some(before) = &args.before {
        match edges.iter().position(|edge| &edge.cursor == before) {
            Some(index) => end = index,
            None => return Ok(Connection::empty()),
        }
    }
    let end = end.max(start);

    let mut has_previous_page = start > 0;
    let mut has_next_page = end < total;

    edges.truncate(end);
    edges.drain(..start);

    if let Some(first) = first
        && first < edges.len()
    {
        edges.truncate(first);
        has_next_page = true;
    }

    if let Some(last) = last
        && last < edges.len()
    {
        edges.drain(..edges.len() - last);
        has_previous_page = true;
    }

    let page_info = PageInfo {
        has_next_page,
        has_previous_page,
        start_cursor: edges.first().map(|edge| edge.cursor.clone()),
        end_cursor: edges.last().map(|edge| edge.cursor.clone()),
    };

    Ok(Connection { edges, page_info })
}

fn non_negative(name: &str, value: Option<i64>) -> Result<Option<usize>> {
    match value {
        Some(count) if count < 0 => Err(BosunError::InvalidArgument(format!(
            "{name} cannot be negative"
        ))),
        Some(count) => Ok(Some(usize::try_from(count).unwrap_or(usize::MAX))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ten() -> Vec<String> {
        (0..10).map(|n| n.to_string()).collect()
    }

    fn page(args: PageArgs) -> Connection<String> {
        paginate(ten(), |node| node.clone(), &args).expect("paginate")
    }

    #[test]
    fn no_arguments_returns_everything() {
        let connection = page(PageArgs::default());
        assert_eq!(connection.edges.len(), 10);
        assert!(!connection.page_info.has_next_page);
        assert!(!connection.page_info.has_previous_page);
        assert_eq!(connection.page_info.start_cursor.as_deref(), Some("0"));
        assert_eq!(connection.page_info.end_cursor.as_deref(), Some("9"));
    }

    #[test]
    fn first_keeps_prefix() {
        let connection = page(PageArgs::first(5));
        assert_eq!(connection.cursors(), ["0", "1", "2", "3", "4"]);
        assert!(connection.page_info.has_next_page);
        assert!(!connection.page_info.has_previous_page);
    }

    #[test]
    fn after_then_first() {
        let connection = page(PageArgs::first(5).after("2"));
        assert_eq!(connection.cursors(), ["3", "4", "5", "6", "7"]);
        assert!(connection.page_info.has_next_page);
        assert!(connection.page_info.has_previous_page);
    }

    #[test]
    fn before_then_last() {
        let connection = page(PageArgs::last(5).before("7"));
        assert_eq!(connection.cursors(), ["2", "3", "4", "5", "6"]);
        assert!(connection.page_info.has_previous_page);
        assert!(connection.page_info.has_next_page);
    }

    #[test]
    fn cursor_alone_flags_the_cut_side() {
        let connection = page(PageArgs::default().before("3"));
        assert_eq!(connection.cursors(), ["0", "1", "2"]);
        assert!(connection.page_info.has_next_page);
        assert!(!connection.page_info.has_previous_page);

        let connection = page(PageArgs::default().after("6"));
        assert_eq!(connection.cursors(), ["7", "8", "9"]);
        assert!(connection.page_info.has_previous_page);
        assert!(!connection.page_info.has_next_page);
    }

    #[test]
    fn after_and_before_intersect() {
        let connection = page(PageArgs::default().after("1").before("5"));
        assert_eq!(connection.cursors(), ["2", "3", "4"]);
        assert!(connection.page_info.has_next_page);
        assert!(connection.page_info.has_previous_page);

        let inverted = page(PageArgs::default().after("5").before("1"));
        assert!(inverted.edges.is_empty());
        assert_eq!(inverted.page_info.start_cursor, None);
    }

    #[test]
    fn first_and_last_combine() {
        let connection = page(PageArgs {
            first: Some(6),
            last: Some(2),
            ..Default::default()
        });
        assert_eq!(connection.cursors(), ["4", "5"]);
        assert!(connection.page_info.has_next_page);
        assert!(connection.page_info.has_previous_page);
    }

    #[test]
    fn unknown_cursor_yields_empty_page() {
        let connection = page(PageArgs::first(3).after("42"));
        assert!(connection.edges.is_empty());
        assert_eq!(connection.page_info, PageInfo::default());

        let connection = page(PageArgs::last(3).before("nope"));
        assert!(connection.edges.is_empty());
    }

    #[test]
    fn negative_counts_are_rejected() {
        for args in [PageArgs::first(-1), PageArgs::last(-3)] {
            assert!(matches!(
                paginate(ten(), |node| node.clone(), &args),
                Err(BosunError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn zero_count_gives_empty_page_with_flag() {
        let connection = page(PageArgs::first(0));
        assert!(connection.edges.is_empty());
        assert!(connection.page_info.has_next_page);
        assert_eq!(connection.page_info.end_cursor, None);
    }
}
