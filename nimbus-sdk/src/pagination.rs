//! Pagination - Collect every page of a list API
//!
//! Network APIs page with `limit` + `marker` (the id of the last item seen),
//! most others with `limit` + `offset`. Both stop at the first short page.

use std::future::Future;

use url::Url;

use crate::error::Result;

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Append query parameters to `base`, skipping `None` values
pub fn with_query(base: &str, params: &[(&str, Option<String>)]) -> Result<String> {
    let mut url = Url::parse(base)?;
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            if let Some(value) = value {
                pairs.append_pair(key, value);
            }
        }
    }
    // query_pairs_mut leaves a dangling '?' when nothing was appended
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url.into())
}

/// Fetch pages with `fetch(marker)` until a page has fewer than `limit`
/// items. `id_of` gives the marker for the next page.
pub async fn collect_marker<T, F, Fut, I>(limit: usize, mut fetch: F, id_of: I) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
    I: Fn(&T) -> String,
{
    let mut items = Vec::new();
    let mut marker: Option<String> = None;

    loop {
        let page = fetch(marker.clone()).await?;
        let len = page.len();
        let next = page.last().map(&id_of);
        items.extend(page);

        if len < limit || next.is_none() || next == marker {
            return Ok(items);
        }
        marker = next;
    }
}

/// Fetch pages with `fetch(offset)` until a page has fewer than `limit` items
pub async fn collect_offset<T, F, Fut>(limit: usize, mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    let mut items = Vec::new();

    loop {
        let page = fetch(items.len()).await?;
        let len = page.len();
        items.extend(page);

        if len < limit || len == 0 {
            return Ok(items);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn ids(range: std::ops::Range<u32>) -> Vec<String> {
        range.map(|i| format!("id-{:02}", i)).collect()
    }

    #[tokio::test]
    async fn marker_pages_until_short_page() {
        let all = ids(0..5);
        let markers = Mutex::new(Vec::new());

        let items = collect_marker(
            2,
            |marker: Option<String>| {
                markers.lock().unwrap().push(marker.clone());
                let start = match marker {
                    Some(m) => all.iter().position(|id| *id == m).unwrap() + 1,
                    None => 0,
                };
                let page: Vec<String> = all.iter().skip(start).take(2).cloned().collect();
                async move { Ok(page) }
            },
            |id: &String| id.clone(),
        )
        .await
        .unwrap();

        assert_eq!(items, all);
        assert_eq!(
            *markers.lock().unwrap(),
            vec![None, Some("id-01".to_string()), Some("id-03".to_string())]
        );
    }

    #[tokio::test]
    async fn marker_stops_when_marker_does_not_advance() {
        let calls = Mutex::new(0);
        let items = collect_marker(
            1,
            |_marker| {
                *calls.lock().unwrap() += 1;
                async { Ok(vec!["same".to_string()]) }
            },
            |id: &String| id.clone(),
        )
        .await
        .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn offset_pages_until_empty_page() {
        let all = ids(0..4);
        let offsets = Mutex::new(Vec::new());

        let items = collect_offset(2, |offset| {
            offsets.lock().unwrap().push(offset);
            let page: Vec<String> = all.iter().skip(offset).take(2).cloned().collect();
            async move { Ok(page) }
        })
        .await
        .unwrap();

        assert_eq!(items, all);
        assert_eq!(*offsets.lock().unwrap(), vec![0, 2, 4]);
    }

    #[test]
    fn query_skips_missing_values() {
        let url = with_query(
            "https://vpc.example.com/v1/p/vpcs",
            &[("limit", Some("100".to_string())), ("marker", None)],
        )
        .unwrap();
        assert_eq!(url, "https://vpc.example.com/v1/p/vpcs?limit=100");

        let bare = with_query("https://vpc.example.com/v1/p/vpcs", &[("marker", None)]).unwrap();
        assert_eq!(bare, "https://vpc.example.com/v1/p/vpcs");
    }
}
