//! Catalog helpers: download size estimation
//!
//! Size data rides on the catalog items themselves (`size`, in bytes) when
//! the registry knows it; anything without a size counts as unknown rather
//! than guessing.

use modusnap_common::CatalogItem;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeEstimateItem {
    pub key: String,
    pub title: String,
    pub known: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeEstimate {
    pub total: usize,
    pub known_count: usize,
    pub unknown_count: usize,
    #[serde(rename = "totalKB")]
    pub total_kb: u64,
    #[serde(rename = "totalGB")]
    pub total_gb: f64,
    pub results: Vec<SizeEstimateItem>,
}

pub fn size_estimate(items: &[CatalogItem]) -> SizeEstimate {
    let mut results = Vec::with_capacity(items.len());
    let mut total_kb = 0u64;
    let mut known_count = 0usize;

    for item in items {
        let kb = item.size.map(|bytes| bytes.div_ceil(1024));
        if let Some(kb) = kb {
            total_kb += kb;
            known_count += 1;
        }
        results.push(SizeEstimateItem {
            key: item.key(),
            title: item.display_title(),
            known: kb.is_some(),
            kb,
        });
    }

    let total_gb = (total_kb as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0;
    SizeEstimate {
        total: items.len(),
        known_count,
        unknown_count: items.len() - known_count,
        total_kb,
        total_gb,
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &str, size: Option<u64>) -> CatalogItem {
        CatalogItem {
            ui_key: Some(key.to_string()),
            title: Some(key.to_string()),
            size,
            ..Default::default()
        }
    }

    #[test]
    fn mixes_known_and_unknown_sizes() {
        let estimate = size_estimate(&[
            item("a", Some(2048)),
            item("b", None),
            item("c", Some(1)),
        ]);
        assert_eq!(estimate.total, 3);
        assert_eq!(estimate.known_count, 2);
        assert_eq!(estimate.unknown_count, 1);
        // 2048 bytes -> 2 KB, 1 byte rounds up to 1 KB.
        assert_eq!(estimate.total_kb, 3);
        assert!(estimate.results[1].kb.is_none());
        assert!(!estimate.results[1].known);
    }

    #[test]
    fn gigabyte_rounding_is_two_decimals() {
        let estimate = size_estimate(&[item("a", Some(3 * 1024 * 1024 * 1024))]);
        assert_eq!(estimate.total_gb, 3.0);
        let estimate = size_estimate(&[item("a", Some(1_600_000_000))]);
        assert!((estimate.total_gb - 1.49).abs() < 0.02);
    }
}
