//! Documents served by the change feed and the bound calculations the
//! pipeline derives from them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::ids::{LeafId, PageId};

/// Top level feed document listing every page.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CatalogIndex {
    #[cfg_attr(feature = "serde", serde(rename = "commitTimeStamp"))]
    pub commit_timestamp: DateTime<Utc>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub items: Vec<CatalogPageItem>,
}

/// Reference to one page. The page's commit timestamp is the newest commit
/// timestamp of any leaf it contains.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CatalogPageItem {
    #[cfg_attr(feature = "serde", serde(rename = "@id"))]
    pub url: String,
    #[cfg_attr(feature = "serde", serde(rename = "commitTimeStamp"))]
    pub commit_timestamp: DateTime<Utc>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CatalogPage {
    #[cfg_attr(feature = "serde", serde(rename = "commitTimeStamp"))]
    pub commit_timestamp: DateTime<Utc>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub items: Vec<CatalogLeafItem>,
}

/// Kind of event a leaf records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LeafType {
    #[cfg_attr(
        feature = "serde",
        serde(rename = "nuget:PackageDetails", alias = "Details")
    )]
    Details,
    #[cfg_attr(
        feature = "serde",
        serde(rename = "nuget:PackageDelete", alias = "Delete")
    )]
    Delete,
}

impl LeafType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeafType::Details => "Details",
            LeafType::Delete => "Delete",
        }
    }
}

/// One event in a page: an item (id + version) created, updated or deleted
/// at a commit timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CatalogLeafItem {
    #[cfg_attr(feature = "serde", serde(rename = "@id"))]
    pub url: String,
    #[cfg_attr(feature = "serde", serde(rename = "@type"))]
    pub leaf_type: LeafType,
    #[cfg_attr(feature = "serde", serde(rename = "commitTimeStamp"))]
    pub commit_timestamp: DateTime<Utc>,
    #[cfg_attr(feature = "serde", serde(rename = "nuget:id"))]
    pub item_id: String,
    #[cfg_attr(feature = "serde", serde(rename = "nuget:version"))]
    pub item_version: String,
}

impl CatalogLeafItem {
    /// Case-insensitive natural key of the item this leaf describes.
    pub fn natural_key(&self) -> (String, String) {
        (
            self.item_id.to_lowercase(),
            self.item_version.to_lowercase(),
        )
    }
}

impl CatalogIndex {
    /// Every page paired with its id, ordered by commit timestamp then url.
    pub fn ranked_pages(&self) -> Vec<(PageId, &CatalogPageItem)> {
        let mut pages: Vec<&CatalogPageItem> = self.items.iter().collect();
        pages.sort_by(|a, b| {
            a.commit_timestamp
                .cmp(&b.commit_timestamp)
                .then_with(|| a.url.cmp(&b.url))
        });
        pages
            .into_iter()
            .enumerate()
            .map(|(rank, page)| (PageId::from_rank(rank), page))
            .collect()
    }

    /// Pages whose commit window intersects `(min, max]`.
    ///
    /// A page covers `(previous page timestamp, own timestamp]`, so a page is
    /// included when its own timestamp is past `min` and the page before it
    /// ended before `max`.
    pub fn pages_in_bounds(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Vec<(PageId, &CatalogPageItem)> {
        let mut previous: Option<DateTime<Utc>> = None;
        let mut selected = Vec::new();
        for (page_id, page) in self.ranked_pages() {
            let lower = previous;
            previous = Some(page.commit_timestamp);
            if page.commit_timestamp <= min {
                continue;
            }
            if lower.is_some_and(|lower| lower >= max) {
                break;
            }
            selected.push((page_id, page));
        }
        selected
    }
}

impl CatalogPage {
    /// Every leaf paired with its id, ordered by commit timestamp then url.
    pub fn ranked_leaves(&self) -> Vec<(LeafId, &CatalogLeafItem)> {
        let mut leaves: Vec<&CatalogLeafItem> = self.items.iter().collect();
        leaves.sort_by(|a, b| {
            a.commit_timestamp
                .cmp(&b.commit_timestamp)
                .then_with(|| a.url.cmp(&b.url))
        });
        leaves
            .into_iter()
            .enumerate()
            .map(|(rank, leaf)| (LeafId::from_rank(rank), leaf))
            .collect()
    }

    /// Leaves with `min < commit timestamp <= max`, sorted by commit
    /// timestamp, then item id and version (case-insensitive).
    ///
    /// With `exclude_redundant` only the newest leaf of each item survives.
    pub fn leaves_in_bounds(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
        exclude_redundant: bool,
    ) -> Vec<(LeafId, &CatalogLeafItem)> {
        let mut leaves: Vec<(LeafId, &CatalogLeafItem)> = self
            .ranked_leaves()
            .into_iter()
            .filter(|(_, leaf)| {
                leaf.commit_timestamp > min && leaf.commit_timestamp <= max
            })
            .collect();

        if exclude_redundant {
            // Ranked order is ascending, so the last write per key is the newest.
            let mut newest: HashMap<(String, String), usize> = HashMap::new();
            for (position, (_, leaf)) in leaves.iter().enumerate() {
                newest.insert(leaf.natural_key(), position);
            }
            let keep: Vec<bool> = leaves
                .iter()
                .enumerate()
                .map(|(position, (_, leaf))| {
                    newest.get(&leaf.natural_key()) == Some(&position)
                })
                .collect();
            let mut flags = keep.into_iter();
            leaves.retain(|_| flags.next().unwrap_or(false));
        }

        leaves.sort_by(|(_, a), (_, b)| {
            a.commit_timestamp
                .cmp(&b.commit_timestamp)
                .then_with(|| a.natural_key().cmp(&b.natural_key()))
        });
        leaves
    }
}
