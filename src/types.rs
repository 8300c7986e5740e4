//! Core types: posts, listing wire format, per-post outcomes and run summaries

use crate::filter::Rejection;
use crate::retry::SkipReason;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;

/// A post as returned by the upstream listing
///
/// Every attribute is optional: the listing is polymorphic and upstream does
/// not guarantee any field is present. Filters decide what a missing field
/// means.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Post {
    /// Short post id (e.g. "1abcde")
    pub id: Option<String>,

    /// Creation time, seconds since the Unix epoch
    pub created_utc: Option<f64>,

    /// Outbound link
    pub url: Option<String>,

    /// Pinned to the top of the subreddit
    pub stickied: Option<bool>,

    /// Subreddit the post belongs to
    pub subreddit: Option<String>,

    /// Post title
    pub title: Option<String>,

    /// Author user name
    pub author: Option<String>,

    /// Path of the comments page
    pub permalink: Option<String>,

    /// Flagged as not safe for work
    pub over_18: Option<bool>,

    /// Net vote score
    pub score: Option<i64>,
}

impl Post {
    /// Whether the post is pinned; absent flag means not pinned
    pub fn is_stickied(&self) -> bool {
        self.stickied.unwrap_or(false)
    }

    /// Identifier for log lines
    pub fn display_id(&self) -> &str {
        self.id.as_deref().unwrap_or("<unknown>")
    }
}

/// Orders posts by creation time, oldest first; posts without a creation time sort first
pub fn cmp_created(a: &Post, b: &Post) -> Ordering {
    match (a.created_utc, b.created_utc) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Stable in-place sort by creation time, oldest first
pub fn sort_by_creation(posts: &mut [Post]) {
    posts.sort_by(cmp_created);
}

/// Listing envelope (`{"kind": "Listing", "data": {...}}`)
#[derive(Clone, Debug, Deserialize)]
pub struct Listing {
    /// Listing payload
    pub data: ListingData,
}

/// Listing payload with pagination cursor
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListingData {
    /// Cursor for the next page, `None` on the last page
    pub after: Option<String>,

    /// Items on this page
    pub children: Vec<Thing>,
}

/// A typed listing item (`{"kind": "t3", "data": {...}}`)
#[derive(Clone, Debug, Deserialize)]
pub struct Thing {
    /// Item kind ("t3" for posts)
    #[serde(default)]
    pub kind: String,

    /// Item attributes
    #[serde(default)]
    pub data: Post,
}

/// New posts retrieved for one subreddit, sorted oldest first
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceListing {
    /// Subreddit name as configured
    pub source: String,

    /// Posts sorted ascending by creation time (empty if the source was abandoned)
    pub posts: Vec<Post>,
}

/// What happened to a single post
#[derive(Clone, Debug, PartialEq)]
pub enum PostOutcome {
    /// Rejected by the time filter; watermark untouched
    NotEligible(Rejection),

    /// Rejected by the global or subreddit filter; watermark advanced
    Filtered(Rejection),

    /// Download ended in a terminal skip; watermark advanced
    Skipped(SkipReason),

    /// Image written to disk; watermark advanced
    Saved(PathBuf),
}

impl PostOutcome {
    /// Whether the watermark was advanced for this post
    pub fn advanced_watermark(&self) -> bool {
        !matches!(self, PostOutcome::NotEligible(_))
    }
}

/// Tallies for one pipeline run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Subreddits whose posts were handled
    pub sources: usize,
    /// Posts examined
    pub posts_seen: usize,
    /// Posts rejected by the time filter
    pub not_eligible: usize,
    /// Posts rejected by the global or subreddit filter
    pub filtered: usize,
    /// Posts whose download was skipped
    pub skipped: usize,
    /// Images written
    pub saved: usize,
    /// Run stopped early because termination was requested
    pub terminated: bool,
}

impl RunSummary {
    /// Count one post outcome
    pub fn record(&mut self, outcome: &PostOutcome) {
        self.posts_seen += 1;
        match outcome {
            PostOutcome::NotEligible(_) => self.not_eligible += 1,
            PostOutcome::Filtered(_) => self.filtered += 1,
            PostOutcome::Skipped(_) => self.skipped += 1,
            PostOutcome::Saved(_) => self.saved += 1,
        }
    }
}
