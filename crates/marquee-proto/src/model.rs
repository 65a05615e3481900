use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named physical installation grouping one or more screens.
///
/// Owned by the control plane; terminal-side copies are replace-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Display {
    pub id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Placement of a screen within its display's coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    pub lat: f64,
    pub lng: f64,
    pub address: Option<String>,
}

/// An addressable render target belonging to exactly one display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Screen {
    pub id: String,
    pub display_id: String,
    #[serde(flatten)]
    pub rect: Rect,
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
}

/// Rotation of several media references on one screen.
///
/// Present on a state if and only if the active assignment carries more than
/// one image; `images` is never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slideshow {
    pub images: Vec<String>,
    pub interval_ms: u64,
}

/// The active media assignment for one screen, keyed by `screen_id`.
///
/// `src` of `None` means the screen is blank. `scenario` is `None` or the
/// name of the assignment that supplied `src`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenState {
    pub screen_id: String,
    pub src: Option<String>,
    pub scenario: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slideshow: Option<Slideshow>,
    pub updated_at: DateTime<Utc>,
}

pub const DEFAULT_SLIDESHOW_INTERVAL_MS: u64 = 10_000;

impl ScreenState {
    /// Build a state from an assignment's image list, enforcing the
    /// slideshow invariant: zero images is blank, one image is a plain
    /// `src`, more than one becomes a slideshow whose first image is `src`.
    pub fn from_assignment(
        screen_id: impl Into<String>,
        images: &[String],
        scenario: Option<String>,
        interval_ms: Option<u64>,
    ) -> Self {
        let slideshow = if images.len() > 1 {
            Some(Slideshow {
                images: images.to_vec(),
                interval_ms: interval_ms.unwrap_or(DEFAULT_SLIDESHOW_INTERVAL_MS),
            })
        } else {
            None
        };
        Self {
            screen_id: screen_id.into(),
            src: images.first().cloned(),
            scenario,
            slideshow,
            updated_at: Utc::now(),
        }
    }

    /// Every media reference this state can render.
    pub fn media_refs(&self) -> impl Iterator<Item = &str> {
        self.src
            .iter()
            .map(String::as_str)
            .chain(
                self.slideshow
                    .iter()
                    .flat_map(|s| s.images.iter().map(String::as_str)),
            )
    }
}

/// Singleton bookkeeping record for the terminal-side cache, stored under a
/// fixed key. `display_ids` lists every display that has ever been cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    pub display_ids: Vec<String>,
}

/// Bumped when the cached record encoding changes shape.
pub const CACHE_SCHEMA_VERSION: u32 = 1;
