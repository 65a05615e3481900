//! Shared data model and wire protocol for the marquee display fleet.
//!
//! The control plane and the terminals speak two small surfaces: a push
//! channel carrying full screen-state snapshots, and a handful of read-only
//! catalog endpoints the terminals pull from. Both are defined here so the
//! two binaries cannot drift apart.

pub mod model;
pub mod wire;

pub use model::{
    CacheMetadata, Display, GeoLocation, Rect, Screen, ScreenState, Slideshow,
    CACHE_SCHEMA_VERSION, DEFAULT_SLIDESHOW_INTERVAL_MS,
};
pub use wire::{PushMessage, ScreenStateMap, SnapshotEntry, TerminalCommand};
