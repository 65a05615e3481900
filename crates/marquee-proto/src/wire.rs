//! Push-channel and command messages.
//!
//! Snapshots are always a full replace of the screen-state map, never a
//! delta. Both directions are internally tagged JSON so unknown tags can be
//! detected at the parse boundary instead of probing untyped payloads.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ScreenState, Slideshow};

/// One screen's entry within a push snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub src: Option<String>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slideshow: Option<Slideshow>,
}

impl From<&ScreenState> for SnapshotEntry {
    fn from(state: &ScreenState) -> Self {
        Self {
            src: state.src.clone(),
            updated: state.updated_at,
            scenario: state.scenario.clone(),
            slideshow: state.slideshow.clone(),
        }
    }
}

/// Full snapshot payload: screen id to entry. A `BTreeMap` keeps the
/// serialized form deterministic, so one storage read serializes to one
/// byte sequence no matter how many connections it fans out to.
pub type ScreenStateMap = BTreeMap<String, SnapshotEntry>;

/// Server to terminal messages over the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PushMessage {
    State { screens: ScreenStateMap },
}

impl PushMessage {
    pub fn state_from(states: &[ScreenState]) -> Self {
        let screens = states
            .iter()
            .map(|state| (state.screen_id.clone(), SnapshotEntry::from(state)))
            .collect();
        PushMessage::State { screens }
    }
}

/// Terminal to server commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TerminalCommand {
    SetImage {
        screen: String,
        src: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scenario: Option<String>,
    },
}
