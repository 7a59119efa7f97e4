//! Options recognised by a live session.

use serde::{Deserialize, Serialize};

use crate::broadcast::Rgb;

/// Which event categories are forwarded to the output sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardToggles {
    pub danmaku: bool,
    pub gift: bool,
    pub guard: bool,
    pub super_chat: bool,
    /// Room entries, follows, shares and likes.
    pub interact: bool,
}

impl Default for ForwardToggles {
    fn default() -> Self {
        Self {
            danmaku: true,
            gift: true,
            guard: true,
            super_chat: true,
            interact: false,
        }
    }
}

/// Hex colours (`RRGGBB`) per category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    pub danmaku: String,
    pub gift: String,
    pub super_chat: String,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            danmaku: "00D1F1".to_string(),
            gift: "FF69B4".to_string(),
            super_chat: "FFA500".to_string(),
        }
    }
}

impl ColorConfig {
    pub fn danmaku_rgb(&self) -> Rgb {
        Rgb::from_hex(&self.danmaku)
    }

    pub fn gift_rgb(&self) -> Rgb {
        Rgb::from_hex(&self.gift)
    }

    pub fn super_chat_rgb(&self) -> Rgb {
        Rgb::from_hex(&self.super_chat)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BliveConfig {
    /// Master switch for the whole feature.
    pub enabled: bool,
    /// Value of the `SESSDATA` cookie. Without it the platform masks user names.
    pub sessdata: Option<String>,
    pub forward: ForwardToggles,
    pub colors: ColorConfig,
    /// Forwarded text longer than this many characters is cut and marked with `...`.
    pub max_message_len: usize,
    pub broadcast_throttle: bool,
    pub max_broadcast_per_second: u32,
}

impl Default for BliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sessdata: None,
            forward: ForwardToggles::default(),
            colors: ColorConfig::default(),
            max_message_len: 60,
            broadcast_throttle: true,
            max_broadcast_per_second: 10,
        }
    }
}

impl BliveConfig {
    /// The session cookie, if set to something non-blank.
    pub fn sessdata(&self) -> Option<&str> {
        self.sessdata
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}
