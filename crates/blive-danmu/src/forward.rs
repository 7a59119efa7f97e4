//! Built-in handler that renders live events as text lines for a sink.

use std::sync::Arc;

use crate::broadcast::{BroadcastItem, Broadcaster, MsgPriority, Rgb};
use crate::config::BliveConfig;
use crate::dispatch::DanmuHandler;
use crate::error::BliveError;
use crate::message::{Danmaku, Gift, GuardBuy, InteractWord, SuperChat, UserToastV2, guard_title};

const ELLIPSIS: &str = "...";

/// Cut `text` to `max_chars` characters, marking the cut with `...`.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}{ELLIPSIS}", &text[..end]),
        None => text.to_string(),
    }
}

/// Forwards enabled event categories to a [`Broadcaster`].
pub struct ForwardingHandler {
    config: BliveConfig,
    broadcaster: Arc<Broadcaster>,
}

impl ForwardingHandler {
    pub fn new(config: BliveConfig, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            config,
            broadcaster,
        }
    }

    fn forward(&self, text: String, color: Rgb) {
        let text = truncate(&text, self.config.max_message_len);
        self.broadcaster.send(BroadcastItem::new(text, color));
    }

    /// Send a lifecycle line ahead of queued chat.
    pub fn notice(&self, text: impl Into<String>) {
        self.broadcaster
            .send(BroadcastItem::new(text, Rgb::YELLOW).with_priority(MsgPriority::High));
    }
}

impl DanmuHandler for ForwardingHandler {
    fn on_danmaku(&self, msg: &Danmaku) {
        if !self.config.forward.danmaku {
            return;
        }
        let medal = msg
            .medal
            .as_ref()
            .map(|m| format!("<{} Lv.{}> ", m.name, m.level))
            .unwrap_or_default();
        self.forward(
            format!("[Danmaku] {medal}{}: {}", msg.uname, msg.display_text()),
            self.config.colors.danmaku_rgb(),
        );
    }

    fn on_gift(&self, msg: &Gift) {
        if !self.config.forward.gift {
            return;
        }
        let value = if msg.is_paid() {
            format!("  {:.2} CNY", msg.total_coin as f64 / 1000.0)
        } else {
            String::new()
        };
        self.forward(
            format!(
                "[Gift] {} sent {} x{}{value}",
                msg.uname, msg.gift_name, msg.num
            ),
            self.config.colors.gift_rgb(),
        );
    }

    fn on_guard_buy(&self, msg: &GuardBuy) {
        if !self.config.forward.guard {
            return;
        }
        self.forward(
            format!(
                "[Guard] {} bought {} ({})",
                msg.username,
                msg.gift_name,
                guard_title(msg.guard_level)
            ),
            self.config.colors.gift_rgb(),
        );
    }

    fn on_user_toast_v2(&self, msg: &UserToastV2) {
        if !self.config.forward.guard {
            return;
        }
        self.forward(
            format!(
                "[Guard] {} became {} x{}{}",
                msg.username,
                guard_title(msg.guard_level),
                msg.num,
                msg.unit
            ),
            self.config.colors.gift_rgb(),
        );
    }

    fn on_super_chat(&self, msg: &SuperChat) {
        if !self.config.forward.super_chat {
            return;
        }
        self.forward(
            format!("[SC] ¥{} {}: {}", msg.price, msg.uname, msg.message),
            self.config.colors.super_chat_rgb(),
        );
    }

    fn on_interact_word(&self, msg: &InteractWord) {
        if !self.config.forward.interact {
            return;
        }
        self.forward(
            format!("[Interact] {} {}", msg.uname, msg.kind.verb()),
            self.config.colors.danmaku_rgb(),
        );
    }

    fn on_authenticated(&self, room_id: u64) {
        self.notice(format!("[BLive] Connected to room {room_id}"));
    }

    fn on_client_stopped(&self, error: Option<&BliveError>) {
        match error {
            Some(e) => self.notice(format!("[BLive] Disconnected: {e}")),
            None => self.notice("[BLive] Disconnected"),
        }
    }
}
