//! Typed live-room messages.
//!
//! Every message is built by picking fields out of the raw command envelope one
//! at a time. A missing or mistyped field becomes the zero value of its type;
//! parsing never fails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::Command;

fn text(v: Option<&Value>) -> String {
    v.and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Numbers sometimes arrive as strings (ids, prices), accept both.
fn uint(v: Option<&Value>) -> u64 {
    match v {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn int(v: Option<&Value>) -> i64 {
    match v {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn flag(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

fn idx(v: Option<&Value>, i: usize) -> Option<&Value> {
    v.and_then(|v| v.get(i))
}

fn key<'a>(v: Option<&'a Value>, k: &str) -> Option<&'a Value> {
    v.and_then(|v| v.get(k))
}

/// Name of a guard tier: 1 is the highest, 3 the entry tier.
pub fn guard_title(level: u64) -> &'static str {
    match level {
        1 => "Governor",
        2 => "Admiral",
        3 => "Captain",
        _ => "Guard",
    }
}

/// Fan medal shown next to a user's name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Medal {
    pub level: u64,
    pub name: String,
    /// Display name of the streamer who owns the medal.
    pub anchor_name: String,
    pub anchor_uid: u64,
    pub room_id: u64,
    pub color: u32,
    pub guard_level: u64,
}

impl Medal {
    /// `info[3]` of a DANMU_MSG: `[level, name, anchor_name, room_id, color, ..., anchor_uid @12]`.
    fn from_array(v: Option<&Value>) -> Option<Self> {
        let medal = Self {
            level: uint(idx(v, 0)),
            name: text(idx(v, 1)),
            anchor_name: text(idx(v, 2)),
            room_id: uint(idx(v, 3)),
            color: uint(idx(v, 4)) as u32,
            guard_level: uint(idx(v, 10)),
            anchor_uid: uint(idx(v, 12)),
        };
        medal.is_present().then_some(medal)
    }

    /// The `medal_info` object used by gift, super chat and interaction payloads.
    fn from_object(v: Option<&Value>) -> Option<Self> {
        let medal = Self {
            level: uint(key(v, "medal_level")),
            name: text(key(v, "medal_name")),
            anchor_name: text(key(v, "anchor_uname")),
            anchor_uid: uint(key(v, "target_id")),
            room_id: uint(key(v, "anchor_roomid").or_else(|| key(v, "anchor_room_id"))),
            color: uint(key(v, "medal_color")) as u32,
            guard_level: uint(key(v, "guard_level")),
        };
        medal.is_present().then_some(medal)
    }

    fn is_present(&self) -> bool {
        self.level > 0 || !self.name.is_empty()
    }
}

/// Popularity count from a heartbeat reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub popularity: u64,
}

impl Heartbeat {
    pub fn from_command(cmd: &Command) -> Self {
        Self {
            popularity: uint(key(cmd.data(), "popularity")),
        }
    }
}

/// A chat message (`DANMU_MSG`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Danmaku {
    pub text: String,
    pub uid: u64,
    pub uname: String,
    pub face: String,
    pub is_admin: bool,
    pub is_vip: bool,
    pub is_svip: bool,
    pub uname_color: String,
    pub user_level: u64,
    pub title: String,
    pub old_title: String,
    pub medal: Option<Medal>,
    /// Guard tier of the sender in this room, 0 when none.
    pub privilege_type: u64,
    pub wealth_level: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub mode: i64,
    pub font_size: i64,
    pub color: u32,
    pub msg_type: i64,
    pub dm_type: i64,
    pub bubble: i64,
    pub uid_crc32: String,
    /// Identifier of the sticker when the message is an emoticon.
    pub emoticon: Option<String>,
}

impl Danmaku {
    pub fn from_command(cmd: &Command) -> Self {
        let info = cmd.info();
        let meta = idx(info, 0);
        let user = idx(info, 2);
        let mode_info = idx(meta, 15);

        // mode_info.extra is JSON encoded inside a string
        let extra: Option<Value> = key(mode_info, "extra")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_str(s).ok());
        let emoticon = key(extra.as_ref(), "emoticon_unique")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Self {
            text: text(idx(info, 1)),
            uid: uint(idx(user, 0)),
            uname: text(idx(user, 1)),
            face: text(key(key(key(mode_info, "user"), "base"), "face")),
            is_admin: flag(idx(user, 2)),
            is_vip: flag(idx(user, 3)),
            is_svip: flag(idx(user, 4)),
            uname_color: text(idx(user, 7)),
            user_level: uint(idx(idx(info, 4), 0)),
            old_title: text(idx(idx(info, 5), 0)),
            title: text(idx(idx(info, 5), 1)),
            medal: Medal::from_array(idx(info, 3)),
            privilege_type: uint(idx(info, 7)),
            wealth_level: uint(idx(idx(info, 16), 0)),
            timestamp: int(idx(meta, 4)),
            mode: int(idx(meta, 1)),
            font_size: int(idx(meta, 2)),
            color: uint(idx(meta, 3)) as u32,
            msg_type: int(idx(meta, 9)),
            bubble: int(idx(meta, 10)),
            dm_type: int(idx(meta, 12)),
            uid_crc32: text(idx(meta, 7)),
            emoticon,
        }
    }

    /// Text to show: the emoticon marker for stickers, otherwise the message.
    pub fn display_text(&self) -> String {
        match &self.emoticon {
            Some(id) => format!("[emoticon:{id}]"),
            None => self.text.clone(),
        }
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp).filter(|_| self.timestamp > 0)
    }
}

/// A gift (`SEND_GIFT`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Gift {
    pub gift_name: String,
    pub gift_id: u64,
    pub gift_type: i64,
    pub num: u64,
    pub uid: u64,
    pub uname: String,
    pub face: String,
    pub guard_level: u64,
    pub action: String,
    pub price: u64,
    pub coin_type: String,
    pub total_coin: u64,
    pub timestamp: i64,
    pub tid: String,
    pub rnd: String,
    pub img_basic: String,
    pub medal: Option<Medal>,
}

impl Gift {
    pub fn from_command(cmd: &Command) -> Self {
        let d = cmd.data();
        Self {
            gift_name: text(key(d, "giftName")),
            gift_id: uint(key(d, "giftId")),
            gift_type: int(key(d, "giftType")),
            num: uint(key(d, "num")),
            uid: uint(key(d, "uid")),
            uname: text(key(d, "uname")),
            face: text(key(d, "face")),
            guard_level: uint(key(d, "guard_level")),
            action: text(key(d, "action")),
            price: uint(key(d, "price")),
            coin_type: text(key(d, "coin_type")),
            total_coin: uint(key(d, "total_coin")),
            timestamp: int(key(d, "timestamp")),
            tid: text(key(d, "tid")),
            rnd: text(key(d, "rnd")),
            img_basic: text(key(key(d, "gift_info"), "img_basic")),
            medal: Medal::from_object(key(d, "medal_info")),
        }
    }

    /// Whether the gift was paid for with gold coins rather than free silver.
    pub fn is_paid(&self) -> bool {
        self.coin_type == "gold"
    }
}

/// A guard subscription purchase (`GUARD_BUY`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardBuy {
    pub uid: u64,
    pub username: String,
    pub guard_level: u64,
    pub num: u64,
    pub price: u64,
    pub gift_id: u64,
    pub gift_name: String,
    pub start_time: i64,
    pub end_time: i64,
}

impl GuardBuy {
    pub fn from_command(cmd: &Command) -> Self {
        let d = cmd.data();
        Self {
            uid: uint(key(d, "uid")),
            username: text(key(d, "username")),
            guard_level: uint(key(d, "guard_level")),
            num: uint(key(d, "num")),
            price: uint(key(d, "price")),
            gift_id: uint(key(d, "gift_id")),
            gift_name: text(key(d, "gift_name")),
            start_time: int(key(d, "start_time")),
            end_time: int(key(d, "end_time")),
        }
    }
}

/// The newer guard purchase toast (`USER_TOAST_MSG_V2`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserToastV2 {
    pub uid: u64,
    pub username: String,
    pub guard_level: u64,
    pub num: u64,
    pub price: u64,
    pub unit: String,
    pub gift_id: u64,
    pub start_time: i64,
    pub end_time: i64,
    pub source: i64,
    pub toast_msg: String,
}

impl UserToastV2 {
    pub fn from_command(cmd: &Command) -> Self {
        let d = cmd.data();
        let base = key(key(d, "sender_uinfo"), "base");
        let guard = key(d, "guard_info");
        let pay = key(d, "pay_info");
        Self {
            uid: uint(key(key(d, "sender_uinfo"), "uid").or_else(|| key(base, "uid"))),
            username: text(key(base, "name")),
            guard_level: uint(key(guard, "guard_level")),
            num: uint(key(pay, "num")),
            price: uint(key(pay, "price")),
            unit: text(key(pay, "unit")),
            gift_id: uint(key(key(d, "gift_info"), "gift_id")),
            start_time: int(key(guard, "start_time")),
            end_time: int(key(guard, "end_time")),
            source: int(key(key(d, "option"), "source")),
            toast_msg: text(key(d, "toast_msg")),
        }
    }
}

/// A paid pinned message (`SUPER_CHAT_MESSAGE`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuperChat {
    pub id: u64,
    pub uid: u64,
    pub uname: String,
    pub face: String,
    pub guard_level: u64,
    pub user_level: u64,
    /// Price in CNY.
    pub price: u64,
    pub message: String,
    pub message_trans: String,
    pub start_time: i64,
    pub end_time: i64,
    /// Seconds the message stays pinned.
    pub time: i64,
    pub gift_id: u64,
    pub gift_name: String,
    pub background_color: String,
    pub background_bottom_color: String,
    pub background_price_color: String,
    pub medal: Option<Medal>,
}

impl SuperChat {
    pub fn from_command(cmd: &Command) -> Self {
        let d = cmd.data();
        let user = key(d, "user_info");
        let gift = key(d, "gift");
        Self {
            id: uint(key(d, "id")),
            uid: uint(key(d, "uid")),
            uname: text(key(user, "uname")),
            face: text(key(user, "face")),
            guard_level: uint(key(user, "guard_level")),
            user_level: uint(key(user, "user_level")),
            price: uint(key(d, "price")),
            message: text(key(d, "message")),
            message_trans: text(key(d, "message_trans")),
            start_time: int(key(d, "start_time")),
            end_time: int(key(d, "end_time")),
            time: int(key(d, "time")),
            gift_id: uint(key(gift, "gift_id")),
            gift_name: text(key(gift, "gift_name")),
            background_color: text(key(d, "background_color")),
            background_bottom_color: text(key(d, "background_bottom_color")),
            background_price_color: text(key(d, "background_price_color")),
            medal: Medal::from_object(key(d, "medal_info")),
        }
    }
}

/// Retraction of one or more super chats (`SUPER_CHAT_MESSAGE_DELETE`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperChatDelete {
    pub ids: Vec<u64>,
}

impl SuperChatDelete {
    pub fn from_command(cmd: &Command) -> Self {
        let ids = key(cmd.data(), "ids")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().map(|id| uint(Some(id))).collect())
            .unwrap_or_default();
        Self { ids }
    }
}

/// What a user did in an `INTERACT_WORD` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractKind {
    #[default]
    Enter,
    Follow,
    Share,
    SpecialFollow,
    MutualFollow,
    Like,
    Unknown(i64),
}

impl From<i64> for InteractKind {
    fn from(value: i64) -> Self {
        match value {
            1 => Self::Enter,
            2 => Self::Follow,
            3 => Self::Share,
            4 => Self::SpecialFollow,
            5 => Self::MutualFollow,
            6 => Self::Like,
            other => Self::Unknown(other),
        }
    }
}

impl InteractKind {
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Enter => "entered the room",
            Self::Follow => "followed",
            Self::Share => "shared the room",
            Self::SpecialFollow => "special-followed",
            Self::MutualFollow => "followed back",
            Self::Like => "liked the stream",
            Self::Unknown(_) => "interacted",
        }
    }
}

/// A room interaction (`INTERACT_WORD`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractWord {
    pub uid: u64,
    pub uname: String,
    pub kind: InteractKind,
    pub timestamp: i64,
    pub medal: Option<Medal>,
}

impl InteractWord {
    pub fn from_command(cmd: &Command) -> Self {
        let d = cmd.data();
        Self {
            uid: uint(key(d, "uid")),
            uname: text(key(d, "uname")),
            kind: InteractKind::from(int(key(d, "msg_type"))),
            timestamp: int(key(d, "timestamp")),
            medal: Medal::from_object(key(d, "fans_medal")),
        }
    }
}

/// Any typed message the dispatcher knows how to build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveMessage {
    Heartbeat(Heartbeat),
    Danmaku(Danmaku),
    Gift(Gift),
    GuardBuy(GuardBuy),
    UserToastV2(UserToastV2),
    SuperChat(SuperChat),
    SuperChatDelete(SuperChatDelete),
    InteractWord(InteractWord),
}
