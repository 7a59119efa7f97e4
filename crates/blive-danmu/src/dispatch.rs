//! Routing of command envelopes to typed handler callbacks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{trace, warn};

use crate::codec::Command;
use crate::error::BliveError;
use crate::message::{
    Danmaku, Gift, GuardBuy, Heartbeat, InteractWord, LiveMessage, SuperChat, SuperChatDelete,
    UserToastV2,
};

/// Reactions to live-room events.
///
/// Every method has a no-op default so a handler only implements what it cares
/// about. Callbacks run on the receive loop and must return quickly; hand long
/// work off to a spawned task.
pub trait DanmuHandler: Send + Sync {
    fn on_heartbeat(&self, _msg: &Heartbeat) {}
    fn on_danmaku(&self, _msg: &Danmaku) {}
    fn on_gift(&self, _msg: &Gift) {}
    fn on_guard_buy(&self, _msg: &GuardBuy) {}
    fn on_user_toast_v2(&self, _msg: &UserToastV2) {}
    fn on_super_chat(&self, _msg: &SuperChat) {}
    fn on_super_chat_delete(&self, _msg: &SuperChatDelete) {}
    fn on_interact_word(&self, _msg: &InteractWord) {}

    /// Called for every envelope, known or not, before typed routing.
    fn on_command(&self, _cmd: &Command) {}

    /// Called once the gateway accepts the AUTH frame.
    fn on_authenticated(&self, _room_id: u64) {}

    /// Called once when the client stops. `error` is `None` for a clean close.
    fn on_client_stopped(&self, _error: Option<&BliveError>) {}
}

/// Builds a typed message from an envelope.
pub type Parser = fn(&Command) -> LiveMessage;

/// Plain callback subscription for raw envelopes.
pub type RawSubscriber = Arc<dyn Fn(&Command) + Send + Sync>;

/// Command types that are known to be high volume and deliberately unhandled.
pub const QUIET_COMMANDS: &[&str] = &[
    "COMBO_SEND",
    "ENTRY_EFFECT",
    "HOT_RANK_CHANGED",
    "HOT_RANK_CHANGED_V2",
    "LIVE",
    "LIVE_INTERACTIVE_GAME",
    "NOTICE_MSG",
    "ONLINE_RANK_COUNT",
    "ONLINE_RANK_TOP3",
    "ONLINE_RANK_V2",
    "ONLINE_RANK_V3",
    "PK_BATTLE_END",
    "PK_BATTLE_FINAL_PROCESS",
    "PK_BATTLE_PROCESS",
    "PK_BATTLE_PROCESS_NEW",
    "PK_BATTLE_SETTLE",
    "PK_BATTLE_SETTLE_USER",
    "PK_BATTLE_SETTLE_V2",
    "PREPARING",
    "ROOM_REAL_TIME_MESSAGE_UPDATE",
    "STOP_LIVE_ROOM_LIST",
    "SUPER_CHAT_MESSAGE_JPN",
    "USER_TOAST_MSG",
    "WIDGET_BANNER",
    "WATCHED_CHANGE",
    "INTERACT_WORD_V2",
    "LOG_IN_NOTICE",
];

/// What happened to a dispatched envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A parser was registered and the typed message was routed.
    Routed,
    /// No parser is registered. `logged` is true only on the first sighting.
    Unknown { logged: bool },
}

/// Maps command types to parsers and fans typed messages out to handlers.
pub struct CommandDispatcher {
    parsers: HashMap<String, Parser>,
    handlers: Vec<Arc<dyn DanmuHandler>>,
    subscribers: Vec<RawSubscriber>,
    seen_unknown: HashSet<String>,
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDispatcher {
    /// A dispatcher with the built-in parsers registered and the quiet set seeded.
    pub fn new() -> Self {
        let mut dispatcher = Self::empty();
        dispatcher.register(Command::HEARTBEAT, |c| {
            LiveMessage::Heartbeat(Heartbeat::from_command(c))
        });
        dispatcher.register("DANMU_MSG", |c| LiveMessage::Danmaku(Danmaku::from_command(c)));
        dispatcher.register("DANMU_MSG_MIRROR", |c| {
            LiveMessage::Danmaku(Danmaku::from_command(c))
        });
        dispatcher.register("SEND_GIFT", |c| LiveMessage::Gift(Gift::from_command(c)));
        dispatcher.register("GUARD_BUY", |c| LiveMessage::GuardBuy(GuardBuy::from_command(c)));
        dispatcher.register("USER_TOAST_MSG_V2", |c| {
            LiveMessage::UserToastV2(UserToastV2::from_command(c))
        });
        dispatcher.register("SUPER_CHAT_MESSAGE", |c| {
            LiveMessage::SuperChat(SuperChat::from_command(c))
        });
        dispatcher.register("SUPER_CHAT_MESSAGE_DELETE", |c| {
            LiveMessage::SuperChatDelete(SuperChatDelete::from_command(c))
        });
        dispatcher.register("INTERACT_WORD", |c| {
            LiveMessage::InteractWord(InteractWord::from_command(c))
        });
        dispatcher
            .seen_unknown
            .extend(QUIET_COMMANDS.iter().map(|s| s.to_string()));
        dispatcher
    }

    /// A dispatcher with nothing registered.
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
            handlers: Vec::new(),
            subscribers: Vec::new(),
            seen_unknown: HashSet::new(),
        }
    }

    /// Associate a command type with a parser, replacing any previous one.
    pub fn register(&mut self, cmd: impl Into<String>, parser: Parser) {
        self.parsers.insert(cmd.into(), parser);
    }

    pub fn add_handler(&mut self, handler: Arc<dyn DanmuHandler>) {
        self.handlers.push(handler);
    }

    pub fn subscribe(&mut self, subscriber: RawSubscriber) {
        self.subscribers.push(subscriber);
    }

    pub fn handlers(&self) -> &[Arc<dyn DanmuHandler>] {
        &self.handlers
    }

    pub fn dispatch(&mut self, cmd: &Command) -> DispatchOutcome {
        for subscriber in &self.subscribers {
            subscriber(cmd);
        }
        for handler in &self.handlers {
            handler.on_command(cmd);
        }

        let base = cmd.base_cmd();
        let Some(parser) = self.parsers.get(base) else {
            let logged = self.seen_unknown.insert(base.to_string());
            if logged {
                warn!(cmd = base, "Unhandled command type");
            }
            return DispatchOutcome::Unknown { logged };
        };

        let message = parser(cmd);
        trace!(cmd = base, "Dispatching");
        for handler in &self.handlers {
            route(handler.as_ref(), &message);
        }
        DispatchOutcome::Routed
    }
}

fn route(handler: &dyn DanmuHandler, message: &LiveMessage) {
    match message {
        LiveMessage::Heartbeat(m) => handler.on_heartbeat(m),
        LiveMessage::Danmaku(m) => handler.on_danmaku(m),
        LiveMessage::Gift(m) => handler.on_gift(m),
        LiveMessage::GuardBuy(m) => handler.on_guard_buy(m),
        LiveMessage::UserToastV2(m) => handler.on_user_toast_v2(m),
        LiveMessage::SuperChat(m) => handler.on_super_chat(m),
        LiveMessage::SuperChatDelete(m) => handler.on_super_chat_delete(m),
        LiveMessage::InteractWord(m) => handler.on_interact_word(m),
    }
}
