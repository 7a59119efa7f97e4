use blive_danmu::{BliveConfig, ClientState, Command, LiveSession, StartOutcome, parse_room_id};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::output::{StdoutSink, failure, heading, success, warning};

/// One line typed at the interactive prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    On,
    Off,
    Set(u64),
    Info,
    Reset,
    Reload,
    Help,
    Quit,
}

impl Verb {
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or("help").to_ascii_lowercase();
        match verb.as_str() {
            "on" => Ok(Verb::On),
            "off" => Ok(Verb::Off),
            "set" => parts
                .next()
                .and_then(parse_room_id)
                .map(Verb::Set)
                .ok_or_else(|| AppError::InvalidInput("usage: set <room id or URL>".into())),
            "info" => Ok(Verb::Info),
            "reset" => Ok(Verb::Reset),
            "reload" => Ok(Verb::Reload),
            "help" | "?" => Ok(Verb::Help),
            "quit" | "exit" => Ok(Verb::Quit),
            other => Err(AppError::InvalidInput(format!(
                "unknown command `{other}`, try `help`"
            ))),
        }
    }
}

fn hint_sessdata(config: &BliveConfig) {
    if config.sessdata().is_none() {
        warning("No SESSDATA configured, user names will be masked by the platform");
    }
}

fn build_session(config: &BliveConfig, raw: bool) -> LiveSession {
    let mut builder = LiveSession::builder(config.clone(), Arc::new(StdoutSink));
    if raw {
        builder = builder.subscribe(Arc::new(|cmd: &Command| {
            println!("{}", cmd.as_value());
        }));
    }
    builder.build()
}

/// Follow one room until Ctrl-C or until the connection ends.
pub async fn listen(config: AppConfig, room: Option<&str>, raw: bool) -> Result<()> {
    let room_id = match room {
        Some(room) => parse_room_id(room)
            .ok_or_else(|| AppError::InvalidInput(format!("not a room id or URL: {room}")))?,
        None => config
            .room_id
            .ok_or_else(|| AppError::InvalidInput("no room given and none configured".into()))?,
    };

    let session = build_session(&config.blive, raw);
    hint_sessdata(&config.blive);

    match session.start(room_id).await? {
        StartOutcome::Started(room) => success(&format!(
            "Listening to room {} (streamer uid {})",
            room.room_id, room.owner_uid
        )),
        StartOutcome::Disabled => {
            return Err(AppError::Config(
                "disabled in the configuration (blive.enabled = false)".into(),
            ));
        }
        StartOutcome::AlreadyRunning => {}
    }

    if let Some(mut state) = session.subscribe_state() {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            _ = state.wait_for(|s| *s == ClientState::Closed) => {
                warning("Connection to the live room ended");
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

/// Interactive prompt mirroring the on/off/set/info/reset verbs.
pub struct Console {
    config: AppConfig,
    config_path: Option<PathBuf>,
    sessdata: Option<String>,
    session: LiveSession,
    room_id: Option<u64>,
}

impl Console {
    pub fn new(config: AppConfig, config_path: Option<PathBuf>, sessdata: Option<String>) -> Self {
        let session = build_session(&config.blive, false);
        Self {
            room_id: config.room_id,
            config,
            config_path,
            sessdata,
            session,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        heading("=== Bilibili live interaction ===");
        print_help();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("> ");
            std::io::stdout().flush()?;

            let line = tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }

            match Verb::parse(&line) {
                Ok(Verb::Quit) => break,
                Ok(verb) => {
                    if let Err(e) = self.execute(verb).await {
                        failure(&e.to_string());
                    }
                }
                Err(e) => failure(&e.to_string()),
            }
        }

        self.session.shutdown().await;
        Ok(())
    }

    async fn execute(&mut self, verb: Verb) -> Result<()> {
        debug!(?verb, "Executing");
        match verb {
            Verb::On => {
                let Some(room_id) = self.room_id else {
                    warning("No room set, use `set <room id>` first");
                    return Ok(());
                };
                hint_sessdata(&self.config.blive);
                match self.session.start(room_id).await? {
                    StartOutcome::Started(room) => {
                        success(&format!("Listening to room {}", room.room_id))
                    }
                    StartOutcome::AlreadyRunning => warning("Already listening"),
                    StartOutcome::Disabled => {
                        warning("Disabled in the configuration (blive.enabled = false)")
                    }
                }
            }
            Verb::Off => {
                if self.session.stop().await {
                    success("Stopped listening");
                } else {
                    warning("Not listening");
                }
            }
            Verb::Set(room_id) => {
                if self.session.is_running() {
                    warning("Currently listening, run `off` first");
                } else {
                    self.room_id = Some(room_id);
                    success(&format!("Room set to {room_id}"));
                }
            }
            Verb::Info => self.print_info(),
            Verb::Reset => {
                self.session.stop().await;
                self.room_id = None;
                success("Stopped and cleared the room");
            }
            Verb::Reload => {
                let mut config = AppConfig::load(self.config_path.as_deref())?;
                if let Some(sessdata) = &self.sessdata {
                    config.blive.sessdata = Some(sessdata.clone());
                }
                self.session.set_config(config.blive.clone());
                self.session.apply_broadcast_config(&config.blive);
                self.config = config;
                success("Configuration reloaded, forwarding options apply on the next `on`");
            }
            Verb::Help => print_help(),
            Verb::Quit => {}
        }
        Ok(())
    }

    fn print_info(&self) {
        let info = self.session.info();
        heading("=== Status ===");
        match self.room_id {
            Some(room_id) => println!("Room: {room_id}"),
            None => println!("Room: not set"),
        }
        if let Some(room) = &info.room {
            println!(
                "Resolved: room {} (streamer uid {}, own uid {})",
                room.room_id, room.owner_uid, room.uid
            );
        }
        println!(
            "Listening: {} ({:?})",
            if info.running { "yes" } else { "no" },
            info.state
        );
        let config = self.session.config();
        if info.throttled {
            println!("Broadcast: throttled to {}/s", config.max_broadcast_per_second);
        } else {
            println!("Broadcast: direct");
        }
        println!(
            "SESSDATA: {}",
            if config.sessdata().is_some() { "set" } else { "not set" }
        );
    }
}

fn print_help() {
    println!("  on            start listening to the current room");
    println!("  off           stop listening");
    println!("  set <room>    choose the room (id or URL)");
    println!("  info          show status");
    println!("  reset         stop and clear the room");
    println!("  reload        re-read the configuration file");
    println!("  quit          exit");
}
