use blive_danmu::{BroadcastItem, BroadcastSink};
use colored::*;

/// Prints forwarded lines to stdout in their configured colour.
pub struct StdoutSink;

impl BroadcastSink for StdoutSink {
    fn deliver(&self, item: &BroadcastItem) {
        let c = item.color;
        println!("{}", item.text.truecolor(c.r, c.g, c.b));
    }
}

pub fn success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

pub fn warning(msg: &str) {
    println!("{} {}", "!".yellow().bold(), msg.yellow());
}

pub fn failure(msg: &str) {
    eprintln!("{} {}", "Error:".red().bold(), msg);
}

pub fn heading(msg: &str) {
    println!("{}", msg.bright_cyan().bold());
}
