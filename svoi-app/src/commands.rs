//! Chat command parsing and reply formatting.

use crate::store::NamedStats;

pub const NOT_AUTHORIZED: &str = "You are not authorized to use this command";
pub const BROADCAST_NEEDS_REPLY: &str = "Please reply to a message to broadcast it";
pub const BROADCAST_NEEDS_TEXT: &str = "Please reply to a message with text to broadcast it";
pub const NO_STATS_YET: &str = "В этом чате пока никто не отличился";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stats,
    Pwd,
    Broadcast,
    RefreshStickers,
}

impl Command {
    pub const ALL: [Command; 4] = [
        Command::Stats,
        Command::Pwd,
        Command::Broadcast,
        Command::RefreshStickers,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Command::Stats => "svoistats",
            Command::Pwd => "pwd",
            Command::Broadcast => "broadcast",
            Command::RefreshStickers => "refreshstickers",
        }
    }

    pub fn admin_only(self) -> bool {
        matches!(self, Command::Broadcast | Command::RefreshStickers)
    }

    /// Match `text` against `/name` or `/name@bot_username`. Anything else,
    /// including trailing arguments, is not a command.
    pub fn parse(text: &str, bot_username: Option<&str>) -> Option<Self> {
        let rest = text.strip_prefix('/')?;
        let (name, mention) = match rest.split_once('@') {
            Some((name, mention)) => (name, Some(mention)),
            None => (rest, None),
        };
        if let Some(mention) = mention {
            if bot_username != Some(mention) {
                return None;
            }
        }
        Self::ALL.into_iter().find(|cmd| cmd.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PluralForm {
    One,
    Few,
    Many,
}

fn plural_form(n: u64) -> PluralForm {
    match (n % 10, n % 100) {
        (1, r) if r != 11 => PluralForm::One,
        (2..=4, r) if !(12..=14).contains(&r) => PluralForm::Few,
        _ => PluralForm::Many,
    }
}

/// Pick the Russian noun form agreeing with `n`.
pub fn plural<'a>(n: u64, one: &'a str, few: &'a str, many: &'a str) -> &'a str {
    match plural_form(n) {
        PluralForm::One => one,
        PluralForm::Few => few,
        PluralForm::Many => many,
    }
}

pub fn format_stats_line(stats: &NamedStats) -> String {
    format!(
        "{}: {} СВО и {} {} повлекли за собой {} {}",
        stats.display_name,
        stats.svo_count,
        stats.zov_count,
        plural(stats.zov_count, "ЗОВ", "ЗОВ-а", "ЗОВ-ов"),
        stats.likvidirovan_count,
        plural(
            stats.likvidirovan_count,
            "ЛИКВИДАЦИЮ",
            "ЛИКВИДАЦИИ",
            "ЛИКВИДАЦИЙ"
        ),
    )
}

pub fn format_stats(rows: &[NamedStats]) -> String {
    if rows.is_empty() {
        return NO_STATS_YET.to_string();
    }
    rows.iter()
        .map(format_stats_line)
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn format_pwd(chat_id: i64, is_admin: bool) -> String {
    let mut text = format!("chat_id: {chat_id}");
    if is_admin {
        text.push_str("\nis_admin: true");
    }
    text
}

pub fn format_broadcast_report(targets: usize, succeeded: usize, failed: usize) -> String {
    format!("Finished broadcasting to {targets} chats: {succeeded} success, {failed} failure")
}
