// =============================================================================
// Operator command channel — line-oriented control surface
// =============================================================================
//
// Command set and admin-id check are grounded on
// `original_source/async_trader.py::command_loop`. The poll-then-filter-by-
// sender shape of `CommandChannel::poll` is grounded on
// `original_source/telegram_commands.py::TelegramCommandPoller`, which the
// spec generalises away from Telegram specifically — this crate stands it
// up over stdin, which is enough to exercise the control surface without
// committing to a chat transport.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::types::StrategyMode;

/// A parsed operator command, paired with the sender id it arrived with.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Pause,
    Resume,
    Status,
    Autocoins,
    Symbols,
    Risk,
    Flat,
    Selftest,
    Mode(StrategyMode),
    Size(f64),
    Lev(i32),
}

/// Parses one line of operator input into a [`Command`], normalising
/// `/cmd@botname arg` to `/cmd arg` the way the reference poller does, and
/// matching case-insensitively. Returns `None` for unrecognised input
/// rather than erroring — stray chat noise is routine, not exceptional.
pub fn parse_command(line: &str) -> Option<Command> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let mut name = parts.next().unwrap_or("").to_ascii_lowercase();
    let arg = parts.next().map(str::trim).unwrap_or("");

    if let Some((head, _)) = name.split_once('@') {
        name = head.to_string();
    }

    match name.as_str() {
        "/pause" => Some(Command::Pause),
        "/resume" => Some(Command::Resume),
        "/status" => Some(Command::Status),
        "/autocoins" => Some(Command::Autocoins),
        "/symbols" => Some(Command::Symbols),
        "/risk" => Some(Command::Risk),
        "/flat" => Some(Command::Flat),
        "/selftest" => Some(Command::Selftest),
        "/mode" => arg.parse::<StrategyMode>().ok().map(Command::Mode),
        "/size" => arg.parse::<f64>().ok().map(Command::Size),
        "/lev" => arg.parse::<i32>().ok().map(Command::Lev),
        _ => None,
    }
}

/// Whether `sender_id` is authorised to issue commands. An empty
/// `admin_user_id` (the default) means no admin gate is configured and
/// every sender is accepted, matching `CFG.admin_user_id and from_id !=
/// str(CFG.admin_user_id)` in the reference (a falsy `admin_user_id`
/// short-circuits the check).
pub fn is_authorised(admin_user_id: &str, sender_id: &str) -> bool {
    admin_user_id.is_empty() || admin_user_id.eq_ignore_ascii_case(sender_id)
}

/// A raw line of operator input together with the id of whoever sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub text: String,
    pub sender_id: String,
}

/// Abstracts the transport the operator issues commands over. The spec
/// treats the chat transport itself as out of scope; this trait is the
/// seam a Telegram/Slack/whatever poller would implement in its place.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Returns newly available inbound messages since the last poll.
    /// Transport errors are swallowed and reported as an empty batch —
    /// matching the reference poller's `except Exception: return []`.
    async fn poll(&mut self) -> Vec<Inbound>;

    /// Best-effort reply to the operator. Failures are swallowed per
    /// spec.md §7's "operator-facing messages are best-effort" policy.
    async fn reply(&mut self, text: &str);
}

/// A [`CommandChannel`] over the process's standard input, used when no
/// chat transport is configured. Reads are non-blocking to the async
/// scheduler via `tokio::io::AsyncBufReadExt`.
pub struct StdinCommandChannel {
    lines: tokio::io::Lines<tokio::io::BufReader<tokio::io::Stdin>>,
}

impl StdinCommandChannel {
    pub fn new() -> Self {
        use tokio::io::AsyncBufReadExt;
        let reader = tokio::io::BufReader::new(tokio::io::stdin());
        Self {
            lines: reader.lines(),
        }
    }
}

impl Default for StdinCommandChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandChannel for StdinCommandChannel {
    async fn poll(&mut self) -> Vec<Inbound> {
        let mut out = Vec::new();
        while let Ok(Some(line)) = self.lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            out.push(Inbound {
                text: line,
                sender_id: String::new(),
            });
        }
        out
    }

    async fn reply(&mut self, text: &str) {
        println!("{text}");
    }
}

/// Runs [`parse_command`] and [`is_authorised`] over a batch of inbound
/// messages, returning only the commands that passed both checks. Keeps
/// `orchestrator.rs`'s command loop body free of parsing details.
pub fn accepted_commands(admin_user_id: &str, inbound: Vec<Inbound>) -> Vec<Command> {
    inbound
        .into_iter()
        .filter_map(|msg| {
            if !is_authorised(admin_user_id, &msg.sender_id) {
                warn!(sender = %msg.sender_id, "rejected command from unauthorised sender");
                return None;
            }
            parse_command(&msg.text)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_commands_case_insensitively() {
        assert_eq!(parse_command("/PAUSE"), Some(Command::Pause));
        assert_eq!(parse_command("  /resume  "), Some(Command::Resume));
        assert_eq!(parse_command("/flat"), Some(Command::Flat));
    }

    #[test]
    fn normalises_botname_suffix() {
        assert_eq!(parse_command("/status@mybot"), Some(Command::Status));
    }

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(parse_command("/mode advanced"), Some(Command::Mode(StrategyMode::Advanced)));
        assert_eq!(parse_command("/size 25.5"), Some(Command::Size(25.5)));
        assert_eq!(parse_command("/lev 20"), Some(Command::Lev(20)));
    }

    #[test]
    fn rejects_malformed_argument() {
        assert_eq!(parse_command("/size not-a-number"), None);
        assert_eq!(parse_command("/mode sideways"), None);
    }

    #[test]
    fn unrecognised_text_is_none() {
        assert_eq!(parse_command("hello there"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn empty_admin_id_accepts_everyone() {
        assert!(is_authorised("", "12345"));
        assert!(is_authorised("", ""));
    }

    #[test]
    fn configured_admin_id_rejects_others() {
        assert!(is_authorised("42", "42"));
        assert!(!is_authorised("42", "99"));
    }

    #[test]
    fn accepted_commands_filters_unauthorised_senders() {
        let inbound = vec![
            Inbound { text: "/pause".into(), sender_id: "1".into() },
            Inbound { text: "/resume".into(), sender_id: "2".into() },
        ];
        let cmds = accepted_commands("1", inbound);
        assert_eq!(cmds, vec![Command::Pause]);
    }
}
