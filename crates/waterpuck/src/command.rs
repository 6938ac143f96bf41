//! Classification of inbound requests into device commands.
//!
//! Clients embed a keyword near the start of an otherwise free-form payload,
//! typically the path of an HTTP request line (`GET /water_on HTTP/1.1`).
//! A keyword only counts when its first occurrence starts within the first
//! [`KEYWORD_WINDOW`] characters.
//!
//! `hello` is answered independently of everything else. Of the remaining
//! keywords at most one is acted upon, checked in the order `water_on`,
//! `water_off`, `water_time`, `exit`.

/// Keywords starting at or beyond this character position are ignored.
pub const KEYWORD_WINDOW: usize = 10;

pub const HELLO_REPLY: &str = "hello";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    WaterOn,
    WaterOff,
    /// Acknowledged but not acted upon; the watering time is fixed.
    WaterTime,
    Exit,
}

impl Command {
    /// In matching priority order.
    const ALL: [Command; 4] = [
        Command::WaterOn,
        Command::WaterOff,
        Command::WaterTime,
        Command::Exit,
    ];

    pub const fn keyword(&self) -> &'static str {
        match self {
            Command::WaterOn => "water_on",
            Command::WaterOff => "water_off",
            Command::WaterTime => "water_time",
            Command::Exit => "exit",
        }
    }

    /// Acknowledgement sent before acting. `exit` closes without a reply.
    pub const fn reply(&self) -> Option<&'static str> {
        match self {
            Command::WaterOn => Some("start watering"),
            Command::WaterOff => Some("stop watering"),
            Command::WaterTime => Some("changing watering time"),
            Command::Exit => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Request {
    pub greet: bool,
    pub command: Option<Command>,
}

impl Request {
    /// Classify a raw payload. Invalid UTF-8 is replaced, never rejected.
    pub fn parse(raw: &[u8]) -> Self {
        Self::classify(&String::from_utf8_lossy(raw))
    }

    pub fn classify(text: &str) -> Self {
        Self {
            greet: leads(text, HELLO_REPLY),
            command: Command::ALL
                .into_iter()
                .find(|c| leads(text, c.keyword())),
        }
    }
}

/// Character position of the first occurrence of `keyword`, if it falls
/// inside the window.
fn leads(text: &str, keyword: &str) -> bool {
    text.find(keyword)
        .map(|byte_at| text[..byte_at].chars().count())
        .is_some_and(|at| at < KEYWORD_WINDOW)
}
