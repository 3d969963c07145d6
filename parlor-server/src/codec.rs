//! Textual command vocabulary.
//!
//! One command per framed line, whitespace-separated. The transport layer
//! never parses these; only the application handler does.

use parlor_types::SeatIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Protocol version announcement; must precede login.
    Version(i32),
    Login { name: String, credential: String },
    Join { session: String, seat: Option<SeatIndex> },
    Sit { session: String, seat: SeatIndex },
    Leave { session: String },
    Move { session: String, text: String },
    Reset { session: String },
    Vote { session: String, yes: bool },
    Say { session: String, text: String },
    /// Volunteer as an automated substitute participant.
    Enlist,
    Ping,
    Quit,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    Empty,
    Unknown(String),
    BadArgs(&'static str),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty command"),
            Self::Unknown(word) => write!(f, "unknown command '{}'", word),
            Self::BadArgs(usage) => write!(f, "usage: {}", usage),
        }
    }
}

impl std::error::Error for CodecError {}

/// Parse one raw line into a command.
pub fn parse(raw: &str) -> Result<Command, CodecError> {
    let mut parts = raw.split_whitespace();
    let word = parts.next().ok_or(CodecError::Empty)?;

    match word {
        "version" => {
            let v: i32 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or(CodecError::BadArgs("version <n>"))?;
            Ok(Command::Version(v))
        }
        "login" => {
            let name = parts.next().ok_or(CodecError::BadArgs("login <name> <credential>"))?;
            let credential = parts
                .next()
                .ok_or(CodecError::BadArgs("login <name> <credential>"))?;
            Ok(Command::Login {
                name: name.to_string(),
                credential: credential.to_string(),
            })
        }
        "join" => {
            let session = parts.next().ok_or(CodecError::BadArgs("join <session> [seat]"))?;
            let seat = match parts.next() {
                Some(s) => Some(
                    s.parse::<usize>()
                        .map(SeatIndex::new)
                        .map_err(|_| CodecError::BadArgs("join <session> [seat]"))?,
                ),
                None => None,
            };
            Ok(Command::Join {
                session: session.to_string(),
                seat,
            })
        }
        "sit" => {
            let session = parts.next().ok_or(CodecError::BadArgs("sit <session> <seat>"))?;
            let seat = parts
                .next()
                .and_then(|s| s.parse::<usize>().ok())
                .map(SeatIndex::new)
                .ok_or(CodecError::BadArgs("sit <session> <seat>"))?;
            Ok(Command::Sit {
                session: session.to_string(),
                seat,
            })
        }
        "leave" => {
            let session = parts.next().ok_or(CodecError::BadArgs("leave <session>"))?;
            Ok(Command::Leave {
                session: session.to_string(),
            })
        }
        "move" => {
            let session = parts.next().ok_or(CodecError::BadArgs("move <session> <move...>"))?;
            let text = parts.collect::<Vec<_>>().join(" ");
            if text.is_empty() {
                return Err(CodecError::BadArgs("move <session> <move...>"));
            }
            Ok(Command::Move {
                session: session.to_string(),
                text,
            })
        }
        "reset" => {
            let session = parts.next().ok_or(CodecError::BadArgs("reset <session>"))?;
            Ok(Command::Reset {
                session: session.to_string(),
            })
        }
        "vote" => {
            let session = parts.next().ok_or(CodecError::BadArgs("vote <session> yes|no"))?;
            let yes = match parts.next() {
                Some("yes") => true,
                Some("no") => false,
                _ => return Err(CodecError::BadArgs("vote <session> yes|no")),
            };
            Ok(Command::Vote {
                session: session.to_string(),
                yes,
            })
        }
        "say" => {
            let session = parts.next().ok_or(CodecError::BadArgs("say <session> <text...>"))?;
            let text = parts.collect::<Vec<_>>().join(" ");
            if text.is_empty() {
                return Err(CodecError::BadArgs("say <session> <text...>"));
            }
            Ok(Command::Say {
                session: session.to_string(),
                text,
            })
        }
        "enlist" => Ok(Command::Enlist),
        "ping" => Ok(Command::Ping),
        "quit" => Ok(Command::Quit),
        other => Err(CodecError::Unknown(other.to_string())),
    }
}

impl Command {
    /// Render back to the wire form `parse` accepts.
    pub fn serialize(&self) -> String {
        match self {
            Self::Version(v) => format!("version {}", v),
            Self::Login { name, credential } => format!("login {} {}", name, credential),
            Self::Join {
                session,
                seat: Some(seat),
            } => format!("join {} {}", session, seat),
            Self::Join {
                session,
                seat: None,
            } => format!("join {}", session),
            Self::Sit { session, seat } => format!("sit {} {}", session, seat),
            Self::Leave { session } => format!("leave {}", session),
            Self::Move { session, text } => format!("move {} {}", session, text),
            Self::Reset { session } => format!("reset {}", session),
            Self::Vote { session, yes } => {
                format!("vote {} {}", session, if *yes { "yes" } else { "no" })
            }
            Self::Say { session, text } => format!("say {} {}", session, text),
            Self::Enlist => "enlist".into(),
            Self::Ping => "ping".into(),
            Self::Quit => "quit".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_join_with_seat() {
        assert_eq!(
            parse("join lounge 2").unwrap(),
            Command::Join {
                session: "lounge".into(),
                seat: Some(SeatIndex::new(2)),
            }
        );
    }

    #[test]
    fn parse_join_without_seat() {
        assert_eq!(
            parse("join lounge").unwrap(),
            Command::Join {
                session: "lounge".into(),
                seat: None,
            }
        );
    }

    #[test]
    fn parse_move_keeps_argument_text() {
        assert_eq!(
            parse("move lounge bid 5").unwrap(),
            Command::Move {
                session: "lounge".into(),
                text: "bid 5".into(),
            }
        );
    }

    #[test]
    fn parse_vote() {
        assert_eq!(
            parse("vote lounge no").unwrap(),
            Command::Vote {
                session: "lounge".into(),
                yes: false,
            }
        );
        assert_eq!(
            parse("vote lounge maybe").unwrap_err(),
            CodecError::BadArgs("vote <session> yes|no")
        );
    }

    #[test]
    fn parse_rejects_unknown_and_empty() {
        assert!(matches!(parse("launch"), Err(CodecError::Unknown(_))));
        assert_eq!(parse("   ").unwrap_err(), CodecError::Empty);
    }

    #[test]
    fn serialize_round_trips() {
        let commands = [
            "version 2",
            "login alice secret",
            "join lounge 1",
            "join lounge",
            "sit lounge 3",
            "leave lounge",
            "move lounge bid 5",
            "reset lounge",
            "vote lounge yes",
            "say lounge hello there",
            "enlist",
            "ping",
            "quit",
        ];
        for raw in commands {
            let command = parse(raw).unwrap();
            assert_eq!(command.serialize(), raw);
        }
    }
}
