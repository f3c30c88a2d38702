use std::path::PathBuf;

/// A line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Call,
    Hangup,
    Room(String),
    Rooms,
    Upload(PathBuf),
    /// 1-based index into the displayed log, then the destination path.
    Download(usize, PathBuf),
    Quit,
    Text(String),
    Usage(&'static str),
}

pub const HELP: &str = "/call  /hangup  /room <id>  /rooms  /upload <path>  /download <n> <path>  /quit";

impl Command {
    pub fn parse(line: &str) -> Command {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Text(line.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };

        match name {
            "call" => Command::Call,
            "hangup" => Command::Hangup,
            "rooms" => Command::Rooms,
            "quit" => Command::Quit,
            "room" if !arg.is_empty() => Command::Room(arg.to_string()),
            "room" => Command::Usage("/room <id>"),
            "upload" if !arg.is_empty() => Command::Upload(PathBuf::from(arg)),
            "upload" => Command::Usage("/upload <path>"),
            "download" => match arg.split_once(char::is_whitespace) {
                Some((n, path)) => match n.parse::<usize>() {
                    Ok(n) if n > 0 && !path.trim().is_empty() => {
                        Command::Download(n, PathBuf::from(path.trim()))
                    }
                    _ => Command::Usage("/download <n> <path>"),
                },
                None => Command::Usage("/download <n> <path>"),
            },
            _ => Command::Usage(HELP),
        }
    }
}

/// Interpret an answer to a yes/no prompt.
pub fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_text() {
        assert_eq!(Command::parse("  hello there "), Command::Text("hello there".into()));
    }

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(Command::parse("/call"), Command::Call);
        assert_eq!(Command::parse("/hangup"), Command::Hangup);
        assert_eq!(
            Command::parse("/room !lobby:example.org"),
            Command::Room("!lobby:example.org".into())
        );
        assert_eq!(
            Command::parse("/upload /tmp/cat photo.png"),
            Command::Upload(PathBuf::from("/tmp/cat photo.png"))
        );
        assert_eq!(
            Command::parse("/download 3 ~/report.pdf"),
            Command::Download(3, PathBuf::from("~/report.pdf"))
        );
        assert_eq!(Command::parse("/quit"), Command::Quit);
    }

    #[test]
    fn bad_arguments_give_usage() {
        assert_eq!(Command::parse("/room"), Command::Usage("/room <id>"));
        assert_eq!(
            Command::parse("/download zero out.bin"),
            Command::Usage("/download <n> <path>")
        );
        assert_eq!(
            Command::parse("/download 0 out.bin"),
            Command::Usage("/download <n> <path>")
        );
        assert_eq!(Command::parse("/dance"), Command::Usage(HELP));
    }

    #[test]
    fn answers() {
        assert_eq!(parse_answer("Y"), Some(true));
        assert_eq!(parse_answer(" no "), Some(false));
        assert_eq!(parse_answer("maybe"), None);
    }
}
