//! Line commands of the terminal frontend.

use std::path::PathBuf;

pub const HELP: &str = "\
commands:
  list                 books with their progress
  open <book>          open a book (resumes where you left off)
  play | pause         start or stop narration
  intro                play the book introduction, then chapter start
  next | prev          jump to the next / previous chapter
  seek <c> <p>         jump to chapter c, paragraph p (both from 1)
  rate <x>             speaking rate, 0.5 to 3.0
  voices               ranked voices
  voice <id>           choose a voice
  status               current state and position
  dismiss              clear the error notice
  export [path]        write a progress backup
  import <path>        restore progress from a backup
  help | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    List,
    Open(String),
    Play,
    Pause,
    Intro,
    Next,
    Prev,
    /// Zero-based chapter and paragraph
    Seek(usize, usize),
    Rate(f32),
    Voices,
    Voice(String),
    Status,
    Dismiss,
    Export(Option<PathBuf>),
    Import(PathBuf),
    Quit,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();

    let cmd = match (head.to_ascii_lowercase().as_str(), rest.as_slice()) {
        ("help" | "?", _) => Command::Help,
        ("list" | "ls", []) => Command::List,
        ("open", [id]) => Command::Open(id.to_string()),
        ("play", []) => Command::Play,
        ("pause" | "stop", []) => Command::Pause,
        ("intro", []) => Command::Intro,
        ("next", []) => Command::Next,
        ("prev", []) => Command::Prev,
        ("seek", [c, p]) => Command::Seek(one_based(c)?, one_based(p)?),
        ("rate", [x]) => Command::Rate(
            x.parse::<f32>()
                .map_err(|_| format!("not a number: {}", x))?,
        ),
        ("voices", []) => Command::Voices,
        ("voice", [id]) => Command::Voice(id.to_string()),
        ("status", []) => Command::Status,
        ("dismiss", []) => Command::Dismiss,
        ("export", []) => Command::Export(None),
        ("export", [path]) => Command::Export(Some(PathBuf::from(path))),
        ("import", [path]) => Command::Import(PathBuf::from(path)),
        ("quit" | "exit" | "q", []) => Command::Quit,
        (other, _) => return Err(format!("unknown command or arguments: {} (try `help`)", other)),
    };
    Ok(Some(cmd))
}

fn one_based(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n - 1),
        _ => Err(format!("expected a number from 1: {}", s)),
    }
}
