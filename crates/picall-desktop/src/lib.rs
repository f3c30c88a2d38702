//! Terminal front-end: reads commands from stdin, prints the chat log, and
//! places or answers calls.

mod commands;
mod microphone;
mod terminal;

use std::path::PathBuf;
use std::rc::Rc;

use picall_core::{Backend, Client, ClientConfig, ClientHandle, MatrixBackend, MediaBackend, PicallError, Shell};
use picall_video::{AudioFeed, CaptureFeeds, LkMediaBackend};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};

pub use commands::{Command, parse_answer};
pub use microphone::Microphone;
pub use terminal::TerminalShell;

/// Capture feeds of this build. There is no camera feed, so calls send
/// audio only; without a microphone they send nothing.
fn capture_feeds(microphone: Option<Microphone>) -> CaptureFeeds {
    if microphone.is_none() {
        tracing::warn!("no microphone found, calls will not send audio");
    }
    CaptureFeeds {
        video: None,
        audio: microphone.map(|m| Rc::new(m) as Rc<dyn AudioFeed>),
    }
}

fn load_config(path: Option<String>) -> Result<ClientConfig, PicallError> {
    let path = match path {
        Some(p) => PathBuf::from(p),
        None => dirs::config_dir()
            .map(|dir| ClientConfig::path_in(&dir))
            .ok_or_else(|| PicallError::Config("no config directory on this platform".into()))?,
    };
    tracing::info!("loading config from {}", path.display());

    let mut config = ClientConfig::load(&path);
    config.apply_env(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

async fn execute(handle: &ClientHandle, command: Command) -> Result<bool, PicallError> {
    match command {
        Command::Quit => return Ok(false),
        Command::Text(text) => {
            // Failures are reported by a notice.
            let _ = handle.send_text(text).await?;
        }
        Command::Call => match handle.start_call().await? {
            Ok(call_id) => println!("calling ({call_id})"),
            Err(e) => println!("cannot call: {e}"),
        },
        Command::Hangup => {
            if let Err(e) = handle.end_call().await? {
                println!("cannot hang up: {e}");
            }
        }
        Command::Room(room_id) => handle.select_room(room_id).await?,
        Command::Rooms => {
            let active = handle.active_room().await?;
            for room in handle.rooms().await? {
                let marker = if active.as_deref() == Some(room.room_id.as_str()) { '*' } else { ' ' };
                println!("{marker} {} ({})", room.title, room.room_id);
            }
        }
        Command::Upload(path) => {
            let _ = handle.send_file(path).await?;
        }
        Command::Download(n, dest) => {
            let log = handle.history().await?;
            let entry = log
                .get(n - 1)
                .and_then(|m| Some((m.filename()?, m.download_url()?)));
            match entry {
                Some((name, url)) => {
                    if handle.download(url.to_string(), dest.clone()).await?.is_ok() {
                        println!("saved {name} to {}", dest.display());
                    }
                }
                None => println!("entry {n} has nothing to download"),
            }
        }
        Command::Usage(usage) => println!("usage: {usage}"),
    }
    Ok(true)
}

/// Where a typed line goes.
#[derive(Debug, PartialEq, Eq)]
enum LineRoute {
    Answered,
    Reprompt,
    Run(Command),
}

/// An open prompt takes the line as its answer. A prompt whose asker has
/// gone away is dropped and the line runs as a command.
fn route_line(pending: &mut Option<oneshot::Sender<bool>>, line: &str) -> LineRoute {
    if pending.as_ref().is_some_and(|p| p.is_closed()) {
        *pending = None;
    }
    let Some(prompt) = pending.take() else {
        return LineRoute::Run(Command::parse(line));
    };
    match parse_answer(line) {
        Some(answer) => {
            let _ = prompt.send(answer);
            LineRoute::Answered
        }
        None => {
            *pending = Some(prompt);
            LineRoute::Reprompt
        }
    }
}

/// Completes when the open prompt is withdrawn; never without one.
async fn withdrawn(pending: &mut Option<oneshot::Sender<bool>>) {
    match pending {
        Some(prompt) => prompt.closed().await,
        None => std::future::pending().await,
    }
}

/// Read stdin until `/quit` or end of input. Open prompts take the next line.
async fn command_loop(
    handle: ClientHandle,
    mut prompts: mpsc::UnboundedReceiver<oneshot::Sender<bool>>,
) -> Result<(), PicallError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending: Option<oneshot::Sender<bool>> = None;

    loop {
        tokio::select! {
            Some(prompt) = prompts.recv() => pending = Some(prompt),
            _ = withdrawn(&mut pending) => {
                pending = None;
                println!("(call no longer ringing)");
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match route_line(&mut pending, &line) {
                    LineRoute::Answered => {}
                    LineRoute::Reprompt => println!("please answer y or n"),
                    LineRoute::Run(command) => {
                        if !execute(&handle, command).await? {
                            break;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

async fn session(config: ClientConfig) -> Result<(), PicallError> {
    let password = config
        .password
        .clone()
        .ok_or_else(|| PicallError::Config("no password configured (set PICALL_PASSWORD)".into()))?;
    let backend = MatrixBackend::new(&config.homeserver, &config.user_id)?;
    let ice_servers = config.ice_servers.clone();
    let (prompt_tx, prompt_rx) = mpsc::unbounded_channel();

    let mut client = Client::start(
        config,
        move || Rc::new(backend) as Rc<dyn Backend>,
        move || {
            let feeds = capture_feeds(Microphone::detect());
            Rc::new(LkMediaBackend::new(ice_servers, feeds)) as Rc<dyn MediaBackend>
        },
        move || Box::new(TerminalShell::new(prompt_tx)) as Box<dyn Shell>,
    )?;

    if let Err(e) = client.login(&password).await {
        tracing::error!("login failed: {e}");
        client.shutdown().await;
        return Err(e);
    }
    client.start_sync();
    println!("{}", commands::HELP);

    let result = command_loop(client.handle(), prompt_rx).await;
    client.shutdown().await;
    result
}

pub fn run() -> Result<(), PicallError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("picall_core=info,picall_video=info,picall_desktop=info")
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(std::env::args().nth(1))?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(session(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_explicit_path_with_env_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"homeserver":"https://matrix.example.org","user_id":"@alice:example.org"}"#,
        )
        .unwrap();

        let config = load_config(Some(path.to_string_lossy().into_owned())).unwrap();
        assert_eq!(config.homeserver, "https://matrix.example.org");
        assert_eq!(config.sync_interval_ms, 500);
    }

    #[test]
    fn capture_is_audio_only() {
        let feeds = capture_feeds(Some(Microphone));
        assert!(feeds.audio.is_some());
        assert!(feeds.video.is_none());

        let silent = capture_feeds(None);
        assert!(silent.audio.is_none() && silent.video.is_none());
    }

    #[test]
    fn open_prompt_takes_the_answer() {
        let (tx, mut rx) = oneshot::channel();
        let mut pending = Some(tx);

        assert_eq!(route_line(&mut pending, "maybe"), LineRoute::Reprompt);
        assert!(pending.is_some());
        assert_eq!(route_line(&mut pending, "y"), LineRoute::Answered);
        assert!(pending.is_none());
        assert_eq!(rx.try_recv(), Ok(true));
    }

    #[test]
    fn withdrawn_prompt_no_longer_swallows_lines() {
        let (tx, rx) = oneshot::channel::<bool>();
        let mut pending = Some(tx);
        drop(rx);

        assert_eq!(route_line(&mut pending, "/hangup"), LineRoute::Run(Command::Hangup));
        assert!(pending.is_none());
        assert_eq!(
            route_line(&mut pending, "hello"),
            LineRoute::Run(Command::Text("hello".into()))
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"homeserver":"","user_id":"alice"}"#).unwrap();
        assert!(load_config(Some(path.to_string_lossy().into_owned())).is_err());
    }
}
