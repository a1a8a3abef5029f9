use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aetheris_llm::{Model, default_gemini_models, resolve_model};
use aetheris_storage::{InlineImage, Message, MessageRole, SessionId, StoreEvent};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::chat::{ChatOrchestrator, SendOutcome};
use crate::settings::{ChatSettings, SettingsStore};

const HELP: &str = "commands: /new, /list, /switch <n>, /delete <n>, /image <path> [text], \
                    /model flash|pro, /search on|off, /quit";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ImageError {
    #[snafu(display("failed to read image '{}' on `{stage}`: {source}", path.display()))]
    ReadImage {
        stage: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[snafu(display("'{}' is not a supported image type", path.display()))]
    UnsupportedImage { stage: &'static str, path: PathBuf },
}

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    New,
    List,
    /// 1-based position in `/list`.
    Switch(usize),
    Delete(usize),
    /// Sends an image file with an optional caption.
    Image { path: PathBuf, text: String },
    Model(String),
    Search(bool),
    Help,
    Quit,
    Send(String),
    /// A known command with bad arguments.
    Usage(&'static str),
}

impl Command {
    /// Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Some(Self::Send(line.to_string()));
        };

        let (name, argument) = match command.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (command, ""),
        };

        let parsed = match name.to_ascii_lowercase().as_str() {
            "new" => Self::New,
            "list" => Self::List,
            "switch" => Self::position(argument)
                .map(Self::Switch)
                .unwrap_or(Self::Usage("usage: /switch <n>")),
            "delete" => Self::position(argument)
                .map(Self::Delete)
                .unwrap_or(Self::Usage("usage: /delete <n>")),
            "image" => match argument.split_once(char::is_whitespace) {
                Some((path, text)) => Self::Image {
                    path: PathBuf::from(path),
                    text: text.trim().to_string(),
                },
                None if !argument.is_empty() => Self::Image {
                    path: PathBuf::from(argument),
                    text: String::new(),
                },
                None => Self::Usage("usage: /image <path> [text]"),
            },
            "model" if !argument.is_empty() => Self::Model(argument.to_string()),
            "model" => Self::Usage("usage: /model flash|pro"),
            "search" => match argument.to_ascii_lowercase().as_str() {
                "on" => Self::Search(true),
                "off" => Self::Search(false),
                _ => Self::Usage("usage: /search on|off"),
            },
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => Self::Usage(HELP),
        };
        Some(parsed)
    }

    fn position(argument: &str) -> Option<usize> {
        argument.parse::<usize>().ok().filter(|position| *position > 0)
    }
}

/// Line-oriented chat front-end over a [`ChatOrchestrator`].
pub struct TerminalApp {
    orchestrator: Arc<ChatOrchestrator>,
    settings: Option<Arc<SettingsStore>>,
}

impl TerminalApp {
    pub fn new(orchestrator: Arc<ChatOrchestrator>) -> Self {
        Self {
            orchestrator,
            settings: None,
        }
    }

    /// Persists `/model` and `/search` changes through `settings`.
    pub fn with_settings(mut self, settings: Arc<SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn orchestrator(&self) -> &Arc<ChatOrchestrator> {
        &self.orchestrator
    }

    /// Reads commands from `input` until `/quit` or end of input.
    pub async fn run<R, W>(&self, input: R, output: W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.run_with_interrupts(input, output, stream::pending())
            .await
    }

    /// Like [`TerminalApp::run`], with an interrupt source such as [`ctrl_c_interrupts`].
    ///
    /// An interrupt while a reply streams cancels that reply. At the prompt it quits.
    pub async fn run_with_interrupts<R, W, I>(
        &self,
        input: R,
        mut output: W,
        mut interrupts: I,
    ) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        I: Stream<Item = ()> + Unpin,
    {
        self.current_or_new_session();
        let config = self.orchestrator.config();
        let model =
            resolve_model(&config.model_id).unwrap_or_else(|| Model::from_id(&config.model_id));
        write_line(
            &mut output,
            &format!(
                "aetheris ({} via {}), {HELP}",
                model.name,
                self.orchestrator.adapter().name()
            ),
        )
        .await?;
        output.flush().await?;

        let mut lines = input.lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                Some(()) = interrupts.next() => {
                    write_line(&mut output, "interrupted").await?;
                    break;
                }
            };
            let Some(line) = line else {
                break;
            };
            let Some(command) = Command::parse(&line) else {
                continue;
            };
            if command == Command::Quit {
                break;
            }
            self.execute(command, &mut output, &mut interrupts).await?;
            output.flush().await?;
        }

        output.flush().await
    }

    async fn execute<W, I>(
        &self,
        command: Command,
        output: &mut W,
        interrupts: &mut I,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
        I: Stream<Item = ()> + Unpin,
    {
        match command {
            Command::New => {
                self.orchestrator.create_session();
                write_line(output, "started a new chat").await
            }
            Command::List => self.list_sessions(output).await,
            Command::Switch(position) => match self.session_at(position) {
                Some(session_id) => match self.orchestrator.select_session(session_id) {
                    Ok(()) => write_line(output, &format!("switched to chat {position}")).await,
                    Err(error) => write_line(output, &format!("error: {error}")).await,
                },
                None => write_line(output, &format!("no chat at {position}")).await,
            },
            Command::Delete(position) => match self.session_at(position) {
                Some(session_id) => {
                    if let Err(error) = self.orchestrator.delete_session(session_id) {
                        return write_line(output, &format!("error: {error}")).await;
                    }
                    self.current_or_new_session();
                    write_line(output, &format!("deleted chat {position}")).await
                }
                None => write_line(output, &format!("no chat at {position}")).await,
            },
            Command::Model(query) => match resolve_model(&query) {
                Some(model) => {
                    self.orchestrator.set_model(model.id.clone());
                    self.persist(|settings| settings.model = model.id.clone());
                    write_line(output, &format!("model: {}", model.name)).await
                }
                None => {
                    let known = default_gemini_models()
                        .into_iter()
                        .map(|model| model.name)
                        .collect::<Vec<_>>()
                        .join(", ");
                    write_line(output, &format!("unknown model '{query}', try: {known}")).await
                }
            },
            Command::Search(enabled) => {
                self.orchestrator.set_grounded_search(enabled);
                self.persist(|settings| settings.enable_grounded_search = enabled);
                let state = if enabled { "on" } else { "off" };
                write_line(output, &format!("grounded search {state}")).await
            }
            Command::Help => write_line(output, HELP).await,
            Command::Usage(usage) => write_line(output, usage).await,
            Command::Send(text) => {
                let session_id = self.current_or_new_session();
                self.send(session_id, &text, None, output, interrupts).await
            }
            Command::Image { path, text } => match load_image(&path).await {
                Ok(image) => {
                    let session_id = self.current_or_new_session();
                    self.send(session_id, &text, Some(image), output, interrupts)
                        .await
                }
                Err(error) => write_line(output, &format!("error: {error}")).await,
            },
            Command::Quit => Ok(()),
        }
    }

    async fn list_sessions<W>(&self, output: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let store = self.orchestrator.store();
        let current = store.current_session_id();
        for (index, session) in store.list_sessions().iter().enumerate() {
            let marker = if Some(session.id) == current { '*' } else { ' ' };
            write_line(
                output,
                &format!(
                    "{marker} {}. {} ({} messages)",
                    index + 1,
                    session.title,
                    session.messages.len()
                ),
            )
            .await?;
        }
        Ok(())
    }

    async fn send<W, I>(
        &self,
        session_id: SessionId,
        text: &str,
        image: Option<InlineImage>,
        output: &mut W,
        interrupts: &mut I,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
        I: Stream<Item = ()> + Unpin,
    {
        let store = self.orchestrator.store().clone();
        let mut updates = store.subscribe_session(session_id);
        let send = self.orchestrator.send_message(session_id, text, image);
        tokio::pin!(send);

        let mut rendered = String::new();
        let result = loop {
            tokio::select! {
                result = &mut send => break result,
                Some(event) = updates.recv() => {
                    if let StoreEvent::MessageUpdated { message_id, .. } = event
                        && let Some(message) = store.get_message(session_id, message_id)
                        && message.role == MessageRole::Model
                    {
                        render_progress(&mut rendered, &message.text(), output).await?;
                    }
                }
                Some(()) = interrupts.next() => {
                    self.orchestrator.cancel_exchange(session_id);
                }
            }
        };

        match result {
            Ok(SendOutcome::Completed(message)) => {
                render_progress(&mut rendered, &message.text(), output).await?;
                output.write_all(b"\n").await?;
                render_sources(&message, output).await
            }
            Ok(SendOutcome::Skipped) => Ok(()),
            Err(error) if error.is_cancelled() => {
                write_line(output, "\n(cancelled)").await
            }
            Err(error) => write_line(output, &format!("\nerror: {error}")).await,
        }
    }

    fn current_or_new_session(&self) -> SessionId {
        match self.orchestrator.store().current_session_id() {
            Some(session_id) => session_id,
            None => self.orchestrator.create_session().id,
        }
    }

    fn session_at(&self, position: usize) -> Option<SessionId> {
        self.orchestrator
            .store()
            .list_sessions()
            .get(position.checked_sub(1)?)
            .map(|session| session.id)
    }

    fn persist(&self, change: impl FnOnce(&mut ChatSettings)) {
        let Some(settings) = &self.settings else {
            return;
        };
        if let Err(error) = settings.update(change) {
            tracing::warn!(error = %error, "failed to persist settings");
        }
    }
}

/// Ctrl-C presses for the whole session, from one listener.
///
/// Once installed, the handler replaces the default SIGINT exit, so the caller must keep
/// polling this stream for Ctrl-C to do anything.
pub fn ctrl_c_interrupts() -> BoxStream<'static, ()> {
    stream::unfold((), |()| async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Some(((), ())),
            Err(error) => {
                tracing::warn!(error = %error, "failed to listen for ctrl-c");
                None
            }
        }
    })
    .boxed()
}

/// Reads an image file and encodes it for an inline image part.
pub async fn load_image(path: &Path) -> Result<InlineImage, ImageError> {
    let mime_type = mime_guess::from_path(path)
        .first()
        .filter(|mime| mime.type_() == mime_guess::mime::IMAGE)
        .context(UnsupportedImageSnafu {
            stage: "guess-image-type",
            path,
        })?;
    let bytes = tokio::fs::read(path).await.context(ReadImageSnafu {
        stage: "read-image",
        path,
    })?;
    Ok(InlineImage::new(mime_type.essence_str(), BASE64.encode(bytes)))
}

async fn write_line<W>(output: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await
}

/// Prints the part of `text` not shown yet. A reply that shrank is reprinted whole.
async fn render_progress<W>(rendered: &mut String, text: &str, output: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match text.strip_prefix(rendered.as_str()) {
        Some(suffix) => output.write_all(suffix.as_bytes()).await?,
        None => {
            output.write_all(b"\n").await?;
            output.write_all(text.as_bytes()).await?;
        }
    }
    rendered.clear();
    rendered.push_str(text);
    Ok(())
}

async fn render_sources<W>(message: &Message, output: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if message.grounding_sources.is_empty() {
        return Ok(());
    }

    write_line(output, "sources:").await?;
    for (index, source) in message.grounding_sources.iter().enumerate() {
        write_line(
            output,
            &format!("  [{}] {} <{}>", index + 1, source.title, source.uri),
        )
        .await?;
    }
    Ok(())
}
