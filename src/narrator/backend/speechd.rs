//! Speech Dispatcher client (SSIP over its Unix socket).
//!
//! SSIP is line based. Replies are `NNN-data` continuation lines closed by
//! one `NNN text` line, answered in command order. Events (`7xx`) arrive
//! unsolicited once notifications are on:
//!
//! ```text
//! 700-<msg id>
//! 700-<client id>
//! 700-<mark name>
//! 700 INDEX_MARK
//! ```
//!
//! Utterances are sent as SSML with a `<mark name="N"/>` before every word,
//! N being the word's character offset, which gives word boundary events.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

use super::native::{PlatformEvent, SpeechPlatform, Utterance, UtteranceEvents};
use crate::error::PlatformError;
use crate::narrator::voices::Voice;

/// One complete SSIP reply or event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    /// Payload of the `NNN-` continuation lines.
    pub data: Vec<String>,
    /// Text of the closing `NNN ` line.
    pub text: String,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Accumulates lines into replies.
#[derive(Debug, Default)]
pub struct ReplyParser {
    data: Vec<String>,
}

impl ReplyParser {
    /// Feed one line (without the line terminator). Returns a reply once its
    /// closing line arrives.
    pub fn push(&mut self, line: &str) -> Result<Option<Reply>, PlatformError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let bytes = line.as_bytes();
        if bytes.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
            return Err(PlatformError::Protocol(format!("short line: {line:?}")));
        }
        let code: u16 = line[..3]
            .parse()
            .map_err(|_| PlatformError::Protocol(format!("bad status code: {line:?}")))?;
        let rest = line[4..].to_string();
        match bytes[3] {
            b'-' => {
                self.data.push(rest);
                Ok(None)
            }
            b' ' => Ok(Some(Reply {
                code,
                data: std::mem::take(&mut self.data),
                text: rest,
            })),
            _ => Err(PlatformError::Protocol(format!("bad separator: {line:?}"))),
        }
    }
}

/// SSIP speech rate (-100..=100) for a rate multiplier.
pub fn ssip_rate(rate: f32) -> i32 {
    let rate = f64::from(rate);
    let scaled = if rate >= 1.0 {
        (rate - 1.0) * 100.0
    } else {
        (rate - 1.0) * 200.0
    };
    (scaled.round() as i32).clamp(-100, 100)
}

fn escape_xml(text: &str, out: &mut String) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
}

/// Wrap text in SSML with a mark carrying the character offset of each word.
pub fn ssml_with_marks(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2 + 16);
    out.push_str("<speak>");
    let mut prev_space = true;
    for (index, ch) in text.chars().enumerate() {
        if prev_space && !ch.is_whitespace() {
            out.push_str(&format!("<mark name=\"{index}\"/>"));
        }
        prev_space = ch.is_whitespace();
        escape_xml(ch.encode_utf8(&mut [0; 4]), &mut out);
    }
    out.push_str("</speak>");
    out
}

/// Message body for `SPEAK`: CRLF lines, leading dots doubled, closed by a
/// lone dot.
pub fn speak_payload(message: &str) -> String {
    let mut out = String::with_capacity(message.len() + 8);
    for line in message.lines() {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str(".\r\n");
    out
}

/// `LIST SYNTHESIS_VOICES` data line: `name\tlanguage\tvariant`.
pub fn parse_voice_line(line: &str) -> Option<Voice> {
    let mut fields = line.split('\t');
    let name = fields.next()?.trim();
    if name.is_empty() {
        return None;
    }
    let language = fields.next().map(str::trim).filter(|l| !l.is_empty()).unwrap_or("none");
    Some(Voice::native(name, language))
}

type EventTx = mpsc::UnboundedSender<PlatformEvent>;

/// A command waiting for its reply.
struct Pending {
    reply: oneshot::Sender<Reply>,
    /// Set on the final part of a `SPEAK`: the message id in the reply is
    /// routed to this sender.
    events: Option<EventTx>,
}

enum Command {
    Line {
        line: String,
        reply: oneshot::Sender<Reply>,
    },
    Speak {
        payload: String,
        events: EventTx,
        reply: oneshot::Sender<Reply>,
    },
}

#[derive(Default)]
struct Shared {
    pending: Mutex<VecDeque<Pending>>,
    routes: Mutex<HashMap<u64, EventTx>>,
    voices: RwLock<Vec<Voice>>,
    voices_changed: Notify,
    connected: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SpeechDispatcher {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl SpeechDispatcher {
    /// Connect and configure the client. Voices are listed in the background.
    pub async fn connect(socket: &Path) -> Result<Arc<Self>, PlatformError> {
        let stream = UnixStream::connect(socket).await.map_err(|e| {
            PlatformError::Unavailable(format!("{}: {e}", socket.display()))
        })?;
        let (reader, writer) = stream.into_split();

        let shared = Arc::new(Shared::default());
        shared.connected.store(true, Ordering::SeqCst);
        let (commands, rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(reader, shared.clone()));
        tokio::spawn(write_loop(writer, rx, shared.clone()));

        let client = Arc::new(Self { commands, shared });
        for setup in [
            "SET self CLIENT_NAME user:readaloud:main",
            "SET self NOTIFICATION all on",
            "SET self SSML_MODE on",
        ] {
            let reply = client.request(setup).await?;
            if !reply.is_ok() {
                return Err(PlatformError::Protocol(format!("{setup}: {} {}", reply.code, reply.text)));
            }
        }
        info!("Connected to Speech Dispatcher at {}", socket.display());

        let lister = client.clone();
        tokio::spawn(async move {
            if let Err(e) = lister.refresh_voices().await {
                warn!("Failed to list Speech Dispatcher voices: {e}");
            }
        });
        Ok(client)
    }

    async fn request(&self, line: &str) -> Result<Reply, PlatformError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Line {
                line: format!("{line}\r\n"),
                reply,
            })
            .map_err(|_| PlatformError::Unavailable("connection closed".into()))?;
        rx.await
            .map_err(|_| PlatformError::Unavailable("connection closed".into()))
    }

    fn fire(&self, line: &str) {
        let (reply, _) = oneshot::channel();
        let _ = self.commands.send(Command::Line {
            line: format!("{line}\r\n"),
            reply,
        });
    }

    async fn refresh_voices(&self) -> Result<(), PlatformError> {
        let reply = self.request("LIST SYNTHESIS_VOICES").await?;
        if !reply.is_ok() {
            return Err(PlatformError::Protocol(format!("{} {}", reply.code, reply.text)));
        }
        let voices: Vec<Voice> = reply.data.iter().filter_map(|l| parse_voice_line(l)).collect();
        debug!("Speech Dispatcher lists {} voices", voices.len());
        *self.shared.voices.write().unwrap_or_else(PoisonError::into_inner) = voices;
        self.shared.voices_changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl SpeechPlatform for SpeechDispatcher {
    fn name(&self) -> &str {
        "speech-dispatcher"
    }

    fn voices(&self) -> Vec<Voice> {
        self.shared
            .voices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn voices_changed(&self) {
        self.shared.voices_changed.notified().await;
    }

    /// Output modules load lazily; asking again usually fills the list.
    async fn prime(&self) {
        if let Err(e) = self.refresh_voices().await {
            debug!("Voice refresh failed: {e}");
        }
    }

    async fn utter(&self, utterance: Utterance) -> Result<UtteranceEvents, PlatformError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(PlatformError::Unavailable("connection closed".into()));
        }

        let rate = self.request(&format!("SET self RATE {}", ssip_rate(utterance.rate))).await?;
        if !rate.is_ok() {
            warn!("Speech Dispatcher rejected rate: {} {}", rate.code, rate.text);
        }
        if let Some(voice) = &utterance.voice {
            let set = self.request(&format!("SET self SYNTHESIS_VOICE {voice}")).await?;
            if !set.is_ok() {
                warn!("Speech Dispatcher rejected voice {voice}: {} {}", set.code, set.text);
            }
        }

        let (events, rx) = mpsc::unbounded_channel();
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Speak {
                payload: speak_payload(&ssml_with_marks(&utterance.text)),
                events,
                reply,
            })
            .map_err(|_| PlatformError::Unavailable("connection closed".into()))?;
        let queued = reply_rx
            .await
            .map_err(|_| PlatformError::Unavailable("connection closed".into()))?;
        if queued.code != 225 {
            return Err(PlatformError::Protocol(format!("SPEAK: {} {}", queued.code, queued.text)));
        }
        Ok(rx)
    }

    fn pause(&self) {
        self.fire("PAUSE self");
    }

    fn resume(&self) {
        self.fire("RESUME self");
    }

    fn cancel(&self) {
        self.fire("CANCEL self");
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
) {
    while let Some(command) = commands.recv().await {
        let result = match command {
            Command::Line { line, reply } => {
                lock(&shared.pending).push_back(Pending { reply, events: None });
                writer.write_all(line.as_bytes()).await
            }
            // SPEAK is two exchanges; nothing else may be written between them.
            Command::Speak { payload, events, reply } => {
                let (ready, ready_rx) = oneshot::channel();
                lock(&shared.pending).push_back(Pending {
                    reply: ready,
                    events: None,
                });
                if let Err(e) = writer.write_all(b"SPEAK\r\n").await {
                    Err(e)
                } else {
                    match ready_rx.await {
                        Ok(r) if r.code == 230 => {
                            lock(&shared.pending).push_back(Pending {
                                reply,
                                events: Some(events),
                            });
                            writer.write_all(payload.as_bytes()).await
                        }
                        Ok(r) => {
                            let _ = reply.send(r);
                            Ok(())
                        }
                        Err(_) => break,
                    }
                }
            }
        };
        if let Err(e) = result {
            warn!("Speech Dispatcher write failed: {e}");
            break;
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
}

async fn read_loop(reader: OwnedReadHalf, shared: Arc<Shared>) {
    let mut lines = BufReader::new(reader).lines();
    let mut parser = ReplyParser::default();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Speech Dispatcher read failed: {e}");
                break;
            }
        };
        let reply = match parser.push(&line) {
            Ok(Some(reply)) => reply,
            Ok(None) => continue,
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };

        if (700..800).contains(&reply.code) {
            dispatch_event(&shared, &reply);
            continue;
        }

        let Some(pending) = lock(&shared.pending).pop_front() else {
            debug!("Unsolicited reply: {} {}", reply.code, reply.text);
            continue;
        };
        if let Some(events) = pending.events {
            if let Some(id) = reply.data.first().and_then(|d| d.trim().parse::<u64>().ok()) {
                lock(&shared.routes).insert(id, events);
            }
        }
        let _ = pending.reply.send(reply);
    }

    info!("Speech Dispatcher connection closed");
    shared.connected.store(false, Ordering::SeqCst);
    lock(&shared.pending).clear();
    for (_, events) in lock(&shared.routes).drain() {
        let _ = events.send(PlatformEvent::DeviceError("speech service disconnected".into()));
    }
}

fn dispatch_event(shared: &Shared, event: &Reply) {
    let Some(id) = event.data.first().and_then(|d| d.trim().parse::<u64>().ok()) else {
        return;
    };
    let mut routes = lock(&shared.routes);
    let mapped = match event.code {
        700 => event
            .data
            .get(2)
            .and_then(|mark| mark.trim().parse::<usize>().ok())
            .map(|char_index| PlatformEvent::Boundary { char_index }),
        702 => Some(PlatformEvent::End),
        703 => Some(PlatformEvent::Error("utterance cancelled by the speech service".into())),
        _ => None,
    };
    let Some(mapped) = mapped else {
        return;
    };
    let done = !matches!(mapped, PlatformEvent::Boundary { .. });
    if done {
        if let Some(tx) = routes.remove(&id) {
            let _ = tx.send(mapped);
        }
    } else if let Some(tx) = routes.get(&id) {
        let _ = tx.send(mapped);
    }
}
