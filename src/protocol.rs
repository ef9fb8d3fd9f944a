//! Line-oriented TCP command protocol.
//!
//! A request is `<command>[?] [params...]`; the trailing `?` selects the
//! query variant of a command. Every request is answered with `OK` or
//! `ERROR` on its own line, followed by the payload, and the session stays
//! open until the client sends `exit`.

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::alarm::queue::{ControlCommand, LightAction};
use crate::error::CommandError;
use crate::logging::LogControl;
use crate::remote::Remote;

pub const MAX_REQUEST_LEN: usize = 100;
const PROMPT: &str = "command: ";
const MANUAL_DIM_SECONDS: u32 = 600;
const POLL: Duration = Duration::from_millis(200);
/// Bytes buffered per request line, room for a CRLF included. Anything
/// longer is discarded up to the next newline.
const MAX_LINE_BYTES: usize = MAX_REQUEST_LEN * 4 + 2;

/// A command with a set and a get variant.
pub trait CommandHandler: Send + Sync {
    fn set(&self, remote: &Remote, params: &[&str]) -> Result<String, CommandError>;
    fn get(&self, remote: &Remote, params: &[&str]) -> Result<String, CommandError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<'a> {
    pub name: String,
    pub query: bool,
    pub params: Vec<&'a str>,
}

pub fn parse_request(line: &str) -> Result<Request<'_>, CommandError> {
    let mut tokens = line.split_whitespace();
    let Some(head) = tokens.next() else {
        return Err(CommandError::protocol("empty request"));
    };
    let (name, query) = match head.strip_suffix('?') {
        Some(name) => (name, true),
        None => (head, false),
    };
    if name.is_empty() {
        return Err(CommandError::protocol("missing command name"));
    }
    Ok(Request {
        name: name.to_ascii_lowercase(),
        query,
        params: tokens.collect(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(String),
    Error(String),
    Exit,
}

impl Reply {
    pub fn render(&self) -> String {
        match self {
            Reply::Ok(payload) => frame("OK", payload),
            Reply::Error(message) => frame("ERROR", message),
            Reply::Exit => String::new(),
        }
    }
}

fn frame(status: &str, payload: &str) -> String {
    if payload.is_empty() {
        format!("{status}\n")
    } else if payload.ends_with('\n') {
        format!("{status}\n{payload}")
    } else {
        format!("{status}\n{payload}\n")
    }
}

/// Commands by name. Names are checked once, when registered.
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Box<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The commands served by the daemon.
    pub fn standard(log: LogControl) -> Result<Self> {
        let mut registry = Self::new();
        registry.register("loglevel", LogLevelCommand { control: log })?;
        registry.register("sound", SoundCommand)?;
        registry.register("lights", LightsCommand)?;
        registry.register("timer", TimerCommand)?;
        registry.register("calendar", CalendarCommand)?;
        Ok(registry)
    }

    pub fn register(&mut self, name: &str, handler: impl CommandHandler + 'static) -> Result<()> {
        if name.is_empty()
            || name.chars().any(|ch| ch.is_whitespace() || ch == '?')
            || name != name.to_ascii_lowercase()
        {
            bail!("invalid command name '{name}'");
        }
        if matches!(name, "exit" | "help") {
            bail!("command name '{name}' is reserved");
        }
        if self.commands.contains_key(name) {
            bail!("command '{name}' registered twice");
        }
        self.commands.insert(name.to_string(), Box::new(handler));
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    pub fn execute(&self, remote: &Remote, line: &str) -> Reply {
        if line.len() > MAX_REQUEST_LEN {
            return Reply::Error(format!(
                "request longer than {MAX_REQUEST_LEN} characters"
            ));
        }
        let request = match parse_request(line) {
            Ok(request) => request,
            Err(err) => return Reply::Error(err.to_string()),
        };
        match request.name.as_str() {
            "exit" => return Reply::Exit,
            "help" => {
                let mut names = self.names().collect::<Vec<_>>();
                names.extend(["exit", "help"]);
                return Reply::Ok(names.join("\n"));
            }
            _ => {}
        }
        let Some(handler) = self.commands.get(&request.name) else {
            return Reply::Error(format!("Unknown command {}", request.name));
        };
        let result = if request.query {
            handler.get(remote, &request.params)
        } else {
            handler.set(remote, &request.params)
        };
        match result {
            Ok(payload) => Reply::Ok(payload),
            Err(err) => {
                debug!("command '{line}' failed: {err}");
                Reply::Error(err.to_string())
            }
        }
    }
}

fn param<'a>(params: &[&'a str], index: usize, what: &str) -> Result<&'a str, CommandError> {
    params
        .get(index)
        .copied()
        .ok_or_else(|| CommandError::protocol(format!("missing {what}")))
}

fn number<T: std::str::FromStr>(text: &str, what: &str) -> Result<T, CommandError> {
    text.parse()
        .map_err(|_| CommandError::protocol(format!("{what} must be a number, got '{text}'")))
}

fn percent(text: &str, what: &str) -> Result<u8, CommandError> {
    let value = number::<i64>(text, what)?;
    if value < 0 {
        return Err(CommandError::validation(format!(
            "{what} must not be negative"
        )));
    }
    if value > 100 {
        return Err(CommandError::validation(format!(
            "{what} must be between 0 and 100"
        )));
    }
    Ok(value as u8)
}

/// `off` clears the timer, a number of seconds starts it.
fn set_timer(remote: &Remote, text: &str) -> Result<(), CommandError> {
    if text.eq_ignore_ascii_case("off") {
        remote.delete_sound_timer();
        return Ok(());
    }
    let seconds = number::<u32>(text, "timer")?;
    if seconds == 0 {
        remote.delete_sound_timer();
    } else {
        remote.set_sound_timer(seconds);
    }
    Ok(())
}

struct LogLevelCommand {
    control: LogControl,
}

impl CommandHandler for LogLevelCommand {
    fn set(&self, _remote: &Remote, params: &[&str]) -> Result<String, CommandError> {
        let name = param(params, 0, "log level")?;
        let level = self
            .control
            .set_level(name)
            .map_err(|err| CommandError::validation(format!("{err:#}")))?;
        info!("log level set to {level}");
        Ok(level.to_string())
    }

    fn get(&self, _remote: &Remote, _params: &[&str]) -> Result<String, CommandError> {
        Ok(self.control.current_level())
    }
}

struct SoundCommand;

impl CommandHandler for SoundCommand {
    fn set(&self, remote: &Remote, params: &[&str]) -> Result<String, CommandError> {
        let action = param(params, 0, "sound action")?;
        match action.to_ascii_lowercase().as_str() {
            "on" => remote.command(ControlCommand::SoundOn),
            "off" => remote.command(ControlCommand::SoundOff),
            "play" => {
                let id = number::<usize>(param(params, 1, "sound id")?, "sound id")?;
                if id >= remote.sounds().len() {
                    return Err(CommandError::validation(format!("unknown sound {id}")));
                }
                remote.command(ControlCommand::PlaySound(id));
            }
            "volume" => {
                let volume = percent(param(params, 1, "volume")?, "volume")?;
                remote.command(ControlCommand::SetVolume(volume));
            }
            "timer" => set_timer(remote, param(params, 1, "timer")?)?,
            other => {
                return Err(CommandError::protocol(format!(
                    "unknown sound action '{other}'"
                )));
            }
        }
        Ok(String::new())
    }

    fn get(&self, remote: &Remote, _params: &[&str]) -> Result<String, CommandError> {
        let status = remote.output_status();
        let mut lines = vec![format!(
            "{} {} {}",
            remote.get_sound_timer(),
            status.volume,
            remote.sound_timer_start()
        )];
        lines.extend(
            remote
                .sounds()
                .iter()
                .map(|sound| format!("{} {}", sound.name, sound.kind.as_str())),
        );
        Ok(lines.join("\n"))
    }
}

struct LightsCommand;

impl CommandHandler for LightsCommand {
    fn set(&self, remote: &Remote, params: &[&str]) -> Result<String, CommandError> {
        let id = number::<u32>(param(params, 0, "light id")?, "light id")?;
        if !remote
            .get_light_control_list()
            .iter()
            .any(|light| light.id == id)
        {
            return Err(CommandError::validation(format!("unknown light {id}")));
        }
        let value = param(params, 1, "brightness")?;
        let action = match value.to_ascii_lowercase().as_str() {
            "off" => LightAction::Off,
            "dim" => LightAction::DimUp {
                target: 100,
                seconds: MANUAL_DIM_SECONDS,
            },
            _ => LightAction::Brightness(percent(value, "brightness")?),
        };
        remote.command(ControlCommand::Light { id, action });
        Ok(String::new())
    }

    fn get(&self, remote: &Remote, _params: &[&str]) -> Result<String, CommandError> {
        let lights = remote.get_light_control_list();
        let mut fields = vec![lights.len().to_string()];
        fields.extend(
            lights
                .iter()
                .map(|light| format!("{:.0}", light.brightness)),
        );
        Ok(fields.join(" "))
    }
}

struct TimerCommand;

impl CommandHandler for TimerCommand {
    fn set(&self, remote: &Remote, params: &[&str]) -> Result<String, CommandError> {
        set_timer(remote, param(params, 0, "timer")?)?;
        Ok(String::new())
    }

    fn get(&self, remote: &Remote, _params: &[&str]) -> Result<String, CommandError> {
        Ok(remote.get_sound_timer().to_string())
    }
}

struct CalendarCommand;

impl CommandHandler for CalendarCommand {
    fn set(&self, _remote: &Remote, _params: &[&str]) -> Result<String, CommandError> {
        Err(CommandError::validation("no calendar attached"))
    }

    fn get(&self, _remote: &Remote, _params: &[&str]) -> Result<String, CommandError> {
        Err(CommandError::validation("no calendar attached"))
    }
}

/// TCP listener serving one thread per connected client.
pub struct LineServer {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    accept_join: Option<JoinHandle<()>>,
}

impl LineServer {
    pub fn start(
        bind: &str,
        port: u16,
        name: String,
        registry: Arc<CommandRegistry>,
        remote: Remote,
    ) -> Result<Self> {
        let address = format!("{bind}:{port}");
        let listener = TcpListener::bind(&address)
            .with_context(|| format!("failed to start command server on {address}"))?;
        listener
            .set_nonblocking(true)
            .context("unable to configure command listener")?;
        let local_addr = listener.local_addr()?;
        info!("command server listening on {local_addr}");

        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let session = Arc::new(Session {
            name,
            registry,
            remote,
        });
        let accept_join = thread::Builder::new()
            .name("command-accept".to_string())
            .spawn(move || accept_loop(listener, session, stop_for_thread))
            .context("unable to start command server thread")?;

        Ok(Self {
            local_addr,
            stop,
            accept_join: Some(accept_join),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for LineServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.accept_join.take() {
            let _ = join.join();
        }
    }
}

struct Session {
    name: String,
    registry: Arc<CommandRegistry>,
    remote: Remote,
}

fn accept_loop(listener: TcpListener, session: Arc<Session>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("command client {peer} connected");
                let session = Arc::clone(&session);
                let stop = Arc::clone(&stop);
                let spawned = thread::Builder::new()
                    .name(format!("command-{peer}"))
                    .spawn(move || {
                        if let Err(err) = serve_client(stream, &session, &stop) {
                            debug!("command client {peer} dropped: {err}");
                        }
                        debug!("command client {peer} disconnected");
                    });
                if let Err(err) = spawned {
                    warn!("unable to serve command client {peer}: {err}");
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(POLL),
            Err(err) => {
                warn!("command server accept failed: {err}");
                thread::sleep(POLL);
            }
        }
    }
}

fn serve_client(stream: TcpStream, session: &Session, stop: &AtomicBool) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    write!(writer, "connected to {}\n{PROMPT}", session.name)?;
    writer.flush()?;

    let mut buffer = Vec::new();
    let mut overflow = false;
    while !stop.load(Ordering::Relaxed) {
        let room = (MAX_LINE_BYTES + 1 - buffer.len()) as u64;
        match (&mut reader).take(room).read_until(b'\n', &mut buffer) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(err) => return Err(err),
        }
        if buffer.last() != Some(&b'\n') {
            if buffer.len() > MAX_LINE_BYTES {
                overflow = true;
                buffer.clear();
            }
            continue;
        }

        let line = std::mem::take(&mut buffer);
        let reply = if std::mem::take(&mut overflow) {
            Reply::Error(format!("request longer than {MAX_REQUEST_LEN} characters"))
        } else {
            match String::from_utf8(line) {
                Ok(line) => {
                    let request = line.trim_end_matches(['\r', '\n']);
                    if request.trim().is_empty() {
                        write!(writer, "{PROMPT}")?;
                        writer.flush()?;
                        continue;
                    }
                    session.registry.execute(&session.remote, request)
                }
                Err(_) => Reply::Error("request is not valid UTF-8".to_string()),
            }
        };
        if reply == Reply::Exit {
            return Ok(());
        }
        write!(writer, "{}{PROMPT}", reply.render())?;
        writer.flush()?;
    }
    Ok(())
}
