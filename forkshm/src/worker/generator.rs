use std::convert::Infallible;
use std::fmt;

use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};

use super::outcome::{catch, install_panic_hook, RemoteError};
use super::process::{decode_status, wait_child, AliveFlag};
use super::{Globals, Phase};
use crate::channel::Channel;
use crate::config::WorkerConfig;
use crate::errors::{Result, ShmemError};
use crate::registry::{Fork, Pid, Registry};

type Step<T, S> = Box<dyn FnMut(&mut S) -> Option<std::result::Result<T, RemoteError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Command {
    Next = 1,
    Stop = 2,
}

impl Command {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Command::Next),
            2 => Some(Command::Stop),
            _ => None,
        }
    }
}

/// What the child answers on the result channel.
#[derive(Debug, Serialize, Deserialize)]
enum Frame<T> {
    Yielded(T),
    Exhausted,
    Failed(RemoteError),
    Finished { globals: Option<Vec<u8>> },
}

/// Produces values one at a time in a forked child, on demand.
///
/// The parent asks for each value with [`Generator::next`]; the child only
/// computes a step when asked. A failing step ends the generator.
pub struct Generator<T, S = ()> {
    registry: Registry,
    results: Channel,
    commands: Channel,
    step: Option<Step<T, S>>,
    state: S,
    globals: Option<Globals<S>>,
    alive: AliveFlag,
    phase: Phase,
    next_sent: bool,
    stop_sent: bool,
}

impl<T> Generator<T, ()>
where
    T: serde::Serialize + DeserializeOwned + 'static,
{
    pub fn new<F>(registry: &Registry, mut f: F) -> Result<Self>
    where
        F: FnMut() -> Option<T> + 'static,
    {
        Self::with_state(registry, &WorkerConfig::default(), (), move |_| {
            f().map(Ok::<T, Infallible>)
        })
    }

    pub fn fallible<F, E>(registry: &Registry, mut f: F) -> Result<Self>
    where
        F: FnMut() -> Option<std::result::Result<T, E>> + 'static,
        E: std::error::Error + 'static,
    {
        Self::with_state(registry, &WorkerConfig::default(), (), move |_| f())
    }

    pub fn from_iter<I>(registry: &Registry, iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
    {
        let mut iter = iter.into_iter();
        Self::new(registry, move || iter.next())
    }
}

impl<T, S> Generator<T, S>
where
    T: serde::Serialize + DeserializeOwned + 'static,
    S: 'static,
{
    pub fn with_state<F, E>(registry: &Registry, config: &WorkerConfig, state: S, mut f: F) -> Result<Self>
    where
        F: FnMut(&mut S) -> Option<std::result::Result<T, E>> + 'static,
        E: std::error::Error + 'static,
    {
        let results = Channel::new(registry, &config.results)?;
        let commands = Channel::new(registry, &config.commands)?;
        Ok(Generator {
            registry: registry.clone(),
            results,
            commands,
            step: Some(Box::new(move |state: &mut S| {
                f(state).map(|step| step.map_err(|e| RemoteError::from_error(&e)))
            })),
            state,
            globals: None,
            alive: AliveFlag::new()?,
            phase: Phase::Created,
            next_sent: false,
            stop_sent: false,
        })
    }

    pub fn with_globals(mut self, globals: Globals<S>) -> Self {
        self.globals = Some(globals);
        self
    }

    pub fn start(&mut self) -> Result<()> {
        self.phase.ensure_created()?;
        self.alive.set(true);
        match self.registry.fork() {
            Ok(Fork::Parent(pid)) => {
                tracing::debug!(%pid, "started generator");
                self.phase = Phase::Running(pid);
                Ok(())
            }
            Ok(Fork::Child) => self.run_child(),
            Err(e) => {
                self.alive.set(false);
                Err(e)
            }
        }
    }

    fn run_child(&mut self) -> ! {
        self.phase = Phase::Child;
        install_panic_hook();
        let mut done = false;
        let status = loop {
            match self.receive_command() {
                Ok(Command::Next) => {
                    let frame = if done { Frame::Exhausted } else { self.step_once(&mut done) };
                    if let Err(e) = self.results.send_value(&frame) {
                        tracing::warn!(error = %e, "generator could not send a step");
                        done = true;
                        let failed = Frame::<T>::Failed(RemoteError::from_error(&e));
                        if let Err(e) = self.results.send_value(&failed) {
                            tracing::warn!(error = %e, "generator could not report a failed step");
                            break 1;
                        }
                    }
                }
                Ok(Command::Stop) => match self.send_finished() {
                    Ok(()) => break 0,
                    Err(e) => {
                        tracing::warn!(error = %e, "generator could not report its globals");
                        break 1;
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "generator lost its command channel");
                    break 1;
                }
            }
        };
        self.alive.set(false);
        self.registry.exit(status)
    }

    fn step_once(&mut self, done: &mut bool) -> Frame<T> {
        let state = &mut self.state;
        let step = match self.step.as_mut() {
            Some(step) => step,
            None => {
                *done = true;
                return Frame::Exhausted;
            }
        };
        match catch(|| step(state)) {
            Ok(Some(Ok(value))) => Frame::Yielded(value),
            Ok(None) => {
                *done = true;
                Frame::Exhausted
            }
            Ok(Some(Err(remote))) | Err(remote) => {
                *done = true;
                Frame::Failed(remote)
            }
        }
    }

    fn send_finished(&self) -> Result<()> {
        let globals = match &self.globals {
            Some(globals) => Some(globals.extract(&self.state)?),
            None => None,
        };
        self.results.send_value(&Frame::<T>::Finished { globals })
    }

    fn receive_command(&self) -> Result<Command> {
        let bytes = self.commands.receive_bytes(true)?;
        match bytes.as_slice() {
            [byte] => Command::from_byte(*byte)
                .ok_or_else(|| ShmemError::Logic(format!("unknown generator command {}", byte))),
            other => Err(ShmemError::Logic(format!("malformed generator command of {} bytes", other.len()))),
        }
    }

    fn send_command(&self, command: Command) -> Result<()> {
        self.commands.send_bytes(&[command as u8])
    }

    /// Asks the child for the next value. `Ok(None)` once it is exhausted.
    ///
    /// Without `block`, a value not computed yet gives
    /// [`ShmemError::WouldBlock`]; the request stays outstanding and the next
    /// call picks up its answer.
    pub fn next(&mut self, block: bool) -> Result<Option<T>> {
        self.phase.running()?;
        if self.stop_sent {
            return Err(ShmemError::Lifecycle("generator already stopped"));
        }
        if !self.next_sent {
            self.send_command(Command::Next)?;
            self.next_sent = true;
        }
        let frame = match self.results.receive_value::<Frame<T>>(block) {
            Err(ShmemError::WouldBlock) => return Err(ShmemError::WouldBlock),
            received => {
                self.next_sent = false;
                received?
            }
        };
        match frame {
            Frame::Yielded(value) => Ok(Some(value)),
            Frame::Exhausted => Ok(None),
            Frame::Failed(remote) => Err(ShmemError::Remote(remote)),
            Frame::Finished { .. } => Err(ShmemError::Logic("generator finished without being stopped".to_string())),
        }
    }

    /// Blocking iteration until the generator is exhausted or fails.
    pub fn iter(&mut self) -> impl Iterator<Item = Result<T>> + '_ {
        std::iter::from_fn(move || self.next(true).transpose())
    }

    fn request_stop(&mut self) -> Result<()> {
        if !self.stop_sent {
            self.send_command(Command::Stop)?;
            self.stop_sent = true;
        }
        Ok(())
    }

    /// Stops the child, waits for it and merges its globals.
    pub fn join(&mut self) -> Result<()> {
        let pid = self.phase.running()?;
        self.request_stop()?;
        match wait_child(pid, true)? {
            Some(raw) => self.finish(pid, raw),
            None => Err(ShmemError::Logic(format!("blocking wait for {} returned early", pid))),
        }
    }

    /// Like [`Generator::join`], but `Ok(false)` if the child has not exited
    /// yet. The stop request is sent either way.
    pub fn try_join(&mut self) -> Result<bool> {
        let pid = self.phase.running()?;
        self.request_stop()?;
        match wait_child(pid, false)? {
            Some(raw) => self.finish(pid, raw).map(|()| true),
            None => Ok(false),
        }
    }

    fn finish(&mut self, pid: Pid, raw: libc::c_int) -> Result<()> {
        let status = decode_status(raw);
        self.phase = Phase::Joined { pid, status };
        self.alive.set(false);
        tracing::debug!(%pid, status, "joined generator");
        loop {
            match self.results.receive_value::<Frame<T>>(false) {
                Ok(Frame::Finished { globals }) => {
                    if let (Some(bytes), Some(hooks)) = (globals, self.globals.as_mut()) {
                        hooks.merge(&mut self.state, &bytes)?;
                    }
                    return Ok(());
                }
                // The answer to a request nobody collected.
                Ok(_) => self.next_sent = false,
                Err(ShmemError::WouldBlock) => return Err(ShmemError::MissingResult { status }),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn exit_status(&self) -> Result<i32> {
        self.phase.joined().map(|(_, status)| status)
    }

    /// Whether the child is still serving requests.
    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    pub fn pid(&self) -> Option<Pid> {
        self.phase.pid()
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn into_state(self) -> S {
        self.state
    }
}

impl<T, S> fmt::Debug for Generator<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator")
            .field("phase", &self.phase)
            .field("alive", &self.alive.get())
            .field("next_sent", &self.next_sent)
            .field("stop_sent", &self.stop_sent)
            .finish()
    }
}
