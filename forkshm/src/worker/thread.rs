use std::convert::Infallible;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::outcome::{catch, install_panic_hook, Outcome, RemoteError};
use super::process::{decode_status, wait_child, AliveFlag};
use super::{Globals, Phase};
use crate::channel::Channel;
use crate::config::WorkerConfig;
use crate::errors::{Result, ShmemError};
use crate::registry::{Fork, Pid, Registry};

type Body<T, S> = Box<dyn FnOnce(&mut S) -> std::result::Result<T, RemoteError>>;

enum Report<T> {
    Returned(T),
    /// The flag records whether the trace frame was already fetched.
    Failed(RemoteError, bool),
    Missing,
}

/// Runs one callable in a forked child and brings back what it returned.
///
/// ```no_run
/// # fn main() -> forkshm::Result<()> {
/// let registry = forkshm::Registry::new();
/// let mut thread = forkshm::Thread::new(&registry, || 6 * 7)?;
/// thread.start()?;
/// thread.join()?;
/// assert_eq!(*thread.result()?, 42);
/// # Ok(())
/// # }
/// ```
pub struct Thread<T, S = ()> {
    registry: Registry,
    channel: Channel,
    body: Option<Body<T, S>>,
    state: S,
    globals: Option<Globals<S>>,
    alive: AliveFlag,
    phase: Phase,
    report: Option<Report<T>>,
}

impl<T> Thread<T, ()>
where
    T: Serialize + DeserializeOwned + 'static,
{
    pub fn new<F>(registry: &Registry, f: F) -> Result<Self>
    where
        F: FnOnce() -> T + 'static,
    {
        Self::with_state(registry, &WorkerConfig::default(), (), move |_| Ok::<T, Infallible>(f()))
    }

    /// Like [`Thread::new`] for callables that can fail. An `Err` comes back
    /// as [`ShmemError::Remote`] from [`Thread::result`].
    pub fn fallible<F, E>(registry: &Registry, f: F) -> Result<Self>
    where
        F: FnOnce() -> std::result::Result<T, E> + 'static,
        E: std::error::Error + 'static,
    {
        Self::with_state(registry, &WorkerConfig::default(), (), move |_| f())
    }
}

impl<T, S> Thread<T, S>
where
    T: Serialize + DeserializeOwned + 'static,
    S: 'static,
{
    /// A thread whose callable works on `state`. The child runs on its own
    /// copy; the parent's copy only changes through [`Thread::with_globals`].
    pub fn with_state<F, E>(registry: &Registry, config: &WorkerConfig, state: S, f: F) -> Result<Self>
    where
        F: FnOnce(&mut S) -> std::result::Result<T, E> + 'static,
        E: std::error::Error + 'static,
    {
        let channel = Channel::new(registry, &config.results)?;
        Ok(Thread {
            registry: registry.clone(),
            channel,
            body: Some(Box::new(move |state: &mut S| {
                f(state).map_err(|e| RemoteError::from_error(&e))
            })),
            state,
            globals: None,
            alive: AliveFlag::new()?,
            phase: Phase::Created,
            report: None,
        })
    }

    pub fn with_globals(mut self, globals: Globals<S>) -> Self {
        self.globals = Some(globals);
        self
    }

    /// Forks. In the parent this returns at once; the child runs the callable
    /// and exits without returning.
    pub fn start(&mut self) -> Result<()> {
        self.phase.ensure_created()?;
        self.alive.set(true);
        match self.registry.fork() {
            Ok(Fork::Parent(pid)) => {
                tracing::debug!(%pid, "started thread");
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
        let outcome = match self.body.take() {
            Some(body) => {
                let state = &mut self.state;
                catch(move || body(state)).and_then(|returned| returned)
            }
            None => Err(RemoteError::new("lifecycle", "thread body already consumed")),
        };
        let status = match self.send_report(outcome) {
            Ok(()) => 0,
            Err(e) => {
                tracing::warn!(error = %e, "thread could not report its outcome");
                1
            }
        };
        self.alive.set(false);
        self.registry.exit(status)
    }

    fn send_report(&self, outcome: std::result::Result<T, RemoteError>) -> Result<()> {
        let globals = match &self.globals {
            Some(globals) => Some(globals.extract(&self.state)?),
            None => None,
        };
        self.channel.send_value(&globals)?;
        match outcome {
            Ok(value) => self.channel.send_value(&Outcome::Returned(value)),
            Err(remote) => {
                self.channel.send_value(&Outcome::<T>::Failed {
                    category: remote.category,
                    message: remote.message,
                })?;
                self.channel.send_value(&remote.trace)
            }
        }
    }

    /// Waits for the child, then collects its outcome and merges its globals.
    pub fn join(&mut self) -> Result<()> {
        let pid = self.phase.running()?;
        match wait_child(pid, true)? {
            Some(raw) => self.finish(pid, raw),
            None => Err(ShmemError::Logic(format!("blocking wait for {} returned early", pid))),
        }
    }

    /// [`Thread::join`] if the child has exited; `Ok(false)` otherwise.
    pub fn try_join(&mut self) -> Result<bool> {
        let pid = self.phase.running()?;
        match wait_child(pid, false)? {
            Some(raw) => self.finish(pid, raw).map(|()| true),
            None => Ok(false),
        }
    }

    fn finish(&mut self, pid: Pid, raw: libc::c_int) -> Result<()> {
        let status = decode_status(raw);
        self.phase = Phase::Joined { pid, status };
        self.alive.set(false);
        tracing::debug!(%pid, status, "joined thread");

        // The child is gone, so whatever it sent is already in the channel.
        let globals: Option<Vec<u8>> = match self.channel.receive_value(false) {
            Ok(globals) => globals,
            Err(ShmemError::WouldBlock) => {
                self.report = Some(Report::Missing);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if let (Some(bytes), Some(hooks)) = (globals, self.globals.as_mut()) {
            hooks.merge(&mut self.state, &bytes)?;
        }
        self.report = Some(match self.channel.receive_value::<Outcome<T>>(false) {
            Ok(Outcome::Returned(value)) => Report::Returned(value),
            Ok(Outcome::Failed { category, message }) => Report::Failed(RemoteError::new(category, message), false),
            Err(ShmemError::WouldBlock) => Report::Missing,
            Err(e) => return Err(e),
        });
        Ok(())
    }

    /// The value the callable returned. A failure in the child comes back as
    /// [`ShmemError::Remote`], with its trace.
    pub fn result(&mut self) -> Result<&T> {
        let (_, status) = self.phase.joined()?;
        if let Some(Report::Failed(remote, fetched)) = &mut self.report {
            if !*fetched {
                *fetched = true;
                match self.channel.receive_value::<Vec<String>>(false) {
                    Ok(trace) => remote.trace = trace,
                    Err(ShmemError::WouldBlock) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        match &self.report {
            Some(Report::Returned(value)) => Ok(value),
            Some(Report::Failed(remote, _)) => Err(ShmemError::Remote(remote.clone())),
            Some(Report::Missing) | None => Err(ShmemError::MissingResult { status }),
        }
    }

    pub fn into_result(mut self) -> Result<T> {
        self.result().map(|_| ())?;
        match self.report.take() {
            Some(Report::Returned(value)) => Ok(value),
            _ => Err(ShmemError::Logic("thread result already taken".to_string())),
        }
    }

    /// Exit code of the child, or minus the signal that killed it.
    pub fn exit_status(&self) -> Result<i32> {
        self.phase.joined().map(|(_, status)| status)
    }

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

impl<T, S> fmt::Debug for Thread<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("phase", &self.phase)
            .field("alive", &self.alive.get())
            .finish()
    }
}
