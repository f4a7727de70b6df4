use crate::engine::MidiSink;
use crate::engine::scheduler::{Scheduled, Scheduler, Signal};
use crate::model::config::SchedulerConfig;
use crate::model::song::Song;
use crate::util::ticks_to_duration;
use anyhow::{Result, bail};
use log::{debug, info, warn};
use spin_sleep::{SpinSleeper, SpinStrategy};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MAX_SLEEP_CHUNK: Duration = Duration::from_millis(50);

enum ControlMsg {
    Signal(Signal),
    Shutdown,
}

#[derive(Debug, Default)]
struct Playback {
    running: bool,
    starts_sent: u64,
    starts_handled: u64,
}

impl Playback {
    /// A start that hasn't reached the task yet already counts as playing.
    fn is_playing(&self) -> bool {
        self.running || self.starts_sent > self.starts_handled
    }
}

#[derive(Debug, Default)]
struct PlaybackStatus {
    current_tick: AtomicI64,
    playback: Mutex<Playback>,
    changed: Condvar,
    last_error: Mutex<Option<anyhow::Error>>,
}

/// A continuation waiting for its wall-clock deadline.
struct Timer {
    deadline: Instant,
    scheduled: Scheduled,
}

enum Wake {
    Message(ControlMsg),
    Elapsed,
    Disconnected,
}

/// Real-time playback of a shared song on its own thread.
///
/// All control requests are queued to the playback task, which owns the scheduler and is the
/// only thing that ever touches channel state. Edits go through `edit` so the task never reads
/// the song mid-change.
pub struct Player {
    song: Arc<RwLock<Song>>,
    status: Arc<PlaybackStatus>,
    cursor: AtomicI64,
    control_tx: Mutex<Option<Sender<ControlMsg>>>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Player {
    pub fn new<S: MidiSink + 'static>(sink: S, config: SchedulerConfig, song: Song) -> Result<Self> {
        info!(
            "Loaded song: '{}' with {} events on {} tracks..!",
            song.title,
            song.event_count(),
            song.tracks.len()
        );

        let song = Arc::new(RwLock::new(song));
        let status = Arc::new(PlaybackStatus::default());
        let (tx, rx) = mpsc::channel::<ControlMsg>();

        let scheduler = Scheduler::new(sink, config);
        let task_song = Arc::clone(&song);
        let task_status = Arc::clone(&status);
        let handle = thread::Builder::new()
            .name(String::from("playback"))
            .spawn(move || run(scheduler, config, task_song, task_status, rx))?;

        Ok(Self {
            song,
            status,
            cursor: AtomicI64::new(0),
            control_tx: Mutex::new(Some(tx)),
            worker_handle: Mutex::new(Some(handle)),
        })
    }

    /// Starts playing at `tick`, restarting if already playing.
    pub fn start(&self, tick: i64) -> Result<()> {
        let Ok(mut playback) = self.status.playback.lock() else {
            bail!("Failed to lock playback status..!");
        };

        self.send(ControlMsg::Signal(Signal::Start(tick)))?;
        playback.starts_sent += 1;
        Ok(())
    }

    pub fn start_from_cursor(&self) -> Result<()> {
        self.start(self.cursor())
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn set_cursor(&self, tick: i64) {
        self.cursor.store(tick.max(0), Ordering::Release);
    }

    /// Moves the cursor and, when playing, restarts playback there.
    pub fn seek(&self, tick: i64) -> Result<()> {
        self.set_cursor(tick);
        if !self.is_playing() {
            return Ok(());
        }

        self.stop()?;
        self.start_from_cursor()
    }

    pub fn stop(&self) -> Result<()> {
        self.send(ControlMsg::Signal(Signal::Stop))
    }

    /// Last tick the playback task has processed.
    pub fn current_tick(&self) -> i64 {
        self.status.current_tick.load(Ordering::Acquire)
    }

    pub fn is_playing(&self) -> bool {
        self.status
            .playback
            .lock()
            .map(|playback| playback.is_playing())
            .unwrap_or(false)
    }

    pub fn wait_for_stop(&self) -> Result<()> {
        let Ok(playback) = self.status.playback.lock() else {
            bail!("Failed to lock playback status..!");
        };

        let Ok(_playback) = self.status.changed.wait_while(playback, |p| p.is_playing()) else {
            bail!("Playback status poisoned while waiting..!");
        };

        Ok(())
    }

    /// Returns `false` if playback was still going when `timeout` ran out.
    pub fn wait_for_stop_timeout(&self, timeout: Duration) -> Result<bool> {
        let Ok(playback) = self.status.playback.lock() else {
            bail!("Failed to lock playback status..!");
        };

        let Ok((_playback, result)) = self
            .status
            .changed
            .wait_timeout_while(playback, timeout, |p| p.is_playing())
        else {
            bail!("Playback status poisoned while waiting..!");
        };

        Ok(!result.timed_out())
    }

    /// First output failure since the last call. Playback carries on past failures.
    pub fn take_error(&self) -> Option<anyhow::Error> {
        self.status.last_error.lock().ok()?.take()
    }

    /// Mutates the song, then lets the playback task pick up the change.
    pub fn edit<R>(&self, edit: impl FnOnce(&mut Song) -> R) -> Result<R> {
        let result = {
            let Ok(mut song) = self.song.write() else {
                bail!("Failed to lock song for editing..!");
            };
            edit(&mut song)
        };

        self.send(ControlMsg::Signal(Signal::SongChanged))?;
        Ok(result)
    }

    pub fn with_song<R>(&self, read: impl FnOnce(&Song) -> R) -> Result<R> {
        let Ok(song) = self.song.read() else {
            bail!("Failed to lock song..!");
        };

        Ok(read(&song))
    }

    fn send(&self, msg: ControlMsg) -> Result<()> {
        let Ok(lock) = self.control_tx.lock() else {
            bail!("Failed to lock control_tx..!");
        };

        let Some(tx) = lock.as_ref() else {
            bail!("Playback task has shut down..!");
        };

        if tx.send(msg).is_err() {
            bail!("Playback task is gone..!");
        }

        Ok(())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if let Ok(mut lock) = self.control_tx.lock()
            && let Some(tx) = lock.take()
        {
            let _ = tx.send(ControlMsg::Shutdown);
        }

        if let Ok(mut lock) = self.worker_handle.lock()
            && let Some(handle) = lock.take()
        {
            let _ = handle.join();
            debug!("Playback thread joined..!");
        }
    }
}

fn run<S: MidiSink>(
    mut scheduler: Scheduler<S>,
    config: SchedulerConfig,
    song: Arc<RwLock<Song>>,
    status: Arc<PlaybackStatus>,
    rx: Receiver<ControlMsg>,
) {
    let sleeper = SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);
    let mut timer: Option<Timer> = None;
    let mut anchor = Instant::now();

    loop {
        let (signal, elapsed) = match &timer {
            None => match rx.recv() {
                Ok(ControlMsg::Signal(signal)) => (signal, None),
                Ok(ControlMsg::Shutdown) | Err(_) => break,
            },
            Some(pending) => match wait_until(&rx, &sleeper, pending.deadline) {
                Wake::Message(ControlMsg::Signal(signal)) => (signal, None),
                Wake::Elapsed => (pending.scheduled.signal, Some(pending.deadline)),
                Wake::Message(ControlMsg::Shutdown) | Wake::Disconnected => break,
            },
        };

        // Continuations are paced from the previous deadline, not from whenever we woke up.
        match (signal, elapsed) {
            (_, Some(deadline)) => anchor = deadline,
            (Signal::Start(_), None) => anchor = Instant::now(),
            _ => {}
        }

        let Ok(current) = song.read() else {
            warn!("Song lock poisoned, stopping playback task..!");
            break;
        };
        let next = scheduler.handle(&current, signal);
        drop(current);

        timer = match signal {
            Signal::SongChanged => timer.take().map(|pending| reschedule(&scheduler, config, anchor, pending)),
            _ => next.map(|scheduled| Timer {
                deadline: anchor + scheduled.delay,
                scheduled,
            }),
        };

        publish(&mut scheduler, &status, matches!(signal, Signal::Start(_)));
    }

    if let Ok(current) = song.read() {
        scheduler.handle(&current, Signal::Stop);
    }
    publish(&mut scheduler, &status, false);
    info!("Playback task finished..!");
}

/// Pulls a pending continuation forward when an edit put an event before it.
fn reschedule<S: MidiSink>(
    scheduler: &Scheduler<S>,
    config: SchedulerConfig,
    anchor: Instant,
    pending: Timer,
) -> Timer {
    let Signal::Continue { tick, world } = pending.scheduled.signal else {
        return pending;
    };

    match scheduler.horizon() {
        Some(horizon) if horizon < tick && horizon > scheduler.last_tick() => {
            debug!("Edit moved the next event from tick {} to {}..!", tick, horizon);
            let delay = ticks_to_duration(
                horizon - scheduler.last_tick(),
                config.ticks_per_beat,
                scheduler.bpm(),
            );

            Timer {
                deadline: anchor + delay,
                scheduled: Scheduled {
                    signal: Signal::Continue {
                        tick: horizon,
                        world,
                    },
                    delay,
                },
            }
        }
        _ => pending,
    }
}

fn publish<S: MidiSink>(scheduler: &mut Scheduler<S>, status: &PlaybackStatus, handled_start: bool) {
    status
        .current_tick
        .store(scheduler.last_tick(), Ordering::Release);

    if let Some(why) = scheduler.take_failure()
        && let Ok(mut slot) = status.last_error.lock()
        && slot.is_none()
    {
        *slot = Some(why);
    }

    if let Ok(mut playback) = status.playback.lock() {
        playback.running = scheduler.is_running();
        if handled_start {
            playback.starts_handled += 1;
        }
        status.changed.notify_all();
    }
}

fn wait_until(rx: &Receiver<ControlMsg>, sleeper: &SpinSleeper, deadline: Instant) -> Wake {
    loop {
        match rx.try_recv() {
            Ok(msg) => return Wake::Message(msg),
            Err(TryRecvError::Disconnected) => return Wake::Disconnected,
            Err(TryRecvError::Empty) => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Wake::Elapsed;
        }

        sleeper.sleep((deadline - now).min(MAX_SLEEP_CHUNK));
    }
}
