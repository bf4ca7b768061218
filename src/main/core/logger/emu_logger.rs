use std::cell::RefCell;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use once_cell::sync::{Lazy, OnceCell};

use crate::core::worker::Worker;
use crate::host::node::NodeInfo;

/// Trigger an asynchronous flush when this many lines are queued.
const ASYNC_FLUSH_QD_LINES_THRESHOLD: usize = 100_000;

/// Performs a *synchronous* flush when this many lines are queued, so that the queue stops
/// growing when lines arrive faster than they can be written.
const SYNC_FLUSH_QD_LINES_THRESHOLD: usize = 10 * ASYNC_FLUSH_QD_LINES_THRESHOLD;

/// Logging thread flushes at least this often.
const MIN_FLUSH_FREQUENCY: Duration = Duration::from_secs(10);

static EMU_LOGGER: Lazy<EmuLogger> = Lazy::new(EmuLogger::new);

/// Install the logger. Fails if a logger was already installed.
pub fn init(max_log_level: LevelFilter, log_errors_to_stderr: bool) -> Result<(), SetLoggerError> {
    // ignore repeated configuration; only the first call can install the logger anyway
    let _ = EMU_LOGGER.max_log_level.set(max_log_level);
    let _ = EMU_LOGGER.log_errors_to_stderr.set(log_errors_to_stderr);

    log::set_logger(&*EMU_LOGGER)?;
    log::set_max_level(max_log_level);

    // Start the thread that will receive log records and flush them to output.
    if let Err(e) = std::thread::Builder::new()
        .name("emu-logger".to_string())
        .spawn(move || EMU_LOGGER.logger_thread_fn())
    {
        eprintln!("WARNING: Unable to start the logger thread: {e}");
    }

    // Arrange to flush the logger on panic.
    let default_panic_handler = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        // Flush on the current thread: the logger thread may be the one panicking, and our
        // thread-local sender may already be gone.
        EMU_LOGGER.flush_records(None).ok();
        default_panic_handler(panic_info);
    }));

    Ok(())
}

/// A logger that tags every line with the emulation context of the thread that logged it (the
/// emulation time and the node being handled), and writes lines from a dedicated thread.
pub struct EmuLogger {
    // The Sender half of a channel isn't Sync, so it's kept behind a Mutex and cloned once per
    // thread into the thread-local SENDER.
    command_sender: Mutex<Sender<LoggerCommand>>,

    // Locked by the logger thread for as long as it runs.
    command_receiver: Mutex<Receiver<LoggerCommand>>,

    // Records are kept apart from the commands because `Sender` can't report its queue length.
    records: ArrayQueue<EmuLogRecord>,

    // When false, a flush command is sent to the logger thread for every record.
    buffering_enabled: RwLock<bool>,

    max_log_level: OnceCell<LevelFilter>,

    // Whether to log errors to stderr in addition to stdout.
    log_errors_to_stderr: OnceCell<bool>,
}

thread_local!(static SENDER: RefCell<Option<Sender<LoggerCommand>>> = const { RefCell::new(None) });
thread_local!(static THREAD_NAME: String = thread_name());
thread_local!(static THREAD_ID: nix::unistd::Pid = nix::unistd::gettid());

fn thread_name() -> String {
    std::thread::current().name().unwrap_or_default().to_string()
}

impl EmuLogger {
    fn new() -> EmuLogger {
        let (sender, receiver) = std::sync::mpsc::channel();

        EmuLogger {
            records: ArrayQueue::new(SYNC_FLUSH_QD_LINES_THRESHOLD),
            command_sender: Mutex::new(sender),
            command_receiver: Mutex::new(receiver),
            buffering_enabled: RwLock::new(false),
            max_log_level: OnceCell::new(),
            log_errors_to_stderr: OnceCell::new(),
        }
    }

    fn logger_thread_fn(&self) {
        let Ok(command_receiver) = self.command_receiver.lock() else {
            return;
        };

        loop {
            use std::sync::mpsc::RecvTimeoutError;
            let (done_sender, stop) = match command_receiver.recv_timeout(MIN_FLUSH_FREQUENCY) {
                Ok(LoggerCommand::Flush(done_sender)) => (done_sender, false),
                Err(RecvTimeoutError::Timeout) => (None, false),
                // every sender is gone; write what's left and stop
                Err(RecvTimeoutError::Disconnected) => (None, true),
            };
            if let Err(e) = self.flush_records(done_sender) {
                eprintln!("WARNING: Unable to write log records: {e}");
            }
            if stop {
                return;
            }
        }
    }

    // Write the records queued so far. If `done_sender` is provided, it's notified after the
    // flush has completed.
    fn flush_records(&self, done_sender: Option<Sender<()>>) -> std::io::Result<()> {
        use std::io::Write;

        // Records arriving while we flush wait for the next flush, so that synchronous flushes
        // aren't held up.
        let mut toflush = self.records.len();

        let stdout_unlocked = std::io::stdout();
        let stdout_locked = stdout_unlocked.lock();
        let mut stdout = std::io::BufWriter::new(stdout_locked);
        let errors_to_stderr = self.log_errors_to_stderr.get().copied().unwrap_or(false);

        while toflush > 0 {
            // another thread may be flushing too if one panicked
            let Some(record) = self.records.pop() else {
                break;
            };
            toflush -= 1;

            if record.level <= Level::Error && errors_to_stderr {
                let line = format!("{record}");
                write!(stdout, "{line}")?;
                write!(std::io::stderr().lock(), "{line}")?;
            } else {
                write!(stdout, "{record}")?;
            }
        }
        stdout.flush()?;

        if let Some(done_sender) = done_sender {
            // Logging from this thread could deadlock, so print directly.
            done_sender.send(()).unwrap_or_else(|e| {
                println!("WARNING: Logger couldn't notify calling thread: {e:?}")
            });
        }
        Ok(())
    }

    /// When disabled, the logger thread is notified to write each record as soon as it's
    /// created. The calling thread still isn't blocked on the record actually being written.
    pub fn set_buffering_enabled(&self, buffering_enabled: bool) {
        if let Ok(mut writer) = self.buffering_enabled.write() {
            *writer = buffering_enabled;
        }
    }

    /// If the maximum log level has not yet been set, returns `LevelFilter::Trace`.
    pub fn max_level(&self) -> LevelFilter {
        self.max_log_level
            .get()
            .copied()
            .unwrap_or(LevelFilter::Trace)
    }

    // Send a flush command to the logger thread and block until it's completed.
    fn flush_sync(&self) {
        let (done_sender, done_receiver) = std::sync::mpsc::channel();
        if self.send_command(LoggerCommand::Flush(Some(done_sender))) {
            done_receiver.recv().ok();
        }
    }

    fn flush_async(&self) {
        self.send_command(LoggerCommand::Flush(None));
    }

    // Send a command to the logger thread. Returns false if it couldn't be sent.
    fn send_command(&self, cmd: LoggerCommand) -> bool {
        SENDER
            .try_with(|thread_sender| {
                let mut thread_sender = thread_sender.borrow_mut();
                if thread_sender.is_none() {
                    *thread_sender = self.command_sender.lock().ok().map(|s| s.clone());
                }
                match thread_sender.as_ref().map(|s| s.send(cmd)) {
                    Some(Ok(())) => true,
                    Some(Err(e)) => {
                        println!("WARNING: Couldn't send command to logger thread: {e:?}");
                        false
                    }
                    None => false,
                }
            })
            .unwrap_or_else(|e| {
                println!("WARNING: Couldn't get sender channel to logger thread: {e:?}");
                false
            })
    }
}

impl Log for EmuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut emu_record = EmuLogRecord {
            level: record.level(),
            file: record.file_static(),
            module_path: record.module_path_static(),
            line: record.line(),
            message: std::fmt::format(*record.args()),
            wall_time: Worker::elapsed(),
            emu_time: Worker::current_time(),
            thread_name: THREAD_NAME
                .try_with(|name| name.clone())
                .unwrap_or_else(|_| thread_name()),
            thread_id: THREAD_ID
                .try_with(|id| *id)
                .unwrap_or_else(|_| nix::unistd::gettid()),
            node_info: Worker::active_node(),
        };

        loop {
            match self.records.push(emu_record) {
                Ok(()) => break,
                Err(r) => {
                    // Queue is full. Flush it and try again.
                    emu_record = r;
                    self.flush_sync();
                }
            }
        }

        let buffering = self.buffering_enabled.read().map(|b| *b).unwrap_or(false);
        if record.level() == Level::Error {
            // likely about to stop; don't leave the line in the queue
            self.flush_sync();
        } else if self.records.len() > ASYNC_FLUSH_QD_LINES_THRESHOLD || !buffering {
            self.flush_async();
        }
    }

    fn flush(&self) {
        self.flush_sync();
    }
}

struct EmuLogRecord {
    level: Level,
    file: Option<&'static str>,
    module_path: Option<&'static str>,
    line: Option<u32>,
    message: String,
    wall_time: Duration,

    emu_time: Option<Duration>,
    thread_name: String,
    thread_id: nix::unistd::Pid,
    node_info: Option<Arc<NodeInfo>>,
}

/// Writes `d` as `hh:mm:ss.<fraction>` with `digits` fractional digits (6 or 9).
fn write_time(f: &mut std::fmt::Formatter<'_>, d: Duration, digits: u32) -> std::fmt::Result {
    let secs = d.as_secs();
    let fraction = d.subsec_nanos() / 10u32.pow(9 - digits);
    write!(
        f,
        "{:02}:{:02}:{:02}.{:0width$}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        fraction,
        width = digits as usize
    )
}

impl std::fmt::Display for EmuLogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_time(f, self.wall_time, 6)?;
        write!(f, " [{}:{}]", self.thread_id, self.thread_name)?;
        if let Some(emu_time) = self.emu_time {
            write!(f, " ")?;
            write_time(f, emu_time, 9)?;
        } else {
            write!(f, " n/a")?;
        }
        write!(f, " [{level}]", level = self.level)?;
        if let Some(node) = &self.node_info {
            write!(f, " [{}:{}]", node.hostname, node.id)?;
        } else {
            write!(f, " [n/a]")?;
        }
        write!(
            f,
            " [{file}:",
            file = self
                .file
                .map(|f| match f.rfind('/') {
                    Some(sep_pos) => &f[(sep_pos + 1)..],
                    None => f,
                })
                .unwrap_or("n/a"),
        )?;
        if let Some(line) = self.line {
            write!(f, "{line}")?;
        } else {
            write!(f, "n/a")?;
        }
        writeln!(
            f,
            "] [{module}] {msg}",
            module = self.module_path.unwrap_or("n/a"),
            msg = self.message
        )
    }
}

enum LoggerCommand {
    // Flush; takes an optional one-shot channel to notify that the flush has completed.
    Flush(Option<Sender<()>>),
}

pub fn set_buffering_enabled(buffering_enabled: bool) {
    EMU_LOGGER.set_buffering_enabled(buffering_enabled);
}
