//! Async, rotating log pipeline behind the `info!`/`warn!`/`errors!`/`debug!`/
//! `trace!` macro front-end. Call sites never see the pipeline directly: they
//! format a line through one of the level macros, which push it onto a
//! bounded queue drained by a single background writer thread.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Calendar math shared by the log-line timestamp and the rotation
/// filename. Deliberately approximate (365.25-day years, 30.44-day
/// months): good enough to roll logs over roughly daily, not a real
/// Gregorian calendar.
fn date_parts(secs: u64) -> (u64, u8, u8) {
    let year = 1970 + (secs / 31_557_600);
    let month = ((secs % 31_557_600) / 2_628_000) as u8 + 1;
    let day = ((secs % 2_628_000) / 86_400) as u8 + 1;
    (year, month, day)
}

pub fn format_time(now: SystemTime) -> String {
    let duration = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = duration.as_secs();
    let micros = duration.subsec_micros();

    let (year, month, day) = date_parts(secs);
    let hour = ((secs % 86_400) / 3600) as u8;
    let minute = ((secs % 3600) / 60) as u8;
    let second = (secs % 60) as u8;

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
        year, month, day, hour, minute, second, micros
    )
}

/// A single formatted log line, already colorized, waiting to be written.
struct Record {
    line: String,
}

/// Bounded MPSC-ish queue: any number of producer threads push, one drain
/// thread pops. `push` blocks while full; `pop` blocks while empty. A
/// `max_size` of 0 disables the queue (every write happens inline, holding
/// `file` under its own mutex instead).
struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    max_size: usize,
}

impl<T> BlockingQueue<T> {
    fn new(max_size: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            max_size,
        }
    }

    fn push(&self, item: T) {
        let mut items = self.items.lock().unwrap();
        while items.len() >= self.max_size {
            items = self.not_full.wait(items).unwrap();
        }
        items.push_back(item);
        self.not_empty.notify_one();
    }

    fn pop(&self) -> T {
        let mut items = self.items.lock().unwrap();
        while items.is_empty() {
            items = self.not_empty.wait(items).unwrap();
        }
        let item = items.pop_front().unwrap();
        self.not_full.notify_one();
        item
    }
}

struct RotatingFile {
    dir: std::path::PathBuf,
    base_name: String,
    date: (u64, u8, u8),
    split_lines: usize,
    lines_today: usize,
    split_index: usize,
    file: File,
}

impl RotatingFile {
    fn open(path: &str) -> std::io::Result<(std::path::PathBuf, String, File)> {
        let path = std::path::Path::new(path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."))
            .to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let base_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "server.log".to_string());

        let today = today();
        let full = dir.join(format!("{}_{}", rotation_stamp(today), base_name));
        let file = OpenOptions::new().create(true).append(true).open(&full)?;
        Ok((dir, base_name, file))
    }

    fn new(path: &str, split_lines: usize) -> std::io::Result<Self> {
        let (dir, base_name, file) = Self::open(path)?;
        Ok(Self {
            dir,
            base_name,
            date: today(),
            split_lines,
            lines_today: 0,
            split_index: 0,
            file,
        })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let today = today();
        if today != self.date {
            self.date = today;
            self.lines_today = 0;
            self.split_index = 0;
            self.reopen()?;
        } else if self.split_lines > 0 && self.lines_today >= self.split_lines {
            self.split_index += 1;
            self.lines_today = 0;
            self.reopen()?;
        }

        writeln!(self.file, "{}", line)?;
        self.lines_today += 1;
        Ok(())
    }

    fn reopen(&mut self) -> std::io::Result<()> {
        let stamp = rotation_stamp(self.date);
        let name = if self.split_index == 0 {
            format!("{}_{}", stamp, self.base_name)
        } else {
            format!("{}_{}.{}", stamp, self.base_name, self.split_index)
        };
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(name))?;
        Ok(())
    }
}

/// `<dir>/YYYY_MM_DD_<base>[.N]` rotation filename prefix.
fn rotation_stamp((year, month, day): (u64, u8, u8)) -> String {
    format!("{:04}_{:02}_{:02}", year, month, day)
}

fn today() -> (u64, u8, u8) {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    date_parts(secs)
}

enum WriterMsg {
    Line(String),
    Shutdown,
}

struct Pipeline {
    queue: Option<&'static BlockingQueue<WriterMsg>>,
    sync_file: Option<Mutex<RotatingFile>>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
    close_log: bool,
}

static PIPELINE: OnceLock<Pipeline> = OnceLock::new();

/// Starts the process-wide log pipeline. Safe to call once at startup;
/// later calls are ignored. `max_queue_size == 0` disables the background
/// queue and writes synchronously under a mutex instead (matches the
/// original's `max_queue_size <= 0` meaning "no async logging").
pub fn init(file_name: &str, close_log: bool, split_lines: usize, max_queue_size: usize) {
    let _ = PIPELINE.get_or_init(|| {
        if max_queue_size == 0 {
            let sync_file = RotatingFile::new(file_name, split_lines).ok().map(Mutex::new);
            return Pipeline {
                queue: None,
                sync_file,
                join: Mutex::new(None),
                close_log,
            };
        }

        let queue: &'static BlockingQueue<WriterMsg> =
            Box::leak(Box::new(BlockingQueue::new(max_queue_size)));
        let file_name = file_name.to_string();
        let handle = std::thread::spawn(move || {
            let mut rotating = match RotatingFile::new(&file_name, split_lines) {
                Ok(f) => f,
                Err(_) => return,
            };
            loop {
                match queue.pop() {
                    WriterMsg::Line(line) => {
                        let _ = rotating.write_line(&line);
                    }
                    WriterMsg::Shutdown => {
                        let _ = rotating.file.flush();
                        break;
                    }
                }
            }
        });

        Pipeline {
            queue: Some(queue),
            sync_file: None,
            join: Mutex::new(Some(handle)),
            close_log,
        }
    });
}

/// Flushes and joins the background writer thread. Call at process exit if
/// `init` was used with a nonzero queue size; otherwise a no-op.
pub fn shutdown() {
    if let Some(p) = PIPELINE.get() {
        if let Some(q) = &p.queue {
            q.push(WriterMsg::Shutdown);
        }
        if let Some(handle) = p.join.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[doc(hidden)]
pub fn dispatch(line: String) {
    match PIPELINE.get() {
        Some(p) if p.close_log => {
            let _ = p;
        }
        Some(p) => {
            if let Some(q) = &p.queue {
                q.push(WriterMsg::Line(line.clone()));
            } else if let Some(f) = &p.sync_file {
                let _ = f.lock().unwrap().write_line(&line);
            }
            println!("{line}");
        }
        None => println!("{line}"),
    }
}

#[macro_export]
macro_rules! log {
    ($level:expr, $color:expr, $($arg:tt)*) => {
        let ts = $crate::format_time(std::time::SystemTime::now());
        $crate::dispatch(format!(
            "[{}] \x1b[30m #|| web-server ||# \x1b[0m \x1b[{}m{}\x1b[0m: {}",
            ts,
            $color,
            $level,
            format!($($arg)*)
        ));
    };
}

#[macro_export]
macro_rules! info { ($($arg:tt)*) => { $crate::log!("INFO ", "32", $($arg)*); }; }
#[macro_export]
macro_rules! warn { ($($arg:tt)*) => { $crate::log!("WARN ", "33", $($arg)*); }; }
#[macro_export]
macro_rules! errors { ($($arg:tt)*) => { $crate::log!("ERROR", "31", $($arg)*); }; }
#[macro_export]
macro_rules! debug { ($($arg:tt)*) => { $crate::log!("DEBUG", "36", $($arg)*); }; }
#[macro_export]
macro_rules! trace { ($($arg:tt)*) => { $crate::log!("TRACE", "34", $($arg)*); }; }
