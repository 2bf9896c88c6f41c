//! Output sink that pipes raw frames into an `ffmpeg` child process.
//!
//! ffmpeg reads `rawvideo` on stdin at a constant frame rate, encodes it with
//! a codec chosen from the output extension, and muxes the container. Gaps in
//! presentation indices are filled by repeating the previous frame so the
//! constant-rate output keeps wall-clock timing.

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, Command, ExitStatus, Output, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use crate::encoder::{OutputSink, SinkOpener};
use crate::error::EncodeError;
use crate::video_types::{DisplayGeometry, Frame, PixelFormat};

/// How long `finalize` waits for ffmpeg to flush and exit before killing it.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on duplicate frames written for a single gap.
const MAX_PADDING_FRAMES: u64 = 300;

/// Bound on `ffmpeg -version` / `ffprobe` runs.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Output containers recognised by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Mp4,
    Mov,
    M4v,
    Mkv,
    Webm,
    Avi,
    Flv,
    Wmv,
}

impl Container {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "mp4" => Some(Container::Mp4),
            "mov" => Some(Container::Mov),
            "m4v" => Some(Container::M4v),
            "mkv" => Some(Container::Mkv),
            "webm" => Some(Container::Webm),
            "avi" => Some(Container::Avi),
            "flv" => Some(Container::Flv),
            "wmv" => Some(Container::Wmv),
            _ => None,
        }
    }

    pub fn video_codec(self) -> &'static str {
        match self {
            Container::Mp4 | Container::Mov | Container::M4v | Container::Mkv => "libx264",
            Container::Webm => "libvpx-vp9",
            Container::Avi => "mpeg4",
            Container::Flv => "flv1",
            Container::Wmv => "wmv2",
        }
    }

    /// Whether the index should be moved to the front for progressive playback.
    pub fn faststart(self) -> bool {
        matches!(self, Container::Mp4 | Container::Mov | Container::M4v)
    }
}

/// Build the ffmpeg command that encodes raw frames from stdin into `output`.
pub fn build_ffmpeg_command(
    ffmpeg_path: &Path,
    input: DisplayGeometry,
    frame_rate: u32,
    container: Container,
    output: &Path,
) -> Command {
    let mut cmd = Command::new(ffmpeg_path);
    cmd.args(["-hide_banner", "-loglevel", "warning", "-stats"]);

    // Raw frame input
    cmd.arg("-f").arg("rawvideo");
    cmd.arg("-pix_fmt").arg(input.format.ffmpeg_name());
    cmd.arg("-s").arg(format!("{}x{}", input.width, input.height));
    cmd.arg("-r").arg(frame_rate.to_string());
    cmd.arg("-i").arg("-");

    // Encoding options
    cmd.arg("-c:v").arg(container.video_codec());
    cmd.arg("-pix_fmt").arg("yuv420p");
    if container.faststart() {
        cmd.arg("-movflags").arg("+faststart");
    }

    cmd.arg("-y").arg(output);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    cmd
}

/// Opens [`FfmpegSink`]s using the given ffmpeg executable.
#[derive(Debug, Clone)]
pub struct FfmpegSinkOpener {
    ffmpeg_path: PathBuf,
}

impl Default for FfmpegSinkOpener {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegSinkOpener {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg_path
    }
}

impl SinkOpener for FfmpegSinkOpener {
    fn open(
        &mut self,
        geometry: DisplayGeometry,
        frame_rate: u32,
        path: &Path,
    ) -> Result<Box<dyn OutputSink>, EncodeError> {
        FfmpegSink::spawn(&self.ffmpeg_path, geometry, frame_rate, path)
            .map(|sink| Box::new(sink) as Box<dyn OutputSink>)
    }
}

/// A running ffmpeg process fed through its stdin.
pub struct FfmpegSink {
    child: Child,
    stdin: Option<ChildStdin>,
    geometry: DisplayGeometry,
    output: PathBuf,
    next_pts: u64,
    previous: Vec<u8>,
    frames_written: u64,
    frames_padded: u64,
    last_stderr: Arc<Mutex<Option<String>>>,
    stderr_thread: Option<thread::JoinHandle<()>>,
}

impl FfmpegSink {
    /// Spawn ffmpeg for `geometry` frames at `frame_rate` into `output`.
    pub fn spawn(
        ffmpeg_path: &Path,
        geometry: DisplayGeometry,
        frame_rate: u32,
        output: &Path,
    ) -> Result<Self, EncodeError> {
        let container = Container::from_path(output).ok_or_else(|| {
            EncodeError::Fatal(format!(
                "unsupported output container: {}",
                output.display()
            ))
        })?;

        let mut cmd = build_ffmpeg_command(ffmpeg_path, geometry, frame_rate, container, output);
        let mut child = cmd.spawn().map_err(|e| {
            EncodeError::Fatal(format!("failed to spawn {}: {e}", ffmpeg_path.display()))
        })?;

        let stdin = child.stdin.take();
        let last_stderr = Arc::new(Mutex::new(None));
        let stderr_thread = match child.stderr.take() {
            Some(stderr) => match drain_stderr(stderr, Arc::clone(&last_stderr)) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(EncodeError::Fatal(format!(
                        "failed to start ffmpeg stderr reader: {e}"
                    )));
                }
            },
            None => None,
        };

        tracing::info!(
            pid = child.id(),
            codec = container.video_codec(),
            %geometry,
            frame_rate,
            output = %output.display(),
            "ffmpeg encoder started"
        );

        Ok(Self {
            child,
            stdin,
            geometry,
            output: output.to_path_buf(),
            next_pts: 0,
            previous: Vec::new(),
            frames_written: 0,
            frames_padded: 0,
            last_stderr,
            stderr_thread,
        })
    }

    fn write_frame(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(EncodeError::Fatal("ffmpeg stdin already closed".into()));
        };
        if let Err(e) = stdin.write_all(data) {
            let detail = self.last_stderr_line();
            return Err(EncodeError::Fatal(if e.kind() == io::ErrorKind::BrokenPipe {
                format!("ffmpeg exited early: {detail}")
            } else {
                format!("write to ffmpeg: {e} ({detail})")
            }));
        }
        Ok(())
    }

    fn last_stderr_line(&self) -> String {
        self.last_stderr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| "no diagnostics".into())
    }

    fn wait_for_exit(&mut self) -> Result<ExitStatus, EncodeError> {
        let started = Instant::now();
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => return Err(EncodeError::Fatal(format!("wait for ffmpeg: {e}"))),
            }
            if started.elapsed() > SHUTDOWN_TIMEOUT {
                tracing::warn!(timeout = ?SHUTDOWN_TIMEOUT, "ffmpeg did not exit in time, killing process");
                let _ = self.child.kill();
                let _ = self.child.wait();
                return Err(EncodeError::Fatal(format!(
                    "ffmpeg did not exit within {SHUTDOWN_TIMEOUT:?}"
                )));
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl OutputSink for FfmpegSink {
    fn input_format(&self) -> PixelFormat {
        self.geometry.format
    }

    fn submit(&mut self, frame: &Frame, pts: u64) -> Result<(), EncodeError> {
        if frame.geometry() != self.geometry {
            return Err(EncodeError::Failed(format!(
                "frame {} is {}, encoder was opened for {}",
                frame.sequence(),
                frame.geometry(),
                self.geometry
            )));
        }

        if self.frames_written > 0 && pts > self.next_pts {
            let gap = pts - self.next_pts;
            let padding = gap.min(MAX_PADDING_FRAMES);
            if padding < gap {
                tracing::warn!(gap, padding, "timing gap exceeds padding limit, output will skip ahead");
            }
            let previous = std::mem::take(&mut self.previous);
            for _ in 0..padding {
                if let Err(e) = self.write_frame(&previous) {
                    self.previous = previous;
                    return Err(e);
                }
            }
            self.previous = previous;
            self.frames_padded += padding;
        }

        self.write_frame(frame.data())?;
        self.previous.clear();
        self.previous.extend_from_slice(frame.data());
        self.frames_written += 1;
        self.next_pts = pts + 1;
        Ok(())
    }

    fn frames_padded(&self) -> u64 {
        self.frames_padded
    }

    fn finalize(self: Box<Self>) -> Result<(), EncodeError> {
        let mut this = *self;
        // EOF on stdin tells ffmpeg to flush and write the trailer.
        drop(this.stdin.take());
        let status = this.wait_for_exit();

        if let Some(handle) = this.stderr_thread.take() {
            let _ = handle.join();
        }

        if this.frames_written == 0 {
            match std::fs::remove_file(&this.output) {
                Ok(()) => tracing::debug!(output = %this.output.display(), "removed empty output"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(error = %e, "failed to remove empty output"),
            }
            return Ok(());
        }

        let status = status?;
        if !status.success() {
            return Err(EncodeError::Fatal(format!(
                "ffmpeg exited with {status}: {}",
                this.last_stderr_line()
            )));
        }

        tracing::info!(
            frames_written = this.frames_written,
            frames_padded = this.frames_padded,
            output = %this.output.display(),
            "ffmpeg encoder finished"
        );
        Ok(())
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Ok(None) = self.child.try_wait() {
            tracing::debug!(pid = self.child.id(), "killing abandoned ffmpeg process");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Log ffmpeg's stderr, keeping the last line for error reports.
fn drain_stderr(
    stderr: ChildStderr,
    last_line: Arc<Mutex<Option<String>>>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("ffmpeg-stderr".into())
        .spawn(move || {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match read_segment(&mut reader, &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to read ffmpeg stderr");
                        break;
                    }
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(time) = parse_progress_time(line) {
                    tracing::debug!(encoded = ?time, "ffmpeg progress");
                } else {
                    tracing::trace!("[ffmpeg] {line}");
                    *last_line.lock().unwrap_or_else(|e| e.into_inner()) = Some(line.to_owned());
                }
            }
        })
}

/// Read up to and including the next `\r` or `\n`. ffmpeg ends progress
/// lines with a bare carriage return.
fn read_segment<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<usize> {
    let mut total = 0;
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if available.is_empty() {
            return Ok(total);
        }
        match available.iter().position(|&b| b == b'\r' || b == b'\n') {
            Some(i) => {
                buf.extend_from_slice(&available[..=i]);
                reader.consume(i + 1);
                return Ok(total + i + 1);
            }
            None => {
                let n = available.len();
                buf.extend_from_slice(available);
                reader.consume(n);
                total += n;
            }
        }
    }
}

/// Extract the `time=HH:MM:SS.cc` field of an ffmpeg progress line.
pub fn parse_progress_time(line: &str) -> Option<Duration> {
    let start = line.find("time=")? + "time=".len();
    let field = line[start..].split_whitespace().next()?;

    let mut parts = field.splitn(3, ':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if minutes >= 60 || !(0.0..60.0).contains(&seconds) {
        return None;
    }

    Some(Duration::from_secs(hours * 3600 + minutes * 60) + Duration::from_secs_f64(seconds))
}

/// Run `ffmpeg -version` and return its first line.
pub fn probe_version(ffmpeg_path: &Path) -> Result<String> {
    let mut cmd = Command::new(ffmpeg_path);
    cmd.arg("-version");
    let output = run_with_timeout(cmd, PROBE_TIMEOUT)
        .with_context(|| format!("failed to run {} -version", ffmpeg_path.display()))?;
    if !output.status.success() {
        bail!("{} -version exited with {}", ffmpeg_path.display(), output.status);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = stdout.lines().next().unwrap_or_default().trim().to_owned();
    tracing::debug!(%version, "ffmpeg detected");
    Ok(version)
}

/// The `ffprobe` that ships next to `ffmpeg_path`.
pub fn ffprobe_for(ffmpeg_path: &Path) -> PathBuf {
    let Some(name) = ffmpeg_path.file_name().and_then(|n| n.to_str()) else {
        return PathBuf::from("ffprobe");
    };
    if !name.contains("ffmpeg") {
        return PathBuf::from("ffprobe");
    }
    let probe: OsString = name.replacen("ffmpeg", "ffprobe", 1).into();
    ffmpeg_path.with_file_name(probe)
}

/// Container duration of a finished media file, as reported by ffprobe.
pub fn probe_duration(ffprobe_path: &Path, file: &Path) -> Result<Duration> {
    let mut cmd = Command::new(ffprobe_path);
    cmd.args([
        "-v",
        "quiet",
        "-print_format",
        "compact=p=0:nk=1",
        "-show_entries",
        "format=duration",
    ])
    .arg(file);

    let output = run_with_timeout(cmd, PROBE_TIMEOUT)
        .with_context(|| format!("failed to run {}", ffprobe_path.display()))?;
    if !output.status.success() {
        bail!("ffprobe exited with {} for {}", output.status, file.display());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let secs: f64 = stdout
        .trim()
        .parse()
        .with_context(|| format!("unexpected ffprobe duration output: {:?}", stdout.trim()))?;
    if !secs.is_finite() || secs < 0.0 {
        bail!("ffprobe reported invalid duration {secs}");
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Run `cmd` to completion, killing it after `timeout`.
fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<Output> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("spawn failed")?;

    let mut stdout = child.stdout.take().context("stdout not captured")?;
    let reader = thread::spawn(move || {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).map(|_| buf)
    });

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait().context("wait failed")? {
            break status;
        }
        if started.elapsed() > timeout {
            let _ = child.kill();
            let _ = child.wait();
            bail!("timed out after {timeout:?}");
        }
        thread::sleep(Duration::from_millis(20));
    };

    let stdout = match reader.join() {
        Ok(read) => read.context("failed to read stdout")?,
        Err(_) => bail!("stdout reader panicked"),
    };
    Ok(Output {
        status,
        stdout,
        stderr: Vec::new(),
    })
}
