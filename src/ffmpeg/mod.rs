/*!
 * ffmpeg / ffplay Command Lines
 *
 * Capture, encode, transport, decode and display all happen in external
 * processes. This module only assembles their argument lists; `process`
 * spawns and supervises them.
 */

pub mod process;

pub use process::{ManagedProcess, StopOutcome};

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;

use crate::config::{NetworkParams, VideoParams};
use crate::platform::CaptureBackend;
use crate::video::{gop_for_framerate, PixelFormat, RateControl};

pub const FFMPEG: &str = "ffmpeg";
pub const FFPLAY: &str = "ffplay";

/// MPEG-TS packets sized to fit a typical MTU.
pub const PKT_SIZE: u32 = 1316;

/// How long ffmpeg's UDP input waits for data, in microseconds.
const UDP_TIMEOUT_US: u64 = 1_000_000;
const UDP_FIFO_SIZE: u32 = 1_000_000;

/// Raw frames cross every pipe in this format.
pub const PIPE_FORMAT: PixelFormat = PixelFormat::BGR24;

/// Program plus arguments, printable for the startup log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegCommand {
    program: String,
    args: Vec<String>,
}

impl FfmpegCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `-flag value` pair.
    pub fn opt(self, flag: &str, value: impl Into<String>) -> Self {
        self.arg(flag).arg(value)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Value following `flag`, for the first occurrence.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// Tokio command with all three pipes configured for supervision.
    pub fn to_command(&self, stdin: Stdio, stdout: Stdio) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl fmt::Display for FfmpegCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

fn video_size(video: &VideoParams) -> String {
    format!("{}x{}", video.width, video.height)
}

fn udp_output_url(host: SocketAddr) -> String {
    format!("udp://{}?pkt_size={}", host, PKT_SIZE)
}

fn udp_input_url(bind: SocketAddr) -> String {
    format!(
        "udp://@{}?timeout={}&fifo_size={}&overrun_nonfatal=1&reuse=1",
        bind, UDP_TIMEOUT_US, UDP_FIFO_SIZE
    )
}

fn with_capture_input(cmd: FfmpegCommand, backend: &CaptureBackend, video: &VideoParams) -> FfmpegCommand {
    let mut cmd = cmd.opt("-f", backend.input_format.clone());
    if let Some(pix_fmt) = &backend.pixel_format {
        cmd = cmd.opt("-pix_fmt", pix_fmt.clone());
    }
    cmd.opt("-framerate", video.framerate.to_string())
        .opt("-video_size", video_size(video))
        .opt("-i", backend.device.clone())
}

fn with_h264_encoder(cmd: FfmpegCommand, video: &VideoParams) -> FfmpegCommand {
    let rate = RateControl::new(video.bitrate_kbps);
    let (gop, keyint_min) = gop_for_framerate(video.framerate);
    cmd.opt("-c:v", "libx264")
        .opt("-preset", "ultrafast")
        .opt("-tune", "zerolatency")
        .opt("-b:v", format!("{}k", rate.bitrate_kbps))
        .opt("-minrate", format!("{}k", rate.minrate_kbps))
        .opt("-maxrate", format!("{}k", rate.maxrate_kbps))
        .opt("-bufsize", format!("{}k", rate.bufsize_kbps))
        .opt("-g", gop.to_string())
        .opt("-keyint_min", keyint_min.to_string())
        .opt("-r", video.framerate.to_string())
}

/// MPEG-TS output to the viewer, or to viewer and recorder through `tee`.
fn with_transport_output(cmd: FfmpegCommand, network: &NetworkParams) -> FfmpegCommand {
    let viewer = udp_output_url(SocketAddr::new(network.operator_ip, network.video_port));
    match network.recorder_video_port {
        Some(port) if port != network.video_port => {
            let recorder = udp_output_url(SocketAddr::new(network.operator_ip, port));
            cmd.opt("-map", "0:v")
                .opt("-f", "tee")
                .arg(format!("[f=mpegts]{}|[f=mpegts]{}", viewer, recorder))
        }
        _ => cmd.opt("-f", "mpegts").arg(viewer),
    }
}

/// Camera to raw frames on stdout, for tagging.
pub fn capture_command(backend: &CaptureBackend, video: &VideoParams) -> FfmpegCommand {
    let cmd = FfmpegCommand::new(FFMPEG).args(["-hide_banner", "-loglevel", "warning"]);
    with_capture_input(cmd, backend, video)
        .opt("-f", "rawvideo")
        .opt("-pix_fmt", PIPE_FORMAT.ffmpeg_name())
        .opt("-s", video_size(video))
        .arg("pipe:1")
}

/// Tagged raw frames on stdin to H.264 MPEG-TS over UDP.
pub fn encode_command(video: &VideoParams, network: &NetworkParams) -> FfmpegCommand {
    let cmd = FfmpegCommand::new(FFMPEG)
        .args(["-hide_banner", "-loglevel", "warning"])
        .opt("-f", "rawvideo")
        .opt("-pix_fmt", PIPE_FORMAT.ffmpeg_name())
        .opt("-video_size", video_size(video))
        .opt("-framerate", video.framerate.to_string())
        .opt("-i", "pipe:0");
    let cmd = with_h264_encoder(cmd, video).opt("-pix_fmt", "yuv420p");
    with_transport_output(cmd, network)
}

/// Camera straight to the network, no tagging.
pub fn direct_stream_command(backend: &CaptureBackend, video: &VideoParams, network: &NetworkParams) -> FfmpegCommand {
    let cmd = with_capture_input(FfmpegCommand::new(FFMPEG).arg("-hide_banner"), backend, video);
    with_transport_output(with_h264_encoder(cmd, video), network)
}

/// UDP MPEG-TS to raw frames on stdout at the configured resolution.
pub fn viewer_decode_command(video: &VideoParams, bind: SocketAddr) -> FfmpegCommand {
    FfmpegCommand::new(FFMPEG)
        .args(["-hide_banner", "-loglevel", "warning"])
        .opt("-fflags", "nobuffer+discardcorrupt")
        .opt("-flags", "low_delay")
        .opt("-i", udp_input_url(bind))
        .opt("-vf", format!("scale={}:{}", video.width, video.height))
        .opt("-f", "rawvideo")
        .opt("-pix_fmt", PIPE_FORMAT.ffmpeg_name())
        .opt("-vsync", "0")
        .arg("pipe:1")
}

fn backslash_escape(value: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape a filter option value, unquoted. ffmpeg unescapes twice: once
/// when splitting the filtergraph, once when splitting the filter's options.
fn filter_escape(value: &str) -> String {
    let option_level = backslash_escape(value, &[':', '\'']);
    backslash_escape(&option_level, &['\'', ',', ';', '[', ']'])
}

/// ffplay window fed raw frames on stdin, with an optional text overlay
/// reloaded from `overlay_file` every frame.
pub fn display_command(video: &VideoParams, title: &str, overlay_file: Option<&Path>) -> FfmpegCommand {
    let mut cmd = FfmpegCommand::new(FFPLAY)
        .args(["-hide_banner", "-loglevel", "warning"])
        .opt("-window_title", title)
        .opt("-f", "rawvideo")
        .opt("-pixel_format", PIPE_FORMAT.ffmpeg_name())
        .opt("-video_size", video_size(video))
        .opt("-framerate", video.framerate.to_string())
        .args(["-fflags", "nobuffer", "-sync", "video"]);

    if let Some(path) = overlay_file {
        let filter = format!(
            "drawtext=textfile={}:reload=1:x=10:y=h-th-10:fontsize=20:fontcolor=white:box=1:boxcolor=black@0.6:boxborderw=6",
            filter_escape(&path.to_string_lossy())
        );
        cmd = cmd.opt("-vf", filter);
    }
    cmd.opt("-i", "pipe:0")
}

/// UDP MPEG-TS copied into `output` (MP4), optionally also decoded to raw
/// frames on stdout for latency measurement.
pub fn recorder_command(video: &VideoParams, bind: SocketAddr, output: &Path, probe: bool) -> FfmpegCommand {
    let mut cmd = FfmpegCommand::new(FFMPEG)
        .args(["-hide_banner", "-loglevel", "warning", "-y"])
        .opt("-fflags", "nobuffer")
        .opt("-i", udp_input_url(bind))
        .opt("-map", "0:v")
        .opt("-c:v", "copy")
        .opt("-movflags", "+faststart")
        .arg(output.to_string_lossy().into_owned());

    if probe {
        cmd = cmd
            .opt("-map", "0:v")
            .opt("-vf", format!("scale={}:{}", video.width, video.height))
            .opt("-f", "rawvideo")
            .opt("-pix_fmt", PIPE_FORMAT.ffmpeg_name())
            .opt("-vsync", "0")
            .arg("pipe:1");
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn linux() -> CaptureBackend {
        CaptureBackend::for_platform("linux")
    }

    fn position(cmd: &FfmpegCommand, arg: &str) -> usize {
        cmd.get_args().iter().position(|a| a == arg).unwrap()
    }

    #[test]
    fn capture_emits_raw_bgr() {
        let cmd = capture_command(&linux(), &VideoParams::default());
        assert_eq!(cmd.program(), "ffmpeg");
        assert_eq!(cmd.value_of("-i"), Some("/dev/video0"));
        assert_eq!(cmd.value_of("-video_size"), Some("640x480"));
        assert_eq!(cmd.get_args().last().map(String::as_str), Some("pipe:1"));
        assert!(cmd.to_string().contains("-f rawvideo -pix_fmt bgr24"));
    }

    #[test]
    fn mac_capture_requests_0rgb_before_input() {
        let cmd = capture_command(&CaptureBackend::for_platform("macos"), &VideoParams::default());
        assert_eq!(cmd.value_of("-f"), Some("avfoundation"));
        assert_eq!(cmd.value_of("-pix_fmt"), Some("0rgb"));
        assert!(position(&cmd, "0rgb") < position(&cmd, "-i"));
    }

    #[test]
    fn encoder_rate_control_and_gop() {
        let video = VideoParams { framerate: 25, ..VideoParams::default() };
        let cmd = encode_command(&video, &NetworkParams::default());
        assert_eq!(cmd.value_of("-i"), Some("pipe:0"));
        assert_eq!(cmd.value_of("-preset"), Some("ultrafast"));
        assert_eq!(cmd.value_of("-tune"), Some("zerolatency"));
        assert_eq!(cmd.value_of("-b:v"), Some("1000k"));
        assert_eq!(cmd.value_of("-minrate"), Some("800k"));
        assert_eq!(cmd.value_of("-maxrate"), Some("1200k"));
        assert_eq!(cmd.value_of("-bufsize"), Some("1000k"));
        assert_eq!(cmd.value_of("-g"), Some("50"));
        assert_eq!(cmd.value_of("-keyint_min"), Some("25"));
        assert_eq!(
            cmd.get_args().last().map(String::as_str),
            Some("udp://127.0.0.1:5000?pkt_size=1316")
        );
    }

    #[test]
    fn recorder_port_switches_to_tee() {
        let network = NetworkParams { recorder_video_port: Some(5002), ..NetworkParams::default() };
        let cmd = encode_command(&VideoParams::default(), &network);
        assert!(cmd.has_arg("tee"));
        assert_eq!(
            cmd.get_args().last().map(String::as_str),
            Some("[f=mpegts]udp://127.0.0.1:5000?pkt_size=1316|[f=mpegts]udp://127.0.0.1:5002?pkt_size=1316")
        );

        // Same port as the viewer means nothing extra to feed
        let network = NetworkParams { recorder_video_port: Some(5000), ..NetworkParams::default() };
        assert!(!encode_command(&VideoParams::default(), &network).has_arg("tee"));
    }

    #[test]
    fn direct_stream_matches_single_process_pipeline() {
        let cmd = direct_stream_command(&linux(), &VideoParams::default(), &NetworkParams::default());
        assert_eq!(cmd.value_of("-i"), Some("/dev/video0"));
        assert_eq!(cmd.value_of("-c:v"), Some("libx264"));
        assert!(!cmd.has_arg("rawvideo"));
        assert!(cmd.has_arg("mpegts"));
    }

    #[test]
    fn viewer_flags_precede_input() {
        let bind: SocketAddr = "0.0.0.0:5000".parse().unwrap();
        let cmd = viewer_decode_command(&VideoParams::default(), bind);
        let input = position(&cmd, "-i");
        assert!(position(&cmd, "nobuffer+discardcorrupt") < input);
        assert!(position(&cmd, "low_delay") < input);
        let url = cmd.value_of("-i").unwrap();
        assert!(url.starts_with("udp://@0.0.0.0:5000?"));
        assert!(url.contains("overrun_nonfatal=1"));
        assert!(url.contains("reuse=1"));
        assert_eq!(cmd.value_of("-vf"), Some("scale=640:480"));
        assert_eq!(cmd.value_of("-vsync"), Some("0"));
    }

    #[test]
    fn display_overlay_reloads_text_file() {
        let path = PathBuf::from("/tmp/view/overlay.txt");
        let cmd = display_command(&VideoParams::default(), "Operator View", Some(&path));
        assert_eq!(cmd.program(), "ffplay");
        assert_eq!(cmd.value_of("-window_title"), Some("Operator View"));
        let filter = cmd.value_of("-vf").unwrap();
        assert!(filter.starts_with("drawtext=textfile=/tmp/view/overlay.txt:reload=1"));
        assert!(filter.contains("reload=1"));
        assert!(cmd.to_string().contains("'Operator View'"));

        assert!(display_command(&VideoParams::default(), "x", None).value_of("-vf").is_none());
    }

    #[test]
    fn filter_values_are_escaped() {
        // Plain unix paths pass through untouched
        assert_eq!(filter_escape("/tmp/view/overlay.txt"), "/tmp/view/overlay.txt");
        // Option separator and backslashes survive both unescaping passes
        assert_eq!(filter_escape("C:\\tmp\\o.txt"), "C\\\\:\\\\\\\\tmp\\\\\\\\o.txt");
        assert_eq!(filter_escape("/tmp/a,b"), "/tmp/a\\,b");
        assert_eq!(filter_escape("it's"), "it\\\\\\'s");
    }

    #[test]
    fn recorder_copies_and_optionally_probes() {
        let bind: SocketAddr = "0.0.0.0:5000".parse().unwrap();
        let out = PathBuf::from("recordings/recording_20240101_120000.mp4");

        let plain = recorder_command(&VideoParams::default(), bind, &out, false);
        assert_eq!(plain.value_of("-c:v"), Some("copy"));
        assert_eq!(plain.value_of("-movflags"), Some("+faststart"));
        assert_eq!(
            plain.get_args().last().map(String::as_str),
            Some("recordings/recording_20240101_120000.mp4")
        );

        let probed = recorder_command(&VideoParams::default(), bind, &out, true);
        assert_eq!(probed.get_args().last().map(String::as_str), Some("pipe:1"));
        assert!(probed.has_arg("rawvideo"));
    }
}
