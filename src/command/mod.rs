//! Control protocol
//!
//! The control channel is line oriented. `key=value` lines accumulate
//! parameters; a `command=<name>` line dispatches using everything
//! accumulated since the previous command. Every command is answered with
//! exactly one `succeeded` or `failed` line, optionally preceded by report
//! lines.

pub mod params;

pub use params::{ParamSet, Target};

use std::sync::Arc;

use crate::backend::Backend;
use crate::error::{CommandError, Result};

/// Acknowledgement line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded,
    Failed,
}

impl Reply {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reply::Succeeded => "succeeded",
            Reply::Failed => "failed",
        }
    }
}

/// Output of one dispatched command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub reports: Vec<String>,
    pub reply: Reply,
}

impl Response {
    /// Lines to write to the reply channel
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.reports
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.reply.as_str()))
    }
}

type Handler = fn(&Backend, &ParamSet, &mut Vec<String>) -> Result<()>;

/// Fixed dispatch table
const COMMANDS: &[(&str, Handler)] = &[
    ("encoder_start", encoder_start),
    ("encoder_stop", encoder_stop),
    ("encoder_update", encoder_update),
    ("new_song_metadata", new_song_metadata),
    ("new_custom_metadata", new_custom_metadata),
    ("initiate_fade", initiate_fade),
    ("recorder_start", recorder_start),
    ("recorder_stop", recorder_stop),
    ("recorder_pause", recorder_pause),
    ("recorder_unpause", recorder_unpause),
    ("get_report", get_report),
    ("jack_samplerate_request", jack_samplerate_request),
    ("server_connect", server_connect),
    ("server_disconnect", server_disconnect),
];

fn encoder_start(backend: &Backend, params: &ParamSet, _: &mut Vec<String>) -> Result<()> {
    let id = params.index()?;
    backend.encoders.start(id, params.encoder_params()?)
}

fn encoder_stop(backend: &Backend, params: &ParamSet, _: &mut Vec<String>) -> Result<()> {
    backend.encoders.stop(params.index()?)
}

fn encoder_update(backend: &Backend, params: &ParamSet, _: &mut Vec<String>) -> Result<()> {
    let id = params.index()?;
    backend.encoders.update(id, params.encoder_params()?)
}

fn new_song_metadata(backend: &Backend, params: &ParamSet, _: &mut Vec<String>) -> Result<()> {
    let meta = params.song_metadata();
    match params.target()? {
        Target::One(id) => {
            backend
                .encoders
                .set_song_metadata(id, &meta.artist, &meta.title, &meta.album)
        }
        Target::All => {
            for id in 0..backend.encoders.len() {
                backend
                    .encoders
                    .set_song_metadata(id, &meta.artist, &meta.title, &meta.album)?;
            }
            for id in 0..backend.recorders.len() {
                backend
                    .recorders
                    .new_metadata(id, &meta.artist, &meta.title, &meta.album)?;
            }
            Ok(())
        }
    }
}

fn new_custom_metadata(backend: &Backend, params: &ParamSet, _: &mut Vec<String>) -> Result<()> {
    let custom = params.get("custom_meta").unwrap_or_default();
    match params.target()? {
        Target::One(id) => backend.encoders.set_custom_metadata(id, custom),
        Target::All => (0..backend.encoders.len())
            .try_for_each(|id| backend.encoders.set_custom_metadata(id, custom)),
    }
}

fn initiate_fade(backend: &Backend, params: &ParamSet, _: &mut Vec<String>) -> Result<()> {
    backend.encoders.initiate_fade(params.index()?)
}

fn recorder_start(backend: &Backend, params: &ParamSet, _: &mut Vec<String>) -> Result<()> {
    let id = params.index()?;
    let recorder = params.recorder_params()?;
    backend.recorders.start(id, recorder, &backend.encoders)
}

fn recorder_stop(backend: &Backend, params: &ParamSet, _: &mut Vec<String>) -> Result<()> {
    backend.recorders.stop(params.index()?)
}

fn recorder_pause(backend: &Backend, params: &ParamSet, _: &mut Vec<String>) -> Result<()> {
    backend.recorders.pause(params.index()?)
}

fn recorder_unpause(backend: &Backend, params: &ParamSet, _: &mut Vec<String>) -> Result<()> {
    backend.recorders.unpause(params.index()?)
}

fn get_report(backend: &Backend, params: &ParamSet, out: &mut Vec<String>) -> Result<()> {
    let id = params.index()?;
    let report = match params.get("dev_type") {
        Some("recorder") => backend.recorders.report(id)?,
        Some("streamer") => backend.streamers.report(id)?,
        Some(other) => return Err(CommandError::UnhandledDeviceType(other.to_string()).into()),
        None => return Err(CommandError::MissingParameter("dev_type").into()),
    };
    out.push(report);
    Ok(())
}

fn jack_samplerate_request(
    backend: &Backend,
    params: &ParamSet,
    _: &mut Vec<String>,
) -> Result<()> {
    backend.feed.set_sample_rate(params.sample_rate()?);
    Ok(())
}

fn server_connect(backend: &Backend, params: &ParamSet, _: &mut Vec<String>) -> Result<()> {
    let id = params.index()?;
    let streamer = params.streamer_params()?;
    backend.streamers.connect(id, &streamer, &backend.encoders)
}

fn server_disconnect(backend: &Backend, params: &ParamSet, _: &mut Vec<String>) -> Result<()> {
    backend.streamers.disconnect(params.index()?)
}

/// Turns control lines into backend calls
pub struct Dispatcher {
    backend: Arc<Backend>,
    params: ParamSet,
}

impl Dispatcher {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self {
            backend,
            params: ParamSet::new(),
        }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Feed one line. Returns the response when the line was a command.
    pub fn handle_line(&mut self, line: &str) -> Option<Response> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() || line == "end" {
            return None;
        }
        let Some((key, value)) = line.split_once('=') else {
            tracing::warn!("{}", CommandError::MalformedLine(line.to_string()));
            return None;
        };
        if key == "command" {
            return Some(self.dispatch(value));
        }
        if let Err(e) = self.params.set(key, value) {
            tracing::warn!("Ignoring parameter: {}", e);
        }
        None
    }

    /// Run `name` with the accumulated parameters, then clear them
    pub fn dispatch(&mut self, name: &str) -> Response {
        let params = std::mem::take(&mut self.params);
        let mut reports = Vec::new();

        let outcome = match COMMANDS.iter().find(|(n, _)| *n == name) {
            Some((_, handler)) => handler(&self.backend, &params, &mut reports),
            None if name.is_empty() => Err(CommandError::MissingCommand.into()),
            None => Err(CommandError::UnknownCommand(name.to_string()).into()),
        };

        let reply = match outcome {
            Ok(()) => {
                tracing::debug!("{} succeeded", name);
                Reply::Succeeded
            }
            Err(e) => {
                tracing::warn!("{} failed: {}", name, e);
                reports.clear();
                Reply::Failed
            }
        };
        Response { reports, reply }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::encoder::EncoderState;
    use crate::testing::CountingFactory;

    fn dispatcher() -> (Dispatcher, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.pools.encoders = 2;
        config.pools.recorders = 1;
        config.pools.streamers = 1;
        config.encoder.poll_interval_ms = 2;
        config.recorder.poll_interval_ms = 2;
        config.recorder.default_folder = dir.path().to_path_buf();
        let backend =
            Backend::with_factory(&config, Arc::new(CountingFactory { restarts: false })).unwrap();
        (Dispatcher::new(Arc::new(backend)), dir)
    }

    fn run(d: &mut Dispatcher, lines: &[&str]) -> Vec<Response> {
        lines.iter().filter_map(|l| d.handle_line(l)).collect()
    }

    #[test]
    fn test_unknown_command_fails() {
        let (mut d, _dir) = dispatcher();
        let responses = run(&mut d, &["tab_id=0", "command=launch_rocket"]);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].reply, Reply::Failed);
        assert!(run(&mut d, &["end", "", "garbage"]).is_empty());
    }

    #[test]
    fn test_parameters_reset_after_command() {
        let (mut d, _dir) = dispatcher();
        let responses = run(
            &mut d,
            &[
                "tab_id=0",
                "family=mpeg",
                "codec=mp3",
                "command=encoder_start",
                "command=encoder_stop",
            ],
        );
        assert_eq!(responses[0].reply, Reply::Succeeded);
        // tab_id was consumed by the first command
        assert_eq!(responses[1].reply, Reply::Failed);
        assert_eq!(
            d.backend().encoders.state(0).unwrap(),
            EncoderState::Running
        );
        let stop = run(&mut d, &["tab_id=0", "command=encoder_stop"]);
        assert_eq!(stop[0].reply, Reply::Succeeded);
    }

    #[test]
    fn test_bad_index_has_no_side_effect() {
        let (mut d, _dir) = dispatcher();
        let responses = run(
            &mut d,
            &[
                "tab_id=9",
                "family=mpeg",
                "codec=mp3",
                "command=encoder_start",
            ],
        );
        assert_eq!(responses[0].reply, Reply::Failed);
        for id in 0..2 {
            assert_eq!(
                d.backend().encoders.state(id).unwrap(),
                EncoderState::Stopped
            );
        }
    }

    #[test]
    fn test_report_lines() {
        let (mut d, _dir) = dispatcher();
        let responses = run(
            &mut d,
            &["tab_id=0", "dev_type=recorder", "command=get_report"],
        );
        let lines: Vec<&str> = responses[0].lines().collect();
        assert_eq!(lines, vec!["recorder0report=0:0", "succeeded"]);

        let responses = run(&mut d, &["tab_id=0", "dev_type=mixer", "command=get_report"]);
        assert_eq!(responses[0].lines().collect::<Vec<_>>(), vec!["failed"]);
    }

    #[test]
    fn test_broadcast_metadata_reaches_every_encoder() {
        let (mut d, _dir) = dispatcher();
        let responses = run(
            &mut d,
            &[
                "tab_id=-1",
                "artist=A",
                "title=T",
                "album=L",
                "command=new_song_metadata",
            ],
        );
        assert_eq!(responses[0].reply, Reply::Succeeded);
        for id in 0..2 {
            let meta = d.backend().encoders.shared(id).unwrap().metadata();
            assert_eq!(meta.title, "T");
        }
    }

    #[test]
    fn test_recorder_pause_before_start() {
        let (mut d, dir) = dispatcher();
        let responses = run(
            &mut d,
            &[
                "tab_id=0",
                "command=recorder_pause",
                "tab_id=0",
                "record_source=-1",
                "record_filename=take",
                "command=recorder_start",
                "tab_id=0",
                "dev_type=recorder",
                "command=get_report",
                "tab_id=0",
                "command=recorder_stop",
                "tab_id=0",
                "command=recorder_stop",
            ],
        );
        let replies: Vec<Reply> = responses.iter().map(|r| r.reply).collect();
        assert_eq!(
            replies,
            vec![
                Reply::Succeeded,
                Reply::Succeeded,
                Reply::Succeeded,
                Reply::Succeeded,
                Reply::Failed
            ]
        );
        assert_eq!(responses[2].reports, vec!["recorder0report=2:0".to_string()]);
        assert!(dir.path().join("take.wav").exists());
        assert!(dir.path().join("take.cue").exists());
    }
}
