//! Error types for the live encode/record core

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("Streamer error: {0}")]
    Streamer(#[from] StreamerError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio feed and device errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Resampler error: {0}")]
    Resampler(String),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Codec backend errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Container write failed: {0}")]
    Container(String),
}

/// Encoder slot errors
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("Encoder {0} does not exist")]
    NotFound(usize),

    #[error("Encoder {0} is not stopped")]
    NotStopped(usize),

    #[error("Encoder {0} is not running")]
    NotRunning(usize),

    #[error("Encoder {0} is already stopped")]
    AlreadyStopped(usize),

    #[error("Encoder {0} failed during initialisation")]
    StartFailed(usize),

    #[error("Invalid encoder parameter {key}: {value}")]
    InvalidParameter { key: &'static str, value: String },

    #[error("Timed out waiting for encoder {0}")]
    Timeout(usize),

    #[error("Failed to spawn encoder thread: {0}")]
    Spawn(String),
}

/// Recorder errors
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Recorder {0} does not exist")]
    NotFound(usize),

    #[error("Recorder {0} is already running")]
    AlreadyRunning(usize),

    #[error("Recorder {0} is already stopped")]
    AlreadyStopped(usize),

    #[error("Recorder {0} is already paused")]
    AlreadyPaused(usize),

    #[error("Recorder {0} is not paused")]
    NotPaused(usize),

    #[error("Recorder {0} is not recording")]
    NotRecording(usize),

    #[error("Timed out waiting for recorder {0}")]
    Timeout(usize),

    #[error("Invalid record source: {0}")]
    InvalidSource(String),

    #[error("Lossless writer error: {0}")]
    Writer(String),

    #[error("Tagging failed: {0}")]
    Tagging(String),

    #[error("Failed to spawn recorder thread: {0}")]
    Spawn(String),
}

/// Streamer errors
#[derive(Error, Debug)]
pub enum StreamerError {
    #[error("Streamer {0} does not exist")]
    NotFound(usize),

    #[error("Streamer {0} is already connected")]
    AlreadyConnected(usize),

    #[error("Streamer {0} is not connected")]
    NotConnected(usize),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Failed to spawn streamer thread: {0}")]
    Spawn(String),
}

/// Control protocol errors
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Missing command name")]
    MissingCommand,

    #[error("Malformed line: {0}")]
    MalformedLine(String),

    #[error("Unknown key: {0}")]
    UnknownKey(String),

    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid instance index: {0}")]
    InvalidIndex(String),

    #[error("Unhandled device type: {0}")]
    UnhandledDeviceType(String),
}

impl From<hound::Error> for RecorderError {
    fn from(e: hound::Error) -> Self {
        RecorderError::Writer(e.to_string())
    }
}

impl From<rubato::ResamplerConstructionError> for AudioError {
    fn from(e: rubato::ResamplerConstructionError) -> Self {
        AudioError::Resampler(e.to_string())
    }
}

impl From<rubato::ResampleError> for AudioError {
    fn from(e: rubato::ResampleError) -> Self {
        AudioError::Resampler(e.to_string())
    }
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
