//! DSP engine RPC contract and CamillaDSP WebSocket client
//!
//! The engine speaks JSON text frames over a plain WebSocket: a command is
//! either a bare string (`"GetVolume"`) or a single-key object
//! (`{"SetVolume": -23.5}`), and every reply echoes the command name:
//! `{"GetVolume": {"result": "Ok", "value": -23.5}}`.
//!
//! `DspEngine` is the seam the controller is written against; tests drive it
//! with an in-memory fake, production uses [`CamillaClient`]. One request is
//! in flight at a time (the socket lives behind a mutex and request/response
//! are paired under it); state-mutating calls are additionally serialized by
//! the controller's own critical sections.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Engine faults; all three transport flavors are handled uniformly by
/// callers ("operation failed, log and return no-result")
#[derive(Debug, Error)]
pub enum EngineError {
    /// Could not reach the engine (connection refused, handshake failure)
    #[error("can't connect to the engine: {0}")]
    Connection(String),

    /// The engine replied with an error or an unexpected payload
    #[error("engine replied with error: {0}")]
    Protocol(String),

    /// Transport-level failure on an established connection
    #[error("websocket I/O error: {0}")]
    Io(String),

    /// No connection is established
    #[error("websocket is not connected")]
    NotConnected,
}

/// Engine processing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ProcessingState {
    Running,
    Paused,
    Inactive,
    Starting,
    Stalled,
}

/// DSP engine RPC surface consumed by the controller
#[async_trait]
pub trait DspEngine: Send + Sync {
    /// Establish the connection; idempotent when already connected
    async fn connect(&self) -> Result<(), EngineError>;

    /// Whether a connection is currently established
    async fn is_connected(&self) -> bool;

    async fn version(&self) -> Result<String, EngineError>;
    async fn state(&self) -> Result<ProcessingState, EngineError>;

    /// Main volume in dB
    async fn volume(&self) -> Result<f64, EngineError>;
    async fn set_volume(&self, db: f64) -> Result<(), EngineError>;

    async fn mute(&self) -> Result<bool, EngineError>;
    async fn set_mute(&self, mute: bool) -> Result<(), EngineError>;

    /// Path of the active configuration file
    async fn config_path(&self) -> Result<String, EngineError>;
    async fn set_config_path(&self, path: &str) -> Result<(), EngineError>;

    /// Validate a configuration (YAML text) without applying it
    async fn validate_config(&self, config: &str) -> Result<(), EngineError>;

    /// Apply a configuration (YAML text)
    async fn set_config(&self, config: &str) -> Result<(), EngineError>;

    /// Per-channel playback RMS levels in dB
    async fn playback_rms(&self) -> Result<Vec<f64>, EngineError>;

    /// Per-channel playback peak levels in dB
    async fn playback_peak(&self) -> Result<Vec<f64>, EngineError>;
}

/// CamillaDSP WebSocket client
pub struct CamillaClient {
    url: String,
    socket: Mutex<Option<WsStream>>,
}

impl CamillaClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            url: format!("ws://{}:{}", host, port),
            socket: Mutex::new(None),
        }
    }

    /// Send one command and read its reply
    ///
    /// Any transport fault drops the socket so the connect loop picks the
    /// disconnect up on its next tick.
    async fn request(&self, command: Value) -> Result<Value, EngineError> {
        let name = command_name(&command)?.to_string();
        let mut guard = self.socket.lock().await;
        let socket = guard.as_mut().ok_or(EngineError::NotConnected)?;

        if let Err(e) = socket.send(Message::Text(command.to_string())).await {
            *guard = None;
            return Err(EngineError::Io(e.to_string()));
        }

        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return parse_reply(&name, &text),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(_)) => {
                    *guard = None;
                    return Err(EngineError::Protocol("unexpected binary frame".into()));
                },
                Some(Err(e)) => {
                    *guard = None;
                    return Err(EngineError::Io(e.to_string()));
                },
                None => {
                    *guard = None;
                    return Err(EngineError::Io("connection closed".into()));
                },
            }
        }
    }

    /// Issue a command and discard the (empty) reply value
    async fn command(&self, command: Value) -> Result<(), EngineError> {
        self.request(command).await.map(|_| ())
    }
}

#[async_trait]
impl DspEngine for CamillaClient {
    async fn connect(&self) -> Result<(), EngineError> {
        let mut guard = self.socket.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        debug!("websocket established to {}", self.url);
        *guard = Some(socket);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.socket.lock().await.is_some()
    }

    async fn version(&self) -> Result<String, EngineError> {
        let value = self.request(json!("GetVersion")).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| EngineError::Protocol("non-string version".into()))
    }

    async fn state(&self) -> Result<ProcessingState, EngineError> {
        let value = self.request(json!("GetState")).await?;
        serde_json::from_value(value).map_err(|e| EngineError::Protocol(e.to_string()))
    }

    async fn volume(&self) -> Result<f64, EngineError> {
        let value = self.request(json!("GetVolume")).await?;
        value
            .as_f64()
            .ok_or_else(|| EngineError::Protocol("non-numeric volume".into()))
    }

    async fn set_volume(&self, db: f64) -> Result<(), EngineError> {
        self.command(json!({ "SetVolume": db })).await
    }

    async fn mute(&self) -> Result<bool, EngineError> {
        let value = self.request(json!("GetMute")).await?;
        value
            .as_bool()
            .ok_or_else(|| EngineError::Protocol("non-boolean mute".into()))
    }

    async fn set_mute(&self, mute: bool) -> Result<(), EngineError> {
        self.command(json!({ "SetMute": mute })).await
    }

    async fn config_path(&self) -> Result<String, EngineError> {
        let value = self.request(json!("GetConfigFilePath")).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| EngineError::Protocol("no config file path set".into()))
    }

    async fn set_config_path(&self, path: &str) -> Result<(), EngineError> {
        self.command(json!({ "SetConfigFilePath": path })).await
    }

    async fn validate_config(&self, config: &str) -> Result<(), EngineError> {
        self.command(json!({ "ValidateConfig": config })).await
    }

    async fn set_config(&self, config: &str) -> Result<(), EngineError> {
        self.command(json!({ "SetConfig": config })).await
    }

    async fn playback_rms(&self) -> Result<Vec<f64>, EngineError> {
        let value = self.request(json!("GetPlaybackSignalRms")).await?;
        serde_json::from_value(value).map_err(|e| EngineError::Protocol(e.to_string()))
    }

    async fn playback_peak(&self) -> Result<Vec<f64>, EngineError> {
        let value = self.request(json!("GetPlaybackSignalPeak")).await?;
        serde_json::from_value(value).map_err(|e| EngineError::Protocol(e.to_string()))
    }
}

/// Command name of a request (bare string or single-key object)
fn command_name(command: &Value) -> Result<&str, EngineError> {
    match command {
        Value::String(name) => Ok(name),
        Value::Object(map) => map
            .keys()
            .next()
            .map(String::as_str)
            .ok_or_else(|| EngineError::Protocol("empty command object".into())),
        _ => Err(EngineError::Protocol("malformed command".into())),
    }
}

/// Decode a reply frame for `expected`, unwrapping the `result`/`value`
/// envelope
fn parse_reply(expected: &str, text: &str) -> Result<Value, EngineError> {
    let reply: Value =
        serde_json::from_str(text).map_err(|e| EngineError::Protocol(e.to_string()))?;
    let body = reply
        .get(expected)
        .ok_or_else(|| EngineError::Protocol(format!("reply doesn't match '{}'", expected)))?;
    match body.get("result").and_then(Value::as_str) {
        Some("Ok") => Ok(body.get("value").cloned().unwrap_or(Value::Null)),
        Some("Error") => {
            let message = body
                .get("value")
                .and_then(Value::as_str)
                .unwrap_or("unspecified error");
            Err(EngineError::Protocol(message.to_string()))
        },
        _ => Err(EngineError::Protocol("missing result field".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_name() {
        assert_eq!(command_name(&json!("GetVolume")).unwrap(), "GetVolume");
        assert_eq!(
            command_name(&json!({ "SetVolume": -20.0 })).unwrap(),
            "SetVolume"
        );
        assert!(command_name(&json!(42)).is_err());
    }

    #[test]
    fn test_parse_reply_ok() {
        let value = parse_reply(
            "GetVolume",
            r#"{"GetVolume": {"result": "Ok", "value": -23.5}}"#,
        )
        .unwrap();
        assert_eq!(value.as_f64(), Some(-23.5));
    }

    #[test]
    fn test_parse_reply_ok_without_value() {
        let value = parse_reply("SetVolume", r#"{"SetVolume": {"result": "Ok"}}"#).unwrap();
        assert!(value.is_null());
    }

    #[test]
    fn test_parse_reply_engine_error() {
        let err = parse_reply(
            "SetConfig",
            r#"{"SetConfig": {"result": "Error", "value": "invalid config"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Protocol(m) if m == "invalid config"));
    }

    #[test]
    fn test_parse_reply_mismatched_command() {
        let err = parse_reply("GetMute", r#"{"GetVolume": {"result": "Ok"}}"#).unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[test]
    fn test_processing_state_decode() {
        let state: ProcessingState = serde_json::from_value(json!("Running")).unwrap();
        assert_eq!(state, ProcessingState::Running);
        let state: ProcessingState = serde_json::from_value(json!("Inactive")).unwrap();
        assert_eq!(state, ProcessingState::Inactive);
    }
}
