//! Dispatch of operator commands to instruments and the scan controller.
//!
//! Every [`Command`] yields exactly one [`Reply`]; failures, including a
//! panicking handler, come back as an `error` reply.

use crate::device::{DeviceError, ErrorKind, Instrument};
use crate::scan_controller::ScanError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Command {
    pub target: String,
    pub verb: String,
    #[serde(default)]
    pub payload: Value,
}

impl Command {
    pub fn new(target: impl Into<String>, verb: impl Into<String>, payload: Value) -> Self {
        Self {
            target: target.into(),
            verb: verb.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Reply {
    pub target: String,
    pub verb: String,
    pub status: ReplyStatus,
    pub payload: Value,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// Taxonomy name of a failed command, e.g. `"UnknownCommand"`.
    pub fn error_kind(&self) -> Option<&str> {
        match self.status {
            ReplyStatus::Ok => None,
            ReplyStatus::Error => self.payload.get("kind").and_then(Value::as_str),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("No command '{verb}' for target '{target}'")]
    UnknownCommand { target: String, verb: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("Handler for '{verb}' on '{target}' panicked")]
    HandlerPanicked { target: String, verb: String },
}

impl CommandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownCommand { .. } => ErrorKind::UnknownCommand,
            Self::InvalidPayload(_) => ErrorKind::InvalidPayload,
            Self::Device(e) => e.kind(),
            Self::Scan(e) => e.kind(),
            Self::HandlerPanicked { .. } => ErrorKind::ProtocolError,
        }
    }
}

/// Extract `key` from an object payload, or take a scalar payload as the
/// value itself.
pub fn arg<T: DeserializeOwned>(payload: &Value, key: &str) -> Result<T, CommandError> {
    let value = match payload {
        Value::Object(map) => map
            .get(key)
            .ok_or_else(|| CommandError::InvalidPayload(format!("missing field '{key}'")))?,
        Value::Null => {
            return Err(CommandError::InvalidPayload(format!(
                "missing field '{key}'"
            )))
        }
        scalar => scalar,
    };
    serde_json::from_value(value.clone())
        .map_err(|e| CommandError::InvalidPayload(format!("field '{key}': {e}")))
}

/// Like [`arg`] but absent fields yield `None`.
pub fn opt_arg<T: DeserializeOwned>(payload: &Value, key: &str) -> Result<Option<T>, CommandError> {
    match payload {
        Value::Null => Ok(None),
        Value::Object(map) if !map.contains_key(key) => Ok(None),
        _ => arg(payload, key).map(Some),
    }
}

pub type Handler = Box<dyn Fn(&Value) -> Result<Value, CommandError> + Send + Sync>;

/// `target → verb → handler`, built once at startup.
#[derive(Default)]
pub struct CommandRouter {
    handlers: BTreeMap<String, BTreeMap<String, Handler>>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, target: &str, verb: &str, handler: F)
    where
        F: Fn(&Value) -> Result<Value, CommandError> + Send + Sync + 'static,
    {
        let replaced = self
            .handlers
            .entry(target.to_string())
            .or_default()
            .insert(verb.to_string(), Box::new(handler));
        if replaced.is_some() {
            log::warn!("Handler for '{verb}' on '{target}' replaced");
        }
    }

    /// Register every verb an instrument declares under its name.
    pub fn register_instrument(&mut self, instrument: Arc<dyn Instrument>) {
        let target = instrument.name().to_string();
        for verb in instrument.verbs() {
            let instrument = instrument.clone();
            self.register(&target, verb, move |payload| {
                instrument.execute(verb, payload)
            });
        }
    }

    /// Drop a target and all of its verbs.
    pub fn remove_target(&mut self, target: &str) -> bool {
        self.handlers.remove(target).is_some()
    }

    pub fn contains(&self, target: &str, verb: &str) -> bool {
        self.handlers
            .get(target)
            .is_some_and(|verbs| verbs.contains_key(verb))
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Registered targets and their verbs.
    pub fn table(&self) -> BTreeMap<String, Vec<String>> {
        self.handlers
            .iter()
            .map(|(target, verbs)| (target.clone(), verbs.keys().cloned().collect()))
            .collect()
    }

    #[tracing::instrument(skip_all, fields(target = %command.target, verb = %command.verb))]
    pub fn dispatch(&self, command: &Command) -> Reply {
        let result = match self
            .handlers
            .get(&command.target)
            .and_then(|verbs| verbs.get(&command.verb))
        {
            None => Err(CommandError::UnknownCommand {
                target: command.target.clone(),
                verb: command.verb.clone(),
            }),
            Some(handler) => panic::catch_unwind(AssertUnwindSafe(|| handler(&command.payload)))
                .unwrap_or_else(|_| {
                    Err(CommandError::HandlerPanicked {
                        target: command.target.clone(),
                        verb: command.verb.clone(),
                    })
                }),
        };

        match result {
            Ok(payload) => {
                log::debug!("{}.{} ok", command.target, command.verb);
                Reply {
                    target: command.target.clone(),
                    verb: command.verb.clone(),
                    status: ReplyStatus::Ok,
                    payload,
                }
            }
            Err(e) => {
                log::error!("{}.{} failed: {e}", command.target, command.verb);
                Reply {
                    target: command.target.clone(),
                    verb: command.verb.clone(),
                    status: ReplyStatus::Error,
                    payload: json!({ "kind": e.kind(), "reason": e.to_string() }),
                }
            }
        }
    }
}
