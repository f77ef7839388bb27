//! Per-channel dispatcher states for the isolation protocol
//!
//! A fresh channel starts in [InitialDispatch] and accepts exactly one
//! spool or spawn request. The long-running work happens in a spawned
//! task so the connection's read loop stays responsive; the channel
//! itself transitions into a watch state that only accepts the matching
//! cancel or kill message.

use crate::{
    backend::ProcessOutput,
    engine::{Engine, ProcessHandle, SpawnConfig},
    errors::{DispatchError, EngineError},
    protocol::{reply, request, Message},
    registry::Profile,
    session::{ChannelContext, Dispatcher, DispatcherFactory, Downstream},
};
use async_trait::async_trait;
use rmpv::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Initial state of every freshly opened channel.
pub struct InitialDispatch {
    ctx: ChannelContext,
    engine: Arc<Engine>,
}

impl InitialDispatch {
    pub fn new(ctx: ChannelContext, engine: Arc<Engine>) -> Self {
        InitialDispatch { ctx, engine }
    }

    /// Dispatcher factory for [crate::session::ConnectionSession], binding
    /// every new channel to `engine`.
    pub fn factory(engine: Arc<Engine>) -> DispatcherFactory {
        Arc::new(move |ctx| Box::new(InitialDispatch::new(ctx, engine.clone())))
    }

    fn on_spool(self, message: &Message) -> Result<Option<Box<dyn Dispatcher>>, DispatchError> {
        let profile = decode_profile(arg(&message.args, 0)?)?;
        let name = str_arg(&message.args, 1)?;
        log::info!("[{}] spooling {}", self.ctx.id, name);

        let token = self.ctx.token.child_token();
        let watch = SpoolWatch {
            id: self.ctx.id.clone(),
            token: token.clone(),
        };

        let engine = self.engine;
        let downstream = self.ctx.downstream.clone();
        let id = self.ctx.id;
        tokio::spawn(async move {
            let result = engine.spool(&token, &name, &profile).await;
            let sent = match result {
                Ok(()) => downstream.reply(reply::SPOOL_OK, Vec::new()).await,
                Err(err) => {
                    log::error!("[{}] unable to spool {}: {}", id, name, err);
                    downstream.reply(reply::SPOOL_ERROR, error_args(&err)).await
                }
            };
            if let Err(err) = sent {
                log::error!("[{}] unable to send a spool reply: {}", id, err);
            }
        });

        Ok(Some(Box::new(watch)))
    }

    fn on_spawn(self, message: &Message) -> Result<Option<Box<dyn Dispatcher>>, DispatchError> {
        let profile = decode_profile(arg(&message.args, 0)?)?;
        let name = str_arg(&message.args, 1)?;
        let executable = str_arg(&message.args, 2)?;
        let args = map_arg(&message.args, 3)?;
        let env = map_arg(&message.args, 4)?;
        log::info!("[{}] spawning {} ({})", self.ctx.id, name, executable);

        let config = SpawnConfig {
            name,
            executable,
            args,
            env,
            profile,
        };
        let token = self.ctx.token.child_token();
        let process = Arc::new(tokio::sync::Mutex::new(None));
        let watch = SpawnWatch {
            id: self.ctx.id.clone(),
            engine: self.engine.clone(),
            token: token.clone(),
            process: process.clone(),
        };

        let (output, sink) = mpsc::unbounded_channel();
        tokio::spawn(pump_output(self.ctx.downstream.clone(), self.ctx.id.clone(), sink));

        let engine = self.engine;
        let downstream = self.ctx.downstream;
        let id = self.ctx.id;
        tokio::spawn(async move {
            // hold our copy of the sink until the outcome is recorded, so
            // the close notice never overtakes the error reply
            match engine.spawn(&token, config, output.clone()).await {
                Ok(handle) => {
                    *process.lock().await = Some(handle);
                }
                Err(err) => {
                    log::error!("[{}] unable to spawn a container: {}", id, err);
                    let sent = downstream.reply(reply::SPAWN_ERROR, error_args(&err)).await;
                    if let Err(err) = sent {
                        log::error!("[{}] unable to send a spawn reply: {}", id, err);
                    }
                }
            }
            drop(output);
        });

        Ok(Some(Box::new(watch)))
    }
}

#[async_trait]
impl Dispatcher for InitialDispatch {
    async fn handle(
        self: Box<Self>,
        message: &Message,
    ) -> Result<Option<Box<dyn Dispatcher>>, DispatchError> {
        match message.kind {
            request::SPOOL => self.on_spool(message),
            request::SPAWN => self.on_spawn(message),
            kind => Err(DispatchError::UnknownTransition {
                state: "initial",
                kind,
            }),
        }
    }
}

/// Forward process output to the channel until the engine drops the
/// sender, then announce the channel closed. An empty chunk is the
/// "process started" notice.
async fn pump_output(
    downstream: Downstream,
    id: String,
    mut sink: mpsc::UnboundedReceiver<ProcessOutput>,
) {
    while let Some(output) = sink.recv().await {
        let chunk = match output {
            ProcessOutput::Started => Vec::new(),
            ProcessOutput::Data(data) => data,
        };
        if let Err(err) = downstream
            .reply(reply::SPAWN_WRITE, vec![Value::Binary(chunk)])
            .await
        {
            log::error!("[{}] unable to forward process output: {}", id, err);
            return;
        }
    }
    if let Err(err) = downstream.reply(reply::SPAWN_CLOSE, Vec::new()).await {
        log::error!("[{}] unable to close the output stream: {}", id, err);
    }
}

/// A spool is in flight; the only accepted message cancels it.
struct SpoolWatch {
    id: String,
    token: CancellationToken,
}

#[async_trait]
impl Dispatcher for SpoolWatch {
    async fn handle(
        self: Box<Self>,
        message: &Message,
    ) -> Result<Option<Box<dyn Dispatcher>>, DispatchError> {
        match message.kind {
            request::SPOOL_CANCEL => {
                log::info!("[{}] spool has been cancelled", self.id);
                self.token.cancel();
                Ok(None)
            }
            kind => Err(DispatchError::UnknownTransition {
                state: "spool watch",
                kind,
            }),
        }
    }
}

/// A process is being spawned or running; the only accepted message
/// kills it.
struct SpawnWatch {
    id: String,
    engine: Arc<Engine>,
    token: CancellationToken,
    process: Arc<tokio::sync::Mutex<Option<ProcessHandle>>>,
}

#[async_trait]
impl Dispatcher for SpawnWatch {
    async fn handle(
        self: Box<Self>,
        message: &Message,
    ) -> Result<Option<Box<dyn Dispatcher>>, DispatchError> {
        match message.kind {
            request::SPAWN_KILL => {
                // stop a spawn still waiting for a permit, then kill
                // whatever already made it into the container table
                self.token.cancel();
                let handle = self.process.lock().await.take();
                if let Some(handle) = handle {
                    log::info!("[{}] killing container {}", self.id, handle.id);
                    self.engine.terminate(&handle.id).await?;
                }
                Ok(None)
            }
            kind => Err(DispatchError::UnknownTransition {
                state: "spawn watch",
                kind,
            }),
        }
    }
}

fn arg(args: &[Value], index: usize) -> Result<&Value, DispatchError> {
    args.get(index)
        .ok_or_else(|| DispatchError::BadArguments(format!("argument {} is missing", index)))
}

fn str_arg(args: &[Value], index: usize) -> Result<String, DispatchError> {
    match arg(args, index)? {
        Value::String(text) => text
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DispatchError::BadArguments(format!("argument {} is not utf-8", index))),
        other => Err(DispatchError::BadArguments(format!(
            "argument {} must be a string, found {}",
            index, other
        ))),
    }
}

/// Decode a string-to-string map argument. Nil stands for an empty map.
fn map_arg(args: &[Value], index: usize) -> Result<HashMap<String, String>, DispatchError> {
    match arg(args, index)? {
        Value::Nil => Ok(HashMap::new()),
        Value::Map(pairs) => {
            let mut map = HashMap::with_capacity(pairs.len());
            for (key, value) in pairs {
                match (key.as_str(), value.as_str()) {
                    (Some(key), Some(value)) => {
                        map.insert(key.to_string(), value.to_string());
                    }
                    _ => {
                        return Err(DispatchError::BadArguments(format!(
                            "argument {} must map strings to strings",
                            index
                        )))
                    }
                }
            }
            Ok(map)
        }
        other => Err(DispatchError::BadArguments(format!(
            "argument {} must be a map, found {}",
            index, other
        ))),
    }
}

/// Decode the per-request profile. Unknown keys are ignored and missing
/// keys default to empty strings; the engine validates the result.
fn decode_profile(value: &Value) -> Result<Profile, DispatchError> {
    let mut profile = Profile::default();
    match value {
        Value::Nil => Ok(profile),
        Value::Map(pairs) => {
            for (key, value) in pairs {
                let text = value.as_str().unwrap_or_default().to_string();
                match key.as_str() {
                    Some("registry") => profile.registry = text,
                    Some("repository") => profile.repository = text,
                    _ => {}
                }
            }
            Ok(profile)
        }
        other => Err(DispatchError::BadArguments(format!(
            "profile must be a map, found {}",
            other
        ))),
    }
}

/// Error replies carry a numeric category and the human-readable cause.
fn error_args(err: &EngineError) -> Vec<Value> {
    vec![Value::from(error_code(err)), Value::from(err.to_string())]
}

fn error_code(err: &EngineError) -> u64 {
    match err {
        EngineError::QueueFull | EngineError::SpawnCancelled | EngineError::Cancelled => 1,
        EngineError::InvalidProfile(_) | EngineError::Config(_) => 2,
        EngineError::Registry(_) => 3,
        EngineError::Backend(_) => 4,
        _ => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_decodes_from_a_map() {
        let value = Value::Map(vec![
            (Value::from("registry"), Value::from("registry.test")),
            (Value::from("repository"), Value::from("apps")),
            (Value::from("ignored"), Value::from("x")),
        ]);
        let profile = decode_profile(&value).unwrap();
        assert_eq!(profile.registry, "registry.test");
        assert_eq!(profile.repository, "apps");
    }

    #[test]
    fn nil_profile_is_empty() {
        let profile = decode_profile(&Value::Nil).unwrap();
        assert_eq!(profile, Profile::default());
    }

    #[test]
    fn map_arg_accepts_nil_and_maps() {
        let args = vec![
            Value::Nil,
            Value::Map(vec![(Value::from("k"), Value::from("v"))]),
            Value::from(42),
        ];
        assert!(map_arg(&args, 0).unwrap().is_empty());
        assert_eq!(map_arg(&args, 1).unwrap()["k"], "v");
        assert!(map_arg(&args, 2).is_err());
    }

    #[test]
    fn str_arg_rejects_non_strings() {
        let args = vec![Value::from("echo"), Value::from(7)];
        assert_eq!(str_arg(&args, 0).unwrap(), "echo");
        assert!(str_arg(&args, 1).is_err());
        assert!(str_arg(&args, 2).is_err());
    }
}
