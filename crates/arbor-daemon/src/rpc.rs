//! RPC frontend: newline-delimited JSON over the unix socket.
//!
//! Each request is one object `{"op": ..., ...}`; each reply carries the
//! error kind (always `Success` on the happy path) plus an op-specific
//! value. Client credentials come from `SO_PEERCRED`.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use arbor_common::{Error, ErrorKind, Result};
use arbor_runtime::{lifecycle, ClientContext, Runtime};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use serde_json::{json, Value};

/// Binds the socket and serves clients until the listener fails.
pub fn serve(rt: &Arc<Runtime>) -> anyhow::Result<()> {
    let path = &rt.config.socket_path;
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
    match nix::unistd::Group::from_name(arbor_common::constants::SOCKET_GROUP) {
        Ok(Some(group)) => {
            if let Err(e) = nix::unistd::chown(path, None, Some(group.gid)) {
                tracing::warn!(error = %e, "cannot set socket group");
            }
        }
        _ => tracing::debug!(
            group = arbor_common::constants::SOCKET_GROUP,
            "socket group not present, keeping default ownership"
        ),
    }

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let rt = Arc::clone(rt);
                std::thread::spawn(move || {
                    if let Err(e) = serve_client(&rt, stream) {
                        tracing::debug!(error = %e, "client connection closed");
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }
    Ok(())
}

fn client_context(stream: &UnixStream) -> ClientContext {
    match getsockopt(stream, PeerCredentials) {
        Ok(creds) => ClientContext {
            uid: creds.uid(),
            gid: creds.gid(),
            superuser: creds.uid() == 0,
        },
        Err(e) => {
            tracing::warn!(error = %e, "cannot read peer credentials, treating as nobody");
            ClientContext {
                uid: u32::MAX,
                gid: u32::MAX,
                superuser: false,
            }
        }
    }
}

fn serve_client(rt: &Arc<Runtime>, stream: UnixStream) -> std::io::Result<()> {
    let client = client_context(&stream);
    let reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Value>(&line) {
            Ok(request) => match handle(rt, &client, &request) {
                Ok(value) => json!({ "error": ErrorKind::Success.as_str(), "value": value }),
                Err(e) => json!({
                    "error": e.kind.as_str(),
                    "errno": e.errno,
                    "text": e.text,
                }),
            },
            Err(e) => json!({
                "error": ErrorKind::InvalidValue.as_str(),
                "text": format!("malformed request: {e}"),
            }),
        };
        writer.write_all(reply.to_string().as_bytes())?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

fn str_field<'a>(request: &'a Value, key: &str) -> Result<&'a str> {
    request[key].as_str().ok_or_else(|| {
        Error::new(ErrorKind::InvalidValue, format!("missing field: {key}"))
    })
}

fn handle(rt: &Arc<Runtime>, client: &ClientContext, request: &Value) -> Result<Value> {
    let op = str_field(request, "op")?;
    tracing::debug!(op, uid = client.uid, "request");

    match op {
        "create" => {
            let name = str_field(request, "name")?;
            lifecycle::create(rt, client, name)?;
            Ok(Value::Null)
        }
        "destroy" => {
            let ct = rt.find(str_field(request, "name")?)?;
            lifecycle::destroy(rt, &ct)?;
            Ok(Value::Null)
        }
        "start" => {
            let ct = rt.find(str_field(request, "name")?)?;
            lifecycle::start(rt, &ct, client)?;
            Ok(Value::Null)
        }
        "stop" => {
            let ct = rt.find(str_field(request, "name")?)?;
            let timeout = request["timeout_ms"]
                .as_u64()
                .unwrap_or(rt.config.stop_timeout_ms);
            lifecycle::stop(rt, &ct, timeout)?;
            Ok(Value::Null)
        }
        "pause" => {
            let ct = rt.find(str_field(request, "name")?)?;
            lifecycle::pause(rt, &ct)?;
            Ok(Value::Null)
        }
        "resume" => {
            let ct = rt.find(str_field(request, "name")?)?;
            lifecycle::resume(rt, &ct)?;
            Ok(Value::Null)
        }
        "kill" => {
            let ct = rt.find(str_field(request, "name")?)?;
            let signal = request["signal"].as_i64().unwrap_or(libc::SIGTERM.into()) as i32;
            lifecycle::kill(rt, &ct, signal)?;
            Ok(Value::Null)
        }
        "set" => {
            let ct = rt.find(str_field(request, "name")?)?;
            lifecycle::set_property(
                rt,
                client,
                &ct,
                str_field(request, "property")?,
                str_field(request, "value")?,
            )?;
            Ok(Value::Null)
        }
        "get" => {
            let ct = rt.find(str_field(request, "name")?)?;
            let value = lifecycle::get_property(rt, &ct, str_field(request, "property")?)?;
            Ok(Value::String(value))
        }
        "list" => {
            let registry = rt.registry();
            let mut names: Vec<String> = registry.containers.keys().cloned().collect();
            drop(registry);
            names.sort();
            let list: Vec<Value> = names
                .into_iter()
                .filter_map(|name| rt.find(&name).ok())
                .map(|ct| json!({ "name": ct.name, "state": ct.state().to_string() }))
                .collect();
            Ok(Value::Array(list))
        }
        "wait" => {
            let targets: Vec<String> = request["targets"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            if targets.is_empty() {
                return Err(Error::new(ErrorKind::InvalidValue, "wait without targets"));
            }
            let timeout = request["timeout_ms"].as_u64();
            let waiter = lifecycle::setup_wait(rt, &targets, timeout);
            match waiter.wait(timeout.map(std::time::Duration::from_millis)) {
                Some(name) => Ok(Value::String(name)),
                None => Ok(Value::String(String::new())),
            }
        }
        "status" => Ok(json!({
            "containers_created": rt.stats.containers_created.load(std::sync::atomic::Ordering::Relaxed),
            "containers_started": rt.stats.containers_started.load(std::sync::atomic::Ordering::Relaxed),
            "containers_failed_start": rt.stats.containers_failed_start.load(std::sync::atomic::Ordering::Relaxed),
            "containers_oom": rt.stats.containers_oom.load(std::sync::atomic::Ordering::Relaxed),
            "removed_dead": rt.stats.removed_dead.load(std::sync::atomic::Ordering::Relaxed),
        })),
        other => Err(Error::new(
            ErrorKind::InvalidValue,
            format!("unknown operation: {other}"),
        )),
    }
}
