//! Engine process launch: port preflight, argv construction, and the
//! ServiceProcess handle wrapping the running child.
//!
//! Secrets (hub token, API key) travel to the child via environment only so
//! they never show up in process listings.

use crate::config::LaunchConfiguration;
use crate::error::Error;
use gpu_inventory::Reservation;
use std::collections::VecDeque;
use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Reference primary inference/API port.
pub const SERVICE_PORT: u16 = 7860;
/// Reference secondary management/metrics port.
pub const MANAGEMENT_PORT: u16 = 2242;

/// Engine output lines kept for crash diagnostics.
const LOG_TAIL_LINES: usize = 40;

/// The two TCP endpoints the engine must own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    /// Primary inference/API port.
    pub service_port: u16,
    /// Secondary management/metrics port.
    pub management_port: u16,
}

impl Default for Endpoints {
    fn default() -> Self {
        Endpoints {
            service_port: SERVICE_PORT,
            management_port: MANAGEMENT_PORT,
        }
    }
}

/// The engine's program and leading arguments; the supervisor appends the
/// configuration-derived argv after these.
#[derive(Debug, Clone)]
pub struct EngineCommand {
    /// Executable to run.
    pub program: String,
    /// Arguments placed before the generated ones.
    pub args: Vec<String>,
}

/// Verify both endpoints are free before any launch work happens.
///
/// The listeners are dropped immediately; the engine performs the real bind.
pub(crate) fn preflight(endpoints: &Endpoints) -> Result<(), Error> {
    for &port in &[endpoints.service_port, endpoints.management_port] {
        TcpListener::bind(("0.0.0.0", port)).map_err(|_| Error::PortBindingFailed(port))?;
    }
    Ok(())
}

/// Argv derived from the validated configuration. Never contains secrets.
pub fn engine_args(config: &LaunchConfiguration, endpoints: &Endpoints) -> Vec<String> {
    let mut args = vec![
        "--model".to_string(),
        config.model_name.clone(),
        "--revision".to_string(),
        config.revision.clone(),
        "--host".to_string(),
        "0.0.0.0".to_string(),
        "--port".to_string(),
        endpoints.service_port.to_string(),
        "--management-port".to_string(),
        endpoints.management_port.to_string(),
        "--kv-cache-dtype".to_string(),
        config.kv_cache.as_str().to_string(),
        "--gpu-memory-utilization".to_string(),
        config.gpu_memory_utilization.to_string(),
    ];
    if config.gpu_count == 0 {
        args.push("--device".to_string());
        args.push("cpu".to_string());
    } else {
        args.push("--tensor-parallel-size".to_string());
        args.push(config.gpu_count.to_string());
    }
    if config.quantization != crate::config::Quantization::None {
        args.push("--quantization".to_string());
        args.push(config.quantization.as_str().to_string());
    }
    if let Some(len) = config.context_length {
        args.push("--max-model-len".to_string());
        args.push(len.to_string());
    }
    if config.enforce_eager {
        args.push("--enforce-eager".to_string());
    }
    args
}

/// Spawn the engine with the resolved configuration.
///
/// The weight-cache mount path is created first so the child always finds
/// it across restarts; the supervisor never reads its contents.
pub(crate) fn spawn_engine(
    command: &EngineCommand,
    config: &LaunchConfiguration,
    endpoints: &Endpoints,
    reservation: Option<&Reservation>,
    cache_dir: &Path,
) -> Result<ServiceProcess, Error> {
    fs::create_dir_all(cache_dir)?;

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .args(engine_args(config, endpoints))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env("HF_HOME", cache_dir);
    match reservation {
        Some(r) => cmd.env("CUDA_VISIBLE_DEVICES", r.visible_devices()),
        // Empty visibility hides every device in CPU-only mode.
        None => cmd.env("CUDA_VISIBLE_DEVICES", ""),
    };
    if let Some(token) = &config.hub_token {
        cmd.env("HUGGING_FACE_HUB_TOKEN", token);
    }
    if let Some(key) = &config.api_key {
        cmd.env("API_KEY", key);
    }

    let mut child = cmd.spawn()?;
    let log_tail = Arc::new(Mutex::new(VecDeque::with_capacity(LOG_TAIL_LINES)));
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_output(stdout, Arc::clone(&log_tail), false));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(stderr, Arc::clone(&log_tail), true));
    }
    Ok(ServiceProcess { child, log_tail })
}

/// Drain one engine output stream without ever blocking the child on a full
/// pipe, forwarding lines into our own log and the bounded tail buffer.
async fn forward_output<R>(stream: R, tail: Arc<Mutex<VecDeque<String>>>, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            log::warn!(target: "engine", "{}", line);
        } else {
            log::info!(target: "engine", "{}", line);
        }
        let mut tail = tail.lock().unwrap();
        if tail.len() == LOG_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// The supervised engine child process. Owned exclusively by the
/// supervisor; replaced wholesale on restart.
pub struct ServiceProcess {
    child: Child,
    log_tail: Arc<Mutex<VecDeque<String>>>,
}

impl ServiceProcess {
    /// OS pid while the child is alive.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the child to exit.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Snapshot of the recent engine output.
    pub fn log_tail(&self) -> Vec<String> {
        self.log_tail.lock().unwrap().iter().cloned().collect()
    }

    /// Ask the engine to stop, escalating to a hard kill after `grace`.
    pub async fn terminate(mut self, grace: Duration) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }
        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            log::warn!("engine ignored termination for {:?}, killing", grace);
            let _ = self.child.kill().await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{KvCacheMode, Quantization};

    fn config() -> LaunchConfiguration {
        LaunchConfiguration {
            gpu_count: 2,
            model_name: "org/model-7b".to_string(),
            revision: "main".to_string(),
            hub_token: Some("hf_secret".to_string()),
            quantization: Quantization::Awq,
            kv_cache: KvCacheMode::Auto,
            api_key: Some("sk-secret".to_string()),
            context_length: Some(8192),
            gpu_memory_utilization: 0.9,
            enforce_eager: true,
        }
    }

    #[test]
    fn test_engine_args_reflect_configuration() {
        let args = engine_args(&config(), &Endpoints::default());
        let joined = args.join(" ");
        assert!(joined.contains("--model org/model-7b"));
        assert!(joined.contains("--port 7860"));
        assert!(joined.contains("--management-port 2242"));
        assert!(joined.contains("--tensor-parallel-size 2"));
        assert!(joined.contains("--quantization awq"));
        assert!(joined.contains("--max-model-len 8192"));
        assert!(joined.contains("--enforce-eager"));
    }

    #[test]
    fn test_engine_args_never_contain_secrets() {
        let args = engine_args(&config(), &Endpoints::default());
        assert!(args.iter().all(|a| !a.contains("hf_secret")));
        assert!(args.iter().all(|a| !a.contains("sk-secret")));
    }

    #[test]
    fn test_cpu_only_args() {
        let mut config = config();
        config.gpu_count = 0;
        config.quantization = Quantization::None;
        config.context_length = None;
        config.enforce_eager = false;
        let args = engine_args(&config, &Endpoints::default());
        let joined = args.join(" ");
        assert!(joined.contains("--device cpu"));
        assert!(!joined.contains("--tensor-parallel-size"));
        assert!(!joined.contains("--quantization"));
        assert!(!joined.contains("--max-model-len"));
        assert!(!joined.contains("--enforce-eager"));
    }

    #[test]
    fn test_preflight_detects_occupied_port() {
        let holder = TcpListener::bind("0.0.0.0:0").unwrap();
        let taken = holder.local_addr().unwrap().port();
        let endpoints = Endpoints {
            service_port: taken,
            management_port: taken,
        };
        match preflight(&endpoints) {
            Err(Error::PortBindingFailed(port)) => assert_eq!(port, taken),
            other => panic!("expected PortBindingFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_preflight_releases_ports() {
        let a = TcpListener::bind("0.0.0.0:0").unwrap();
        let b = TcpListener::bind("0.0.0.0:0").unwrap();
        let endpoints = Endpoints {
            service_port: a.local_addr().unwrap().port(),
            management_port: b.local_addr().unwrap().port(),
        };
        drop(a);
        drop(b);
        preflight(&endpoints).unwrap();
        // Ports must be usable again after the preflight probe.
        TcpListener::bind(("0.0.0.0", endpoints.service_port)).unwrap();
    }
}
