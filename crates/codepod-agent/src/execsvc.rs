//! gRPC exec service
//!
//! Token-authenticated command execution API on `AGENT_GRPC_PORT`. Commands
//! run through the process manager and their output is streamed line by
//! line, terminated by an end message carrying the exit code.

use crate::error::{AgentError, Result};
use crate::process::{ProcessManager, StartOptions};
use crate::ssh::auth::verify_token;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

pub mod pb {
    tonic::include_proto!("codepod.exec.v1");
}

use pb::exec_service_server::{ExecService, ExecServiceServer};
use pb::{CommandOutput, ExecuteRequest, OpenSessionRequest, OutputChannel};

/// Fallback wait limit for commands without an explicit timeout
const MAX_COMMAND_RUNTIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Exec service facade bound to one port
pub struct ExecServer {
    port: u32,
    token: String,
    processes: Arc<ProcessManager>,
}

impl ExecServer {
    pub fn new(port: u32, token: String, processes: Arc<ProcessManager>) -> Self {
        Self {
            port,
            token,
            processes,
        }
    }

    /// Spawn the gRPC server; it drains when `shutdown` fires
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.port)
            .parse()
            .map_err(|e| AgentError::Configuration(format!("invalid gRPC port: {}", e)))?;

        let token = self.token.clone();
        let svc = ExecServiceServer::with_interceptor(
            ExecSvc {
                processes: self.processes.clone(),
            },
            move |request: Request<()>| check_token(request, &token),
        );

        tracing::info!(addr = %addr, "exec service listening");

        tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .http2_keepalive_interval(Some(Duration::from_secs(30)))
                .http2_keepalive_timeout(Some(Duration::from_secs(10)))
                .add_service(svc)
                .serve_with_shutdown(addr, async move {
                    let _ = shutdown.changed().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "exec service failed");
            }
        });

        Ok(())
    }
}

/// Validate the `token` metadata entry on every call
fn check_token(request: Request<()>, expected: &str) -> std::result::Result<Request<()>, Status> {
    let presented = request
        .metadata()
        .get("token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Status::unauthenticated("missing token"))?;

    if verify_token(presented.as_bytes(), expected.as_bytes()) {
        Ok(request)
    } else {
        Err(Status::unauthenticated("invalid token"))
    }
}

struct ExecSvc {
    processes: Arc<ProcessManager>,
}

async fn stream_lines<R>(
    reader: R,
    tx: mpsc::Sender<std::result::Result<CommandOutput, Status>>,
    channel: OutputChannel,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let output = CommandOutput {
            line,
            channel: channel as i32,
            end: false,
            exit_code: 0,
        };
        if tx.send(Ok(output)).await.is_err() {
            break;
        }
    }
}

#[tonic::async_trait]
impl ExecService for ExecSvc {
    type ExecuteStream = ReceiverStream<std::result::Result<CommandOutput, Status>>;

    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> std::result::Result<Response<Self::ExecuteStream>, Status> {
        let req = request.into_inner();
        if req.command.is_empty() {
            return Err(Status::invalid_argument("command is required"));
        }

        tracing::info!(command = %req.command, cwd = %req.cwd, "executing command");

        let opts = StartOptions {
            env: req
                .env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
            dir: req.cwd.clone(),
            stdin: None,
            timeout: (req.timeout_ms > 0).then(|| Duration::from_millis(req.timeout_ms as u64)),
        };

        let info = self
            .processes
            .start("sh", &["-c", &req.command], &opts)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        let (stdout, stderr) = self
            .processes
            .take_output(&info.id)
            .await
            .ok_or_else(|| Status::internal("process output unavailable"))?;

        let (tx, rx) = mpsc::channel(64);

        let out_task = tokio::spawn(stream_lines(stdout, tx.clone(), OutputChannel::Stdout));
        let err_task = tokio::spawn(stream_lines(stderr, tx.clone(), OutputChannel::Stderr));

        let processes = self.processes.clone();
        let id = info.id.clone();
        let wait_limit = opts.timeout.unwrap_or(MAX_COMMAND_RUNTIME);
        tokio::spawn(async move {
            // Output first, then the terminal message
            let _ = out_task.await;
            let _ = err_task.await;

            let exit_code = match processes.wait(&id, wait_limit).await {
                Ok(done) => done.exit_code.unwrap_or(0),
                Err(_) => {
                    let _ = processes.kill(&id).await;
                    137
                }
            };

            let _ = tx
                .send(Ok(CommandOutput {
                    line: String::new(),
                    channel: OutputChannel::Stdout as i32,
                    end: true,
                    exit_code,
                }))
                .await;

            tracing::debug!(process = %id, exit_code, "command finished");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type OpenSessionStream = ReceiverStream<std::result::Result<CommandOutput, Status>>;

    async fn open_session(
        &self,
        request: Request<OpenSessionRequest>,
    ) -> std::result::Result<Response<Self::OpenSessionStream>, Status> {
        let req = request.into_inner();
        tracing::info!(sandbox = %req.sandbox_id, "session opened");

        let (tx, rx) = mpsc::channel(4);
        let _ = tx
            .send(Ok(CommandOutput {
                line: "Session opened".to_string(),
                channel: OutputChannel::Stdout as i32,
                end: false,
                exit_code: 0,
            }))
            .await;

        let sandbox_id = req.sandbox_id;
        tokio::spawn(async move {
            // Held open until the client hangs up
            tx.closed().await;
            tracing::info!(sandbox = %sandbox_id, "session closed");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
