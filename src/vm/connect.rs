//! SSH reachability and the ssh/scp invocations built on top of it.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use super::error::{Result, VmError};
use super::instance::SshEndpoint;
use super::process::{invoke, CommandRunner, ToolOutput};
use crate::argv;

const SSH: &str = "ssh";
const SCP: &str = "scp";

/// What a single readiness probe observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The peer sent an SSH identification string.
    Ready { banner: String },
    /// The TCP connection was actively rejected.
    Refused,
    /// Connected, but the peer closed or stayed silent.
    Silent,
    /// Connected, and the peer spoke something other than SSH.
    NotSsh,
    /// No route, no answer, or no address known yet.
    Unreachable(String),
}

impl ProbeOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProbeOutcome::Ready { .. })
    }
}

#[derive(Clone)]
pub struct ConnectivityProber {
    runner: Arc<dyn CommandRunner>,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub command_timeout: Duration,
}

impl ConnectivityProber {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            probe_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(3),
            command_timeout: Duration::from_secs(600),
        }
    }

    /// TCP connect plus banner read. Never authenticates.
    pub async fn probe(&self, endpoint: &SshEndpoint) -> ProbeOutcome {
        probe_banner(endpoint, self.probe_timeout).await
    }

    /// Poll until `resolve` yields an endpoint whose probe is ready.
    ///
    /// The deadline is checked on every iteration. Endpoint resolution
    /// failures count as "not up yet". On expiry the result is
    /// `ConnectionRefused` when the last probe was actively rejected and
    /// `Timeout` otherwise.
    pub async fn wait_ready<F, Fut>(&self, vm: &str, budget: Duration, mut resolve: F) -> Result<SshEndpoint>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<SshEndpoint>>,
    {
        let deadline = Instant::now() + budget;
        let mut last: Option<(SshEndpoint, ProbeOutcome)> = None;
        info!("waiting up to {}s for ssh on {}", budget.as_secs(), vm);

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;

            match timeout(remaining, resolve()).await {
                Ok(Ok(endpoint)) => {
                    let outcome = probe_banner(&endpoint, self.probe_timeout.min(remaining)).await;
                    debug!("ssh probe {} -> {:?}", endpoint, outcome);
                    if outcome.is_ready() {
                        info!("ssh is ready on {} ({})", vm, endpoint);
                        return Ok(endpoint);
                    }
                    last = Some((endpoint, outcome));
                }
                Ok(Err(e)) => debug!("no ssh endpoint for {} yet: {}", vm, e),
                Err(_) => break,
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.probe_interval.min(deadline - now)).await;
        }

        match last {
            Some((endpoint, ProbeOutcome::Refused)) => Err(VmError::ConnectionRefused {
                endpoint: endpoint.to_string(),
            }),
            _ => Err(VmError::Timeout {
                what: format!("ssh on '{vm}'"),
                after: budget,
            }),
        }
    }

    /// Run `command` on the guest without a terminal.
    pub async fn run_command(&self, endpoint: &SshEndpoint, user: &str, command: &str) -> Result<ToolOutput> {
        let mut args = ssh_args(endpoint, user, true);
        args.push(command.to_string());
        let out = invoke(self.runner.as_ref(), SSH, SSH, &args, self.command_timeout).await?;
        classify(endpoint, out)
    }

    /// Attach the caller's terminal to a login shell on the guest.
    pub async fn interactive(&self, endpoint: &SshEndpoint, user: &str) -> Result<Option<i32>> {
        let args = ssh_args(endpoint, user, false);
        match self.runner.run_interactive(SSH, &args).await {
            Ok(code) => Ok(code),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VmError::unavailable(SSH, "ssh is not installed"))
            }
            Err(e) => Err(VmError::failed(SSH, "ssh", None, e.to_string())),
        }
    }

    /// `scp` between the host and the guest. `from_vm` reads `src` on the guest.
    pub async fn copy(&self, endpoint: &SshEndpoint, user: &str, src: &str, dst: &str, from_vm: bool) -> Result<()> {
        let remote = |path: &str| format!("{user}@{}:{path}", endpoint.host);
        let (from, to) = if from_vm {
            (remote(src), dst.to_string())
        } else {
            (src.to_string(), remote(dst))
        };

        let mut args = argv!["-P", endpoint.port, "-r"];
        args.extend(common_options(endpoint.identity.as_deref(), true));
        args.extend([from, to]);
        let out = invoke(self.runner.as_ref(), SCP, SCP, &args, self.command_timeout).await?;
        let out = classify(endpoint, out)?;
        if out.success() {
            Ok(())
        } else {
            Err(VmError::failed(SCP, "scp", out.exit_code, out.diagnostic()))
        }
    }
}

async fn probe_banner(endpoint: &SshEndpoint, budget: Duration) -> ProbeOutcome {
    let addr = (endpoint.host.as_str(), endpoint.port);
    let mut stream = match timeout(budget, TcpStream::connect(addr)).await {
        Err(_) => return ProbeOutcome::Unreachable("connect timed out".to_string()),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => return ProbeOutcome::Refused,
        Ok(Err(e)) => return ProbeOutcome::Unreachable(e.to_string()),
        Ok(Ok(stream)) => stream,
    };

    let mut buf = [0u8; 256];
    match timeout(budget, stream.read(&mut buf)).await {
        Ok(Ok(0)) | Err(_) => ProbeOutcome::Silent,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => ProbeOutcome::Silent,
        Ok(Err(e)) => ProbeOutcome::Unreachable(e.to_string()),
        Ok(Ok(n)) => {
            let text = String::from_utf8_lossy(&buf[..n]);
            match text.lines().next() {
                Some(line) if line.starts_with("SSH-") => ProbeOutcome::Ready {
                    banner: line.trim().to_string(),
                },
                _ => ProbeOutcome::NotSsh,
            }
        }
    }
}

fn common_options(identity: Option<&Path>, batch: bool) -> Vec<String> {
    let mut args = argv![
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "LogLevel=ERROR",
        "-o",
        "ConnectTimeout=10",
    ];
    if batch {
        args.extend(argv!["-o", "BatchMode=yes"]);
    }
    if let Some(key) = identity {
        args.extend(argv!["-i", key.display()]);
    }
    args
}

fn ssh_args(endpoint: &SshEndpoint, user: &str, batch: bool) -> Vec<String> {
    let mut args = argv!["-p", endpoint.port];
    args.extend(common_options(endpoint.identity.as_deref(), batch));
    args.push(format!("{user}@{}", endpoint.host));
    args
}

/// ssh and scp exit 255 for their own failures; anything else is the
/// remote command's status.
fn classify(endpoint: &SshEndpoint, out: ToolOutput) -> Result<ToolOutput> {
    if out.exit_code != Some(255) {
        return Ok(out);
    }
    let stderr = out.stderr.as_str();
    if stderr.contains("Permission denied") || stderr.contains("Too many authentication failures") {
        Err(VmError::AuthFailed {
            endpoint: endpoint.to_string(),
            detail: stderr.trim().to_string(),
        })
    } else if stderr.contains("Connection refused") {
        Err(VmError::ConnectionRefused {
            endpoint: endpoint.to_string(),
        })
    } else {
        Err(VmError::failed(SSH, "ssh", out.exit_code, out.diagnostic()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::error::ErrorKind;
    use crate::vm::process::testing::ScriptedRunner;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn prober() -> ConnectivityProber {
        let mut p = ConnectivityProber::new(Arc::new(ScriptedRunner::new(&[SSH, SCP])));
        p.probe_interval = Duration::from_millis(50);
        p.probe_timeout = Duration::from_millis(500);
        p
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn banner_means_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let _ = sock.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        });

        let outcome = prober().probe(&SshEndpoint::new("127.0.0.1", port)).await;
        assert_eq!(
            outcome,
            ProbeOutcome::Ready {
                banner: "SSH-2.0-OpenSSH_9.6".to_string()
            }
        );
    }

    #[tokio::test]
    async fn other_protocols_are_not_ssh() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let _ = sock.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            }
        });
        let outcome = prober().probe(&SshEndpoint::new("127.0.0.1", port)).await;
        assert_eq!(outcome, ProbeOutcome::NotSsh);
    }

    #[tokio::test]
    async fn refused_port_is_reported_distinctly_from_timeout() {
        let port = closed_port().await;
        let endpoint = SshEndpoint::new("127.0.0.1", port);
        let p = prober();
        assert_eq!(p.probe(&endpoint).await, ProbeOutcome::Refused);

        let err = p
            .wait_ready("web", Duration::from_millis(300), || {
                let e = endpoint.clone();
                async move { Ok(e) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn missing_address_times_out_within_budget() {
        let started = Instant::now();
        let err = prober()
            .wait_ready("web", Duration::from_millis(300), || async {
                Err(VmError::PreconditionFailed("no address yet".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn ssh_failures_are_classified() {
        let ep = SshEndpoint::new("10.0.0.5", 22);
        let auth = classify(&ep, ToolOutput::err(255, "user@10.0.0.5: Permission denied (publickey)."));
        assert_eq!(auth.unwrap_err().kind(), ErrorKind::AuthFailed);

        let refused = classify(&ep, ToolOutput::err(255, "ssh: connect to host 10.0.0.5 port 22: Connection refused"));
        assert_eq!(refused.unwrap_err().kind(), ErrorKind::ConnectionRefused);

        let remote = classify(&ep, ToolOutput::err(3, "grep: no match")).unwrap();
        assert_eq!(remote.exit_code, Some(3));
    }

    #[test]
    fn ssh_argv_targets_forwarded_port() {
        let mut ep = SshEndpoint::new("127.0.0.1", 2222);
        ep.identity = Some("/home/dev/.ssh/id_ed25519".into());
        let args = ssh_args(&ep, "ubuntu", true);
        assert_eq!(&args[..2], &["-p".to_string(), "2222".to_string()]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/home/dev/.ssh/id_ed25519"));
        assert_eq!(args.last().unwrap(), "ubuntu@127.0.0.1");
    }

    #[tokio::test]
    async fn copy_to_guest_uses_scp_upload_order() {
        let runner = ScriptedRunner::new(&[SCP]);
        let p = ConnectivityProber::new(Arc::new(runner.clone()));
        p.copy(&SshEndpoint::new("127.0.0.1", 2222), "dev", "./app.tar", "/tmp/app.tar", false)
            .await
            .unwrap();
        let call = runner.calls().pop().unwrap();
        assert!(call.starts_with("scp -P 2222 -r"));
        assert!(call.ends_with("./app.tar dev@127.0.0.1:/tmp/app.tar"));
    }
}
