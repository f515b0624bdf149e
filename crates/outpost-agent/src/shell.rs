//! Shell exec sessions
//!
//! One command per dedicated transport. Output goes back as tagged frames,
//! the operator can feed stdin, close it and deliver signals, and the session
//! ends with the exit code.

use std::process::Stdio;

use outpost_proto::shell::{self, input, Signal, UNKNOWN_EXIT_CODE};
use outpost_proto::{AgentNotify, Frame, READ_CHUNK_SIZE};
use outpost_transport::{FrameSender, Transport};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

/// Run `task.cmd` under `sh -c` and stream it over `transport`
pub async fn run(transport: Transport, task: AgentNotify) {
    let (sender, mut receiver) = transport.split();

    let spawned = Command::new("sh")
        .arg("-c")
        .arg(&task.cmd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            warn!("Failed to start command {:?}: {}", task.cmd, e);
            report(&sender, format!("failed to start command: {}", e)).await;
            let _ = sender.send(shell::exit(UNKNOWN_EXIT_CODE)).await;
            sender.close();
            return;
        }
    };
    info!("Started command {:?} (pid {:?})", task.cmd, child.id());

    let mut stdin = child.stdin.take().filter(|_| task.has_stdin);
    let stdout = child.stdout.take().map(|out| {
        tokio::spawn(pump_output(out, sender.clone(), shell::stdout, task.need_stdout))
    });
    let stderr = child.stderr.take().map(|err| {
        tokio::spawn(pump_output(err, sender.clone(), shell::stderr, task.need_stderr))
    });

    let mut input_open = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            frame = receiver.recv(), if input_open => match frame {
                Some(frame) => handle_input(&sender, &mut child, &mut stdin, frame).await,
                None => {
                    // Nobody is left to read the output
                    input_open = false;
                    debug!("Exec transport closed, killing command");
                    let _ = child.start_kill();
                }
            },
        }
    };

    let code = match status {
        Ok(status) => status.code().unwrap_or(UNKNOWN_EXIT_CODE),
        Err(e) => {
            report(&sender, format!("failed to wait command: {}", e)).await;
            UNKNOWN_EXIT_CODE
        }
    };

    for pump in [stdout, stderr].into_iter().flatten() {
        let _ = pump.await;
    }

    info!("Command {:?} exited with code {}", task.cmd, code);
    let _ = sender.send(shell::exit(code)).await;
    sender.close();
}

async fn handle_input(
    sender: &FrameSender,
    child: &mut Child,
    stdin: &mut Option<ChildStdin>,
    frame: Frame,
) {
    match frame.opcode {
        input::STDIN => {
            let Some(pipe) = stdin.as_mut() else {
                return;
            };
            if let Err(e) = pipe.write_all(&frame.payload).await {
                report(sender, format!("failed to write stdin: {}", e)).await;
            }
        }
        input::CLOSE_STDIN => {
            if let Some(mut pipe) = stdin.take() {
                if let Err(e) = pipe.shutdown().await {
                    report(sender, format!("failed to close stdin: {}", e)).await;
                }
            }
        }
        input::SIGNAL => {
            let signal = match shell::parse_signal(&frame) {
                Ok(raw) => Signal::try_from(raw),
                Err(e) => return report(sender, format!("bad signal frame: {}", e)).await,
            };
            match signal {
                Ok(signal) => {
                    if let Err(e) = send_signal(child, signal) {
                        report(sender, format!("failed to send signal: {}", e)).await;
                    }
                }
                Err(raw) => report(sender, format!("unknown signal: {}", raw)).await,
            }
        }
        other => debug!("Ignoring exec input 0x{:02x}", other),
    }
}

async fn pump_output<R>(
    mut reader: R,
    sender: FrameSender,
    wrap: fn(&[u8]) -> Frame,
    enabled: bool,
) where
    R: AsyncRead + Unpin,
{
    let mut forward = enabled;
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                // Keep draining after the peer is gone so the child never blocks
                if forward && sender.send(wrap(&buf[..n])).await.is_err() {
                    forward = false;
                }
            }
        }
    }
}

async fn report(sender: &FrameSender, message: String) {
    debug!("shell: {}", message);
    let _ = sender.send(shell::debug(message)).await;
}

#[cfg(unix)]
fn send_signal(child: &mut Child, signal: Signal) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid;

    let pid = child
        .id()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "process exited"))?;
    let signal = match signal {
        Signal::Interrupt => NixSignal::SIGINT,
        Signal::Kill => NixSignal::SIGKILL,
        Signal::User1 => NixSignal::SIGUSR1,
        Signal::User2 => NixSignal::SIGUSR2,
    };
    kill(Pid::from_raw(pid as i32), signal).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn send_signal(child: &mut Child, signal: Signal) -> std::io::Result<()> {
    match signal {
        Signal::Kill | Signal::Interrupt => child.start_kill(),
        other => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("{:?} is not supported on this platform", other),
        )),
    }
}
