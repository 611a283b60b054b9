use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use sandbox_control::mapping::rooted;
use sandbox_control::{
    get_config, init_config, LifecycleEvent, NativeEngine, OutputReader, Sandbox, SandboxConfig,
    SandboxError, StdinWriter, Termination,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Child output owns stdout; logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sandbox_control=info".parse()?)
                .add_directive("sandboxctl=info".parse()?),
        )
        .init();

    let mut argv = std::env::args().skip(1);
    let program = argv
        .next()
        .context("usage: sandboxctl <program> [args...]")?;
    let args: Vec<String> = argv.collect();

    let config = match std::env::var("SANDBOX_CONFIG") {
        Ok(path) => {
            info!("Loading sandbox configuration from {}", path);
            SandboxConfig::load(&path)?
        }
        Err(_) => SandboxConfig::from_env(),
    };
    init_config(config)?;
    let config = get_config();
    debug!("Sandbox config: {:?}", config);

    let sandbox = Sandbox::new(NativeEngine::from_config(config));
    if let Ok(root) = std::env::var("SANDBOX_ROOT") {
        info!("Mapping absolute paths under {}", root);
        sandbox.set_filename_mapping(rooted(root));
    }

    let mut lifecycle = sandbox.events().subscribe_lifecycle();
    let stdout_task = tokio::spawn(copy_output(sandbox.stdout().clone(), tokio::io::stdout()));
    let stderr_task = tokio::spawn(copy_output(sandbox.stderr().clone(), tokio::io::stderr()));

    if let Err(e) = sandbox.spawn(program.as_str(), args) {
        error!("{}", e);
        std::process::exit(Termination::SpawnFailed.exit_code());
    }
    tokio::spawn(forward_stdin(sandbox.stdin().clone()));

    let wait = sandbox.wait();
    tokio::pin!(wait);
    let termination = loop {
        tokio::select! {
            Some(event) = lifecycle.recv() => log_event(&event),
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, killing sandboxed program");
                sandbox.kill()?;
            }
            termination = &mut wait => break termination,
        }
    };
    while let Ok(event) = lifecycle.try_recv() {
        log_event(&event);
    }

    stdout_task.await?.context("Failed to write child stdout")?;
    stderr_task.await?.context("Failed to write child stderr")?;

    info!("Sandboxed program finished: {:?}", termination);
    std::process::exit(termination.exit_code());
}

fn log_event(event: &LifecycleEvent) {
    match serde_json::to_string(event) {
        Ok(line) => info!(target: "sandboxctl::events", "{}", line),
        Err(e) => warn!("Failed to serialize {:?}: {}", event, e),
    }
}

async fn copy_output<W>(reader: OutputReader, mut out: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = reader.read().await {
        out.write_all(&chunk).await?;
        out.flush().await?;
    }
    Ok(())
}

async fn forward_stdin(writer: StdinWriter) {
    let mut input = tokio::io::stdin();
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        match input.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => match writer.write(buf[..n].to_vec()) {
                Ok(_) => {}
                Err(SandboxError::ClosedChannel) => return,
                Err(e) => {
                    warn!("Dropping host stdin: {}", e);
                    return;
                }
            },
            Err(e) => {
                warn!("Failed to read host stdin: {}", e);
                break;
            }
        }
    }
    if let Err(e) = writer.end() {
        debug!("Failed to close child stdin: {}", e);
    }
}
