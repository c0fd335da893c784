use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use htmlbridge::interop::{ExecuteOptions, FetcherKind};
use htmlbridge::js::QuickJsHandler;
use htmlbridge::{BridgeConfig, Interop, ScriptValue};
use tracing_subscriber::EnvFilter;
use url::Url;

const USAGE: &str = "usage: htmlbridge [--preload <file.js>]... <script.js>";

struct Args {
    script: PathBuf,
    preload: Vec<String>,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut script = None;
        let mut preload = Vec::new();
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--preload" => {
                    let path = args.next().ok_or_else(|| anyhow!("--preload needs a file\n{USAGE}"))?;
                    preload.push(path);
                }
                "-h" | "--help" => bail!(USAGE),
                _ if script.is_none() => script = Some(PathBuf::from(&arg)),
                _ => bail!("unexpected argument {arg}\n{USAGE}"),
            }
        }
        let script = script.ok_or_else(|| anyhow!(USAGE))?;
        Ok(Self { script, preload })
    }
}

fn main() -> Result<()> {
    setup_tracing();
    let args = Args::parse()?;

    let config = BridgeConfig::from_env().unwrap_or_else(|err| {
        eprintln!("Failed to load bridge configuration: {err}. Using defaults.");
        BridgeConfig::default()
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let handler = Arc::new(QuickJsHandler::new()?);
    let cwd = std::env::current_dir().context("failed to read working directory")?;
    let base_url = Url::from_directory_path(&cwd)
        .map_err(|_| anyhow!("working directory {} is not absolute", cwd.display()))?;

    let interop = Interop::builder(config, handler.clone())
        .base_url(base_url)
        .fetcher(FetcherKind::LocalFiles)
        .build()?;
    handler.set_dispatcher(interop.downgrade_dispatcher());
    interop.start_sweeper(runtime.handle());

    preload(&interop, args.preload)?;

    let source = std::fs::read_to_string(&args.script)
        .with_context(|| format!("failed to read {}", args.script.display()))?;
    let result = interop.execute(&source, &[], ExecuteOptions::sync())?;
    interop.flush();

    println!("{}", render(&interop, &result.value));
    Ok(())
}

fn preload(interop: &Interop, files: Vec<String>) -> Result<()> {
    if files.is_empty() {
        return Ok(());
    }
    let (done_tx, done_rx) = crossbeam::channel::bounded::<bool>(1);
    let on_error = done_tx.clone();
    interop.loader().load_many(
        files,
        move || {
            let _ = done_tx.send(true);
        },
        move || {
            let _ = on_error.send(false);
        },
    );
    match done_rx.recv_timeout(Duration::from_secs(30)) {
        Ok(true) => Ok(()),
        Ok(false) => bail!("failed to preload scripts"),
        Err(_) => bail!("timed out preloading scripts"),
    }
}

fn render(interop: &Interop, value: &ScriptValue) -> String {
    match value {
        ScriptValue::RemoteObject(reference) if reference.is_array() => {
            format!("[array #{}]", reference.reference_id())
        }
        ScriptValue::RemoteObject(reference) => format!("[object #{}]", reference.reference_id()),
        other => interop.marshaler().to_wire(other).to_string(),
    }
}

fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .try_init();
}
