use std::process::ExitCode;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use weft_core::container::{AssertSeverity, Container, RuntimeConfig};
use weft_core::handle::NativeValue;
use weft_core::service::ReentrancyMode;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let opts = match Options::parse(std::env::args().skip(1)) {
        Ok(opts) => opts,
        Err(message) => {
            eprintln!("{message}");
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    match run(opts).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(%err, "run failed");
            ExitCode::FAILURE
        }
    }
}

const USAGE: &str = "usage: weft [options] <module.json> [argv...]
options:
  --reentrancy <forbidden|exclusive|prioritized|open>
  --op-budget <n>
  --assert <log|raise|fatal>
  --timeout-ms <n>
  --trace-events
Environment fallbacks: WEFT_REENTRANCY, WEFT_OP_BUDGET, WEFT_ASSERT.";

struct Options {
    module_path: String,
    argv: Vec<String>,
    config: RuntimeConfig,
    timeout: Option<Duration>,
}

impl Options {
    fn parse(args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut config = RuntimeConfig::default();
        if let Some(mode) = std::env::var("WEFT_REENTRANCY")
            .ok()
            .and_then(|v| ReentrancyMode::parse(&v))
        {
            config.reentrancy = mode;
        }
        if let Some(budget) = std::env::var("WEFT_OP_BUDGET")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.op_budget = budget;
        }
        if let Some(severity) = std::env::var("WEFT_ASSERT")
            .ok()
            .and_then(|v| AssertSeverity::parse(&v))
        {
            config.assert = severity;
        }

        let mut module_path = None;
        let mut argv = Vec::new();
        let mut timeout = None;
        let mut args = args.peekable();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--reentrancy" => {
                    let value = args.next().ok_or("--reentrancy needs a value")?;
                    config.reentrancy = ReentrancyMode::parse(&value)
                        .ok_or_else(|| format!("unknown re-entrancy mode `{value}`"))?;
                }
                "--op-budget" => {
                    let value = args.next().ok_or("--op-budget needs a value")?;
                    config.op_budget = value
                        .parse()
                        .map_err(|_| format!("bad op budget `{value}`"))?;
                }
                "--assert" => {
                    let value = args.next().ok_or("--assert needs a value")?;
                    config.assert = AssertSeverity::parse(&value)
                        .ok_or_else(|| format!("unknown assert severity `{value}`"))?;
                }
                "--timeout-ms" => {
                    let value = args.next().ok_or("--timeout-ms needs a value")?;
                    let ms: u64 = value
                        .parse()
                        .map_err(|_| format!("bad timeout `{value}`"))?;
                    timeout = Some(Duration::from_millis(ms));
                }
                "--trace-events" => config.trace_events = true,
                _ if module_path.is_none() => module_path = Some(arg),
                _ => argv.push(arg),
            }
        }

        Ok(Options {
            module_path: module_path.ok_or("missing module path")?,
            argv,
            config,
            timeout,
        })
    }
}

async fn run(opts: Options) -> anyhow::Result<ExitCode> {
    let bytes = std::fs::read(&opts.module_path)?;
    let trace = opts.config.trace_events;
    let mode = opts.config.reentrancy;

    let container = Container::new(opts.config);
    container.set_call_timeout(opts.timeout);
    let module = weft_core::module::load_module(&bytes)?;
    let module_name = module.name.clone();
    let version = container.load_module(module).await?;
    tracing::info!(
        module = %opts.module_path,
        version = %hex(&version[..8]),
        "module loaded"
    );

    container.create_service("main", mode);
    container.init_singletons().await?.map_err(|e| {
        anyhow::anyhow!("singleton initialization failed: {e}")
    })?;

    let result = container.run_entry(&module_name, opts.argv).await?;
    let code = match result {
        Ok(values) => {
            for value in &values {
                println!("{}", render(value));
            }
            // An integer first result doubles as the exit code.
            match values.first().and_then(|h| h.native()).and_then(NativeValue::as_int) {
                Some(n) if (0..=255).contains(&n) => ExitCode::from(n as u8),
                _ => ExitCode::SUCCESS,
            }
        }
        Err(exc) => {
            eprintln!("unhandled exception: {exc}");
            ExitCode::FAILURE
        }
    };

    container.shutdown().await;
    if trace {
        for (seq, event) in container.events().read_from(0) {
            println!("{seq:>6}  {event:?}");
        }
    }
    Ok(code)
}

fn render(handle: &weft_core::ObjectHandle) -> String {
    match handle.native() {
        Some(NativeValue::Nil) => "()".to_string(),
        Some(NativeValue::Bool(b)) => b.to_string(),
        Some(NativeValue::Int(n)) => n.to_string(),
        Some(NativeValue::Str(s)) => s.to_string(),
        None => format!("<object composition={}>", handle.composition()),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
