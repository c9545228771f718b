use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;
use webbridge::{BridgeConfig, BrowserViewHost, DisplayOptions, HostFunction, Window, WindowConfig};

const USAGE: &str = "usage: webbridge <page.html> [--css <file>] [--title <title>]";

struct Args {
    page: PathBuf,
    css: Option<PathBuf>,
    title: Option<String>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut page = None;
    let mut css = None;
    let mut title = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--css" => css = Some(PathBuf::from(args.next().context("--css needs a file")?)),
            "--title" => title = Some(args.next().context("--title needs a value")?),
            "-h" | "--help" => return Err(anyhow!(USAGE)),
            flag if flag.starts_with("--") => return Err(anyhow!("unknown flag {flag}\n{USAGE}")),
            _ if page.is_none() => page = Some(PathBuf::from(&arg)),
            _ => return Err(anyhow!("unexpected argument {arg}\n{USAGE}")),
        }
    }

    Ok(Args {
        page: page.ok_or_else(|| anyhow!(USAGE))?,
        css,
        title,
    })
}

fn main() {
    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    if let Err(err) = run() {
        eprintln!("webbridge: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    let title = args.title.clone().unwrap_or_else(|| {
        args.page
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("webbridge"))
    });
    let mut bridge = BridgeConfig::from_env()?;
    if std::env::var_os("WEBBRIDGE_STATIC_ROOT").is_none() {
        if let Some(parent) = args.page.parent().filter(|p| !p.as_os_str().is_empty()) {
            bridge.static_root = parent.to_path_buf();
        }
    }

    let mut config = WindowConfig::new(title).with_bridge(bridge);
    if let Some(css) = &args.css {
        config = config.with_css_file(css)?;
    }

    // Page script can call `log(...)` to print through the host.
    let log = HostFunction::new("log", |params: &[Value]| {
        let line = params
            .iter()
            .map(|param| match param {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ");
        info!(target: "page", "{line}");
        Ok(())
    });

    let options = DisplayOptions::from_file(&args.page)?.with_function(log);
    let mut window = Window::new(config);
    window.display(options)?;
    window.show(&mut BrowserViewHost::default())
}
