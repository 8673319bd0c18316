//! Renders an OBJ scene to a floating-point image.
//!
//! Usage: `meshtrace [SCENE.obj] [OUT.hdr] [--config FILE.json]`

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use meshtrace::{
    load_obj, write_image, ContextConfig, GpuContext, RenderConfig, Renderer, Result,
};

const DEFAULT_SCENE: &str = "scenes/CornellBox-Original-Merged.obj";
const DEFAULT_OUTPUT: &str = "out.hdr";
const USAGE: &str = "usage: meshtrace [SCENE.obj] [OUT.hdr] [--config FILE.json]";

#[derive(Debug)]
struct Args {
    scene: PathBuf,
    output: PathBuf,
    config: Option<PathBuf>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> std::result::Result<Args, String> {
    let mut positional = Vec::new();
    let mut config = None;
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().ok_or("--config needs a file")?;
                config = Some(PathBuf::from(path));
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            flag if flag.starts_with("--") => return Err(format!("unknown option {flag}\n{USAGE}")),
            _ => positional.push(PathBuf::from(arg)),
        }
    }
    if positional.len() > 2 {
        return Err(format!("too many arguments\n{USAGE}"));
    }
    let mut positional = positional.into_iter();
    Ok(Args {
        scene: positional.next().unwrap_or_else(|| DEFAULT_SCENE.into()),
        output: positional.next().unwrap_or_else(|| DEFAULT_OUTPUT.into()),
        config,
    })
}

fn run(args: &Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => RenderConfig::from_json_file(path)?,
        None => RenderConfig::default(),
    };
    let mesh = load_obj(&args.scene)?;
    let ctx = Arc::new(GpuContext::new(&ContextConfig::default())?);
    let renderer = Renderer::new(ctx, config)?;
    let image = renderer.render(&mesh)?;
    write_image(&args.output, &image)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<Args, String> {
        parse_args(args.iter().map(|s| (*s).to_string()))
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.scene, PathBuf::from(DEFAULT_SCENE));
        assert_eq!(args.output, PathBuf::from(DEFAULT_OUTPUT));
        assert!(args.config.is_none());
    }

    #[test]
    fn test_positional_and_config() {
        let args = parse(&["bunny.obj", "--config", "cfg.json", "bunny.exr"]).unwrap();
        assert_eq!(args.scene, PathBuf::from("bunny.obj"));
        assert_eq!(args.output, PathBuf::from("bunny.exr"));
        assert_eq!(args.config, Some(PathBuf::from("cfg.json")));
    }

    #[test]
    fn test_errors() {
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["--fast"]).unwrap_err().contains("unknown option"));
        assert!(parse(&["a", "b", "c"]).is_err());
    }
}
