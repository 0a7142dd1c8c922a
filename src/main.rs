use anyhow::{bail, Context as _, Result};
use std::{env, path::PathBuf, process};
use tinyhost::{logging, Config, ExecError, HostContext, TrapKind, Value, WasiSnapshotPreview1};

const USAGE: &str = "usage: tinyhost [--no-validation] [--memory-limit PAGES] [--wasi] \
                     NAME=PATH... --invoke MODULE.FUNC [ARGS...]";

#[derive(Debug, Default)]
struct Options {
    no_validation: bool,
    memory_limit: Option<u32>,
    wasi: bool,
    modules: Vec<(String, PathBuf)>,
    module: String,
    func: String,
    args: Vec<String>,
}

fn parse_options(mut args: impl Iterator<Item = String>) -> Result<Options> {
    let mut options = Options::default();
    let mut target = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--no-validation" => options.no_validation = true,
            "--wasi" => options.wasi = true,
            "--memory-limit" => {
                let pages = args.next().context("--memory-limit needs a page count")?;
                options.memory_limit = Some(pages.parse().context("invalid page count")?);
            }
            "--invoke" => {
                target = args.next();
                options.args = args.by_ref().collect();
            }
            "-h" | "--help" => bail!("{USAGE}"),
            _ => {
                let Some((name, path)) = arg.split_once('=') else {
                    bail!("expected NAME=PATH, got `{arg}`\n{USAGE}");
                };
                options.modules.push((name.to_string(), PathBuf::from(path)));
            }
        }
    }

    let Some(target) = target else {
        bail!("missing --invoke MODULE.FUNC\n{USAGE}");
    };
    let Some((module, func)) = target.split_once('.') else {
        bail!("expected MODULE.FUNC, got `{target}`");
    };
    options.module = module.to_string();
    options.func = func.to_string();
    Ok(options)
}

fn main() -> Result<()> {
    logging::init_tracing();
    let options = parse_options(env::args().skip(1))?;

    let mut config = Config::new().enable_validation(!options.no_validation);
    if let Some(pages) = options.memory_limit {
        config = config.memory_limit(pages);
    }
    if options.wasi {
        let argv = std::iter::once(options.module.clone()).chain(options.args.iter().cloned());
        config = config.wasi(WasiSnapshotPreview1::new().args(argv));
    }

    let mut context = HostContext::new(config)?;
    for (name, path) in &options.modules {
        context
            .register_module_from_file(name, path)
            .with_context(|| format!("failed to register `{name}` from {}", path.display()))?;
    }

    let func_type = context.func_type(&options.module, &options.func)?;
    // WASI commands take no parameters; their arguments go to argv only.
    let args = if options.wasi && func_type.params.is_empty() {
        vec![]
    } else {
        if options.args.len() != func_type.params.len() {
            bail!(
                "{}.{} expects {} arguments, got {}",
                options.module,
                options.func,
                func_type.params.len(),
                options.args.len()
            );
        }
        func_type
            .params
            .iter()
            .zip(&options.args)
            .map(|(ty, text)| Value::parse(*ty, text))
            .collect::<Result<Vec<_>, _>>()?
    };

    match context.execute_registered(&options.module, &options.func, &args) {
        Ok(results) => {
            for result in results {
                println!("{result}");
            }
            Ok(())
        }
        Err(ExecError::Trap(trap)) => match trap.kind {
            TrapKind::Exit(code) => {
                drop(context);
                process::exit(code);
            }
            _ => Err(ExecError::Trap(trap).into()),
        },
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_options;
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn parse(args: &[&str]) -> Result<super::Options> {
        parse_options(args.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn parse_full_command_line() -> Result<()> {
        let options = parse(&[
            "--no-validation",
            "--memory-limit",
            "16",
            "book=book.wasm",
            "app=app.wasm",
            "--invoke",
            "book.add",
            "1",
            "--2",
        ])?;
        assert!(options.no_validation);
        assert_eq!(options.memory_limit, Some(16));
        assert_eq!(
            options.modules,
            vec![
                ("book".to_string(), PathBuf::from("book.wasm")),
                ("app".to_string(), PathBuf::from("app.wasm")),
            ]
        );
        assert_eq!((options.module.as_str(), options.func.as_str()), ("book", "add"));
        assert_eq!(options.args, vec!["1".to_string(), "--2".to_string()]);
        Ok(())
    }

    #[test]
    fn reject_bad_command_lines() {
        assert!(parse(&["book=book.wasm"]).is_err());
        assert!(parse(&["book.wasm", "--invoke", "book.add"]).is_err());
        assert!(parse(&["--invoke", "add"]).is_err());
        assert!(parse(&["--memory-limit", "lots", "--invoke", "a.b"]).is_err());
    }
}
