use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use luabox::lua_vm::lua_limits::DEFAULT_CHECKPOINT_INTERVAL;
use luabox::{LuaError, ResultMode, Sandbox, SandboxOption, Value};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Run Lua scripts under a CPU-step and memory budget.
#[derive(Debug, Parser)]
#[command(name = "luabox", version)]
struct Options {
    /// Execute string 'stat' (may be repeated)
    #[arg(short = 'e', long = "execute", value_name = "STAT")]
    execute_strings: Vec<String>,

    /// Memory cap in bytes
    #[arg(long, env = "LUABOX_MEMORY_LIMIT", value_name = "BYTES")]
    memory_limit: Option<usize>,

    /// CPU cap in VM instructions
    #[arg(long, env = "LUABOX_STEP_LIMIT", value_name = "STEPS")]
    step_limit: Option<u64>,

    /// Instructions between two step checkpoints
    #[arg(long, default_value_t = DEFAULT_CHECKPOINT_INTERVAL, value_name = "N")]
    checkpoint_interval: u32,

    /// Print results as JSON instead of `<type>\t<value>`
    #[arg(long)]
    json: bool,

    /// Print budget usage to stderr when done
    #[arg(long)]
    stats: bool,

    /// Script file, `-` for stdin
    script: Option<PathBuf>,

    /// Arguments passed to the script as `...`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    script_args: Vec<String>,
}

/// Initialize the tracing subscriber; `RUST_LOG` overrides the default level.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}

fn print_results(results: &[Value], json: bool) -> Result<()> {
    for value in results {
        if json {
            let text = luabox::serde::to_string(value, false)
                .with_context(|| format!("cannot encode {} as JSON", value.type_name()))?;
            println!("{text}");
        } else {
            println!("{}\t{}", value.type_name(), value);
        }
    }
    Ok(())
}

fn read_script(sandbox: &Sandbox, path: &Path) -> Result<luabox::CompiledChunk, LuaError> {
    if path.as_os_str() == "-" {
        let mut source = Vec::new();
        io::stdin()
            .read_to_end(&mut source)
            .map_err(|e| LuaError::Io {
                path: "stdin".to_string(),
                message: e.to_string(),
            })?;
        return sandbox.load_named(source, "stdin");
    }
    sandbox.load_file(path)
}

fn run(options: &Options, sandbox: &mut Sandbox) -> Result<()> {
    for (i, stat) in options.execute_strings.iter().enumerate() {
        let chunk = sandbox.load_named(stat, &format!("(command line {})", i + 1))?;
        let results = sandbox.call(&chunk, &[], ResultMode::All)?;
        print_results(&results, options.json)?;
    }

    let script = match (&options.script, options.execute_strings.is_empty()) {
        (Some(path), _) => Some(path.clone()),
        // nothing to do at all: read the script from stdin
        (None, true) => Some(PathBuf::from("-")),
        (None, false) => None,
    };

    if let Some(path) = script {
        let chunk = read_script(sandbox, &path)?;
        let args: Vec<Value> = options
            .script_args
            .iter()
            .map(|a| Value::from(a.as_str()))
            .collect();
        let results = sandbox.call(&chunk, &args, ResultMode::All)?;
        print_results(&results, options.json)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    init_tracing("warn");
    let options = Options::parse();

    let option = SandboxOption::default()
        .with_memory_limit(options.memory_limit)
        .with_step_limit(options.step_limit)
        .with_checkpoint_interval(options.checkpoint_interval);
    let mut sandbox = match Sandbox::new(option) {
        Ok(sandbox) => sandbox,
        Err(e) => {
            eprintln!("luabox: {e}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = run(&options, &mut sandbox);

    if options.stats {
        let budget = sandbox.budget();
        match serde_json::to_string(&budget) {
            Ok(text) => eprintln!("{text}"),
            Err(e) => tracing::warn!(error = %e, "cannot encode budget stats"),
        }
    }

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("luabox: {e:#}");
            if let Some(LuaError::RuntimeError {
                traceback: Some(traceback),
                ..
            }) = e.downcast_ref::<LuaError>()
            {
                eprintln!("{traceback}");
            }
            ExitCode::FAILURE
        }
    }
}
