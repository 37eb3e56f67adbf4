use clap::Parser;
use portico::{Config, Server};
use std::path::PathBuf;
use std::process::ExitCode;

/// Plugin-oriented HTTP/1.1 application server.
#[derive(Parser, Debug)]
#[command(name = "portico", version, about)]
struct Args {
    /// Configuration directory (holds server.conf).
    #[arg(short = 'c', long = "conf")]
    conf: Option<PathBuf>,

    /// Plugins directory. Plugins are registered at compile time; the
    /// flag is accepted for compatibility and only logged.
    #[arg(short = 'd', long = "plugins-dir")]
    plugins_dir: Option<PathBuf>,

    /// Number of reactor threads.
    #[arg(short = 'w', long = "workers")]
    workers: Option<usize>,

    /// Username to drop privileges to after binding.
    #[arg(short = 'u', long = "user")]
    user: Option<String>,

    /// Group to drop privileges to; defaults to the user's main group.
    #[arg(short = 'g', long = "group")]
    group: Option<String>,

    /// Print the server pid on startup.
    #[arg(long = "pid")]
    pid: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> portico::Result<()> {
    let args = Args::parse();

    let conf_dir = args.conf.unwrap_or_else(|| default_sibling("etc/portico"));
    let config = if conf_dir.join("server.conf").is_file() {
        Config::load(&conf_dir)?
    } else {
        Config::default()
    };

    init_logging(&config);

    if let Some(dir) = &args.plugins_dir {
        log::info!("plugins dir {} (compile-time registry in use)", dir.display());
    }

    let mut builder = Server::builder(config)
        .conf_dir(&conf_dir)
        .drop_to_user(args.user, args.group);
    if let Some(workers) = args.workers {
        builder = builder.workers(workers);
    }
    let server = builder.build()?;

    if args.pid {
        println!("pid:{}", std::process::id());
    }

    server.run()
}

fn init_logging(config: &Config) {
    let level = config
        .logging
        .get("level")
        .map(String::as_str)
        .unwrap_or("info");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// `<bindir>/../<suffix>`, the conventional install layout.
fn default_sibling(suffix: &str) -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent()?.parent().map(|p| p.join(suffix)))
        .unwrap_or_else(|| PathBuf::from(suffix))
}
