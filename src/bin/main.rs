use mio::Poll;
use parser::FromYaml;
use server_proxy::{
    config::AppConfig,
    error::{CleanError, Result},
    server::{Server, ServerOptions},
};

/// Hand-rolled CLI (SPEC_FULL §1.3): no `clap` in the teacher's dependency
/// graph, and four flags don't need one.
struct Cli {
    config_path: String,
    port: Option<u16>,
    sql_pool_size: Option<usize>,
    threads: Option<usize>,
    sub_reactors: Option<usize>,
    close_log: bool,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config_path: "config.yaml".to_string(),
            port: None,
            sql_pool_size: None,
            threads: None,
            sub_reactors: None,
            close_log: false,
        }
    }
}

fn parse_args() -> Result<Cli> {
    let mut cli = Cli::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-p" | "--port" => {
                let val = args.next().ok_or_else(|| CleanError::from(format!("{arg} needs a value")))?;
                cli.port = Some(val.parse().map_err(|_| CleanError::from(format!("invalid port {val}")))?);
            }
            "-s" | "--sql-pool-size" => {
                let val = args
                    .next()
                    .ok_or_else(|| CleanError::from(format!("{arg} needs a value")))?;
                cli.sql_pool_size =
                    Some(val.parse().map_err(|_| CleanError::from(format!("invalid pool size {val}")))?);
            }
            "-t" | "--threads" => {
                let val = args.next().ok_or_else(|| CleanError::from(format!("{arg} needs a value")))?;
                cli.threads = Some(val.parse().map_err(|_| CleanError::from(format!("invalid thread count {val}")))?);
            }
            "-r" | "--sub-reactors" => {
                let val = args.next().ok_or_else(|| CleanError::from(format!("{arg} needs a value")))?;
                cli.sub_reactors =
                    Some(val.parse().map_err(|_| CleanError::from(format!("invalid sub-reactor count {val}")))?);
            }
            "-c" | "--close-log" => {
                let val = args.next().ok_or_else(|| CleanError::from(format!("{arg} needs a value")))?;
                cli.close_log = match val.as_str() {
                    "0" => false,
                    "1" => true,
                    _ => return Err(CleanError::from(format!("--close-log expects 0 or 1, got {val}"))),
                };
            }
            "--config" => {
                cli.config_path = args.next().ok_or_else(|| CleanError::from("--config needs a path"))?;
            }
            other => return Err(CleanError::from(format!("unrecognized argument {other}"))),
        }
    }

    Ok(cli)
}

fn main() -> Result<()> {
    let cli = parse_args()?;

    proxy_log::init("server.log", cli.close_log, 10_000, 1024);

    let content = std::fs::read_to_string(&cli.config_path)?;
    let mut config = AppConfig::from_str(&content)?;

    if let Some(port) = cli.port {
        for server in &mut config.servers {
            server.ports = vec![port];
        }
    }

    config.display_config();

    let opts = ServerOptions {
        db_pool_size: cli.sql_pool_size.unwrap_or_else(|| ServerOptions::default().db_pool_size),
        worker_threads: cli.threads.unwrap_or_else(|| ServerOptions::default().worker_threads),
        sub_reactors: cli.sub_reactors.unwrap_or_else(|| ServerOptions::default().sub_reactors),
    };

    let poll = Poll::new()?;
    let server = Server::new(config, &poll, opts)?;
    let result = server.run(poll);
    proxy_log::shutdown();
    result
}
