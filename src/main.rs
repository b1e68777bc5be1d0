mod quicssh;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "quicssh",
    version,
    about = "quicssh - tunnel SSH over QUIC",
    after_help = "Client usage: ssh -o ProxyCommand='quicssh client --addr %h:4242' user@host"
)]
struct Cli {
    /// Config file (.toml/.yaml/.yml). If omitted, uses QUICSSH_CONFIG; then quicssh.toml > quicssh.yaml > quicssh.yml from CWD; then built-in defaults.
    #[arg(long, env = "QUICSSH_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    /// Log level: debug|info|warn|error. RUST_LOG takes precedence.
    #[arg(long, env = "QUICSSH_LOG", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: quicssh::app::Command,
}

fn main() {
    let cli = Cli::parse();

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("quicssh: start runtime: {err}");
            std::process::exit(1);
        }
    };

    let res = rt.block_on(quicssh::run(cli.config, cli.log_level, cli.command));

    // A pending stdin read lives on a blocking thread and would hold up a
    // regular runtime drop.
    rt.shutdown_background();

    if let Err(err) = res {
        eprintln!("quicssh: {err:#}");
        std::process::exit(1);
    }
}
