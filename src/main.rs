use portlens::cli::{self, CliCommand};
use portlens::config::{proxy_port_from_env, ProxySettings};
use portlens::doctor;
use portlens::hosts::DomainMapper;
use portlens::orchestrator::{report_fatal, Orchestrator};
use portlens::{PKG_NAME, VERSION};
use tracing::info;

#[tokio::main]
async fn main() {
    // Logs go to stderr so the dev server owns stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("portlens=warn".parse().expect("valid log directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let command = CliCommand::parse(std::env::args().skip(1));
    info!(name = PKG_NAME, version = VERSION, ?command, "Starting");

    match command {
        CliCommand::Help => {
            println!("{}", cli::usage());
            0
        }
        CliCommand::Version => {
            println!("{} {}", PKG_NAME, VERSION);
            0
        }
        CliCommand::Doctor => {
            let mapper = match DomainMapper::for_current_platform() {
                Ok(mapper) => mapper,
                Err(e) => {
                    report_fatal(&e);
                    return 1;
                }
            };
            let port = proxy_port_from_env().unwrap_or_else(|| ProxySettings::default().port);
            let report = doctor::diagnose(&mapper, port).await;
            println!("{}", report);

            if report.offers_port_repair() {
                let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
                let mut stdout = tokio::io::stdout();
                if let Err(e) =
                    doctor::offer_port_repair(port, &mut stdin, &mut stdout, doctor::free_port).await
                {
                    eprintln!("\n✖ Port repair aborted: {}", e);
                }
            }
            0
        }
        CliCommand::Run(invocation) => {
            let mapper = match DomainMapper::for_current_platform() {
                Ok(mapper) => mapper,
                Err(e) => {
                    report_fatal(&e);
                    return 1;
                }
            };
            let cwd = match std::env::current_dir() {
                Ok(cwd) => cwd,
                Err(e) => {
                    eprintln!("\n✖ Fatal Error: cannot read the working directory: {}", e);
                    return 1;
                }
            };

            Orchestrator::new(cwd, mapper)
                .with_proxy_port_override(proxy_port_from_env())
                .run(&invocation)
                .await
        }
    }
}
