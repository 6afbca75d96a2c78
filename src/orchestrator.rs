//! One portlens session from start to cleanup
//!
//! Order matters: the port is allocated and the domain mapped before the proxy
//! binds, and the proxy is listening before the child is spawned. Once the
//! domain is mapped, every exit path goes through [`Shutdown`].

use crate::cli::Invocation;
use crate::config::{ProjectConfig, ProxySettings};
use crate::error::PortlensError;
use crate::frameworks::Framework;
use crate::hosts::{DomainMapper, MapOutcome};
use crate::proxy::ProxySession;
use crate::supervisor::{execute, LaunchCommand, Shutdown, ShutdownTrigger, SignalListener};
use crate::upstream::NetAddress;
use crate::VERSION;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Everything resolved before any side effect happens
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub domain: String,
    /// Internal port handed to the dev server
    pub port: u16,
    pub command: LaunchCommand,
    pub proxy: ProxySettings,
    pub grace_period: Duration,
}

pub struct Orchestrator {
    cwd: PathBuf,
    mapper: Arc<DomainMapper>,
    proxy_port_override: Option<u16>,
}

impl Orchestrator {
    pub fn new(cwd: impl Into<PathBuf>, mapper: DomainMapper) -> Self {
        Self {
            cwd: cwd.into(),
            mapper: Arc::new(mapper),
            proxy_port_override: None,
        }
    }

    /// Replace the configured primary proxy port
    pub fn with_proxy_port_override(mut self, port: Option<u16>) -> Self {
        self.proxy_port_override = port;
        self
    }

    /// Resolve domain, internal port and command without touching the system
    pub async fn prepare(&self, invocation: &Invocation) -> Result<LaunchPlan, PortlensError> {
        let project = ProjectConfig::discover(&self.cwd, invocation.name.as_deref()).await?;
        let domain = project.domain()?;
        let port = project.ports.find_available().await?;

        let command = match LaunchCommand::from_words(&invocation.command) {
            Some(command) => command,
            None => {
                let framework = Framework::detect(&self.cwd);
                debug!(framework = framework.id(), "Using default dev command");
                let mut args: Vec<String> = vec!["run".into(), "dev".into(), "--".into()];
                args.extend(framework.args(port));
                LaunchCommand::new("npm", args)
            }
        };

        let mut proxy = project.proxy.clone();
        if let Some(port) = self.proxy_port_override {
            proxy.port = port;
        }

        info!(domain = %domain, port, command = %command, "Session planned");

        Ok(LaunchPlan {
            domain,
            port,
            command,
            proxy,
            grace_period: project.shutdown_grace_period(),
        })
    }

    /// Run a full session, stopping on SIGINT/SIGTERM or when the child exits.
    /// Returns the process exit code.
    pub async fn run(&self, invocation: &Invocation) -> i32 {
        let mut signals = match SignalListener::install() {
            Ok(signals) => signals,
            Err(e) => {
                eprintln!("\n✖ Fatal Error: failed to install signal handlers: {}", e);
                return 1;
            }
        };
        self.run_with_signal(invocation, async move { signals.recv().await })
            .await
    }

    /// Like [`Orchestrator::run`], with the stop signal supplied by the caller
    pub async fn run_with_signal<F>(&self, invocation: &Invocation, signal: F) -> i32
    where
        F: Future<Output = String>,
    {
        match self.prepare(invocation).await {
            Ok(plan) => self.launch(plan, signal).await,
            Err(e) => {
                report_fatal(&e);
                1
            }
        }
    }

    /// Map, proxy, spawn, then wait for the first stop trigger
    pub async fn launch<F>(&self, plan: LaunchPlan, signal: F) -> i32
    where
        F: Future<Output = String>,
    {
        let shutdown = Shutdown::new(Arc::clone(&self.mapper));

        match self.mapper.map(&plan.domain).await {
            Ok(MapOutcome::Added) => shutdown.track_domain(&plan.domain),
            // Someone else's entry; leave it in place on exit
            Ok(MapOutcome::AlreadyPresent) => {}
            Err(e) => {
                report_fatal(&e);
                return 1;
            }
        }

        let session = match ProxySession::bind(
            &plan.proxy,
            NetAddress::loopback(plan.port),
            &plan.domain,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                report_fatal(&e);
                return shutdown
                    .run(ShutdownTrigger::StartupFailed)
                    .await
                    .unwrap_or(1);
            }
        };

        if let Some(notice) = fallback_notice(&session) {
            println!("{}", notice);
        }
        let public_port = session.local_addr().port();

        let (proxy_tx, proxy_rx) = watch::channel(false);
        let proxy_task = tokio::spawn(session.serve(proxy_rx));

        print_banner(&plan, public_port);

        let code = match execute(&plan.command, plan.port, plan.grace_period) {
            Ok(child) => {
                let child = Arc::new(child);
                shutdown.track_child(Arc::clone(&child));

                let trigger = tokio::select! {
                    biased;
                    name = signal => ShutdownTrigger::Signal(name),
                    exit = child.wait() => {
                        if let Some(code) = exit.code.filter(|c| *c != 0) {
                            println!("\n✖ Process exited with code {}", code);
                        }
                        ShutdownTrigger::ChildExited(exit)
                    }
                };
                shutdown.run(trigger).await.unwrap_or(0)
            }
            Err(e) => {
                report_fatal(&e);
                shutdown
                    .run(ShutdownTrigger::StartupFailed)
                    .await
                    .unwrap_or(1)
            }
        };

        let _ = proxy_tx.send(true);
        match proxy_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Proxy server error"),
            Err(e) => warn!(error = %e, "Proxy task failed"),
        }

        info!(code, "Session finished");
        code
    }
}

/// Public URL for the domain; the port is omitted when it is 80
pub fn public_url(domain: &str, port: u16) -> String {
    if port == 80 {
        format!("http://{}", domain)
    } else {
        format!("http://{}:{}", domain, port)
    }
}

/// Notice printed when the proxy could not take its primary port
pub fn fallback_notice(session: &ProxySession) -> Option<String> {
    session.fell_back().then(|| {
        format!(
            "⚠ Port {} busy or restricted. Using fallback port {}.",
            session.primary_port(),
            session.local_addr().port()
        )
    })
}

fn print_banner(plan: &LaunchPlan, public_port: u16) {
    println!(
        "\n🔭 Portlens v{}\n✔ Domain:   {}\n✔ Internal: localhost:{}\n✔ Command:  {}\n",
        VERSION,
        public_url(&plan.domain, public_port),
        plan.port,
        plan.command
    );
}

/// Print a fatal error and its hint to stderr
pub fn report_fatal(err: &PortlensError) {
    debug!(error = ?err, "Fatal error");
    eprintln!("\n✖ Fatal Error: {}", err);
    if let Some(hint) = err.hint() {
        eprintln!("  └─ Hint: {}", hint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project(files: &[(&str, &str)]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    fn hosts_mapper(dir: &TempDir) -> (DomainMapper, PathBuf) {
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();
        let mapper = DomainMapper::for_os("linux")
            .unwrap()
            .with_hosts_path(&path)
            .without_elevation();
        (mapper, path)
    }

    fn no_signal() -> impl Future<Output = String> {
        std::future::pending()
    }

    #[test]
    fn test_public_url() {
        assert_eq!(public_url("my-app.localhost", 80), "http://my-app.localhost");
        assert_eq!(
            public_url("my-app.localhost", 8080),
            "http://my-app.localhost:8080"
        );
    }

    #[tokio::test]
    async fn test_fallback_notice() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = blocker.local_addr().unwrap().port();
        let settings = ProxySettings {
            port: busy,
            fallback_ports: vec![0],
            ..ProxySettings::default()
        };

        let session = ProxySession::bind(&settings, NetAddress::loopback(4000), "a.localhost")
            .await
            .unwrap();
        let notice = fallback_notice(&session).unwrap();
        assert_eq!(
            notice,
            format!(
                "⚠ Port {} busy or restricted. Using fallback port {}.",
                busy,
                session.local_addr().port()
            )
        );

        let primary = ProxySession::bind(
            &ProxySettings {
                port: 0,
                ..ProxySettings::default()
            },
            NetAddress::loopback(4000),
            "a.localhost",
        )
        .await
        .unwrap();
        assert_eq!(fallback_notice(&primary), None);
    }

    #[tokio::test]
    async fn test_prepare_skips_blocked_port() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:4000").unwrap();
        let dir = project(&[("package.json", r#"{"name": "my-app"}"#)]);
        let (mapper, _) = hosts_mapper(&dir);

        let plan = Orchestrator::new(dir.path(), mapper)
            .prepare(&Invocation {
                name: None,
                command: vec![],
            })
            .await
            .unwrap();

        assert_eq!(plan.domain, "my-app.localhost");
        assert_eq!(plan.port, 4001);
        assert_eq!(plan.command.to_string(), "npm run dev --");
        drop(blocker);
    }

    #[tokio::test]
    async fn test_prepare_vite_default_command() {
        let dir = project(&[
            ("package.json", r#"{"name": "front"}"#),
            ("portlens.json", r#"{"ports": {"start": 4600}}"#),
            ("vite.config.ts", ""),
        ]);
        let (mapper, _) = hosts_mapper(&dir);

        let plan = Orchestrator::new(dir.path(), mapper)
            .with_proxy_port_override(Some(0))
            .prepare(&Invocation {
                name: None,
                command: vec![],
            })
            .await
            .unwrap();

        assert_eq!(plan.command.program, "npm");
        assert!(plan.command.args.contains(&"--strictPort".to_string()));
        assert!(plan.command.args.contains(&plan.port.to_string()));
        assert_eq!(plan.proxy.port, 0);
    }

    #[tokio::test]
    async fn test_no_project_leaves_hosts_untouched() {
        let dir = project(&[]);
        let (mapper, hosts) = hosts_mapper(&dir);
        // The hosts file itself must not count as a project marker
        let project_dir = dir.path().join("empty");
        std::fs::create_dir(&project_dir).unwrap();

        let orchestrator = Orchestrator::new(&project_dir, mapper);
        let invocation = Invocation {
            name: None,
            command: vec!["true".into()],
        };

        let err = orchestrator.prepare(&invocation).await.unwrap_err();
        assert!(err.to_string().contains("No project detected"));

        assert_eq!(orchestrator.run_with_signal(&invocation, no_signal()).await, 1);
        assert_eq!(
            std::fs::read_to_string(&hosts).unwrap(),
            "127.0.0.1 localhost\n"
        );
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        const TEST_CONFIG: &str = r#"{
            "name": "session",
            "proxy": { "port": 0, "fallback_ports": [] },
            "ports": { "start": 4500 },
            "shutdown_grace_period_secs": 1
        }"#;

        fn invocation(script: &str) -> Invocation {
            Invocation {
                name: None,
                command: vec!["sh".into(), "-c".into(), script.into()],
            }
        }

        #[tokio::test]
        async fn test_child_exit_zero_cleans_up() {
            let dir = project(&[("portlens.json", TEST_CONFIG)]);
            let (mapper, hosts) = hosts_mapper(&dir);

            let code = Orchestrator::new(dir.path(), mapper)
                .run_with_signal(&invocation("exit 0"), no_signal())
                .await;

            assert_eq!(code, 0);
            let content = std::fs::read_to_string(&hosts).unwrap();
            assert!(!content.contains("session.localhost"));
        }

        #[tokio::test]
        async fn test_child_exit_code_is_propagated() {
            let dir = project(&[("portlens.json", TEST_CONFIG)]);
            let (mapper, hosts) = hosts_mapper(&dir);

            let code = Orchestrator::new(dir.path(), mapper)
                .run_with_signal(&invocation("exit 7"), no_signal())
                .await;

            assert_eq!(code, 7);
            assert_eq!(
                std::fs::read_to_string(&hosts).unwrap(),
                "127.0.0.1 localhost\n"
            );
        }

        #[tokio::test]
        async fn test_signal_stops_child() {
            let dir = project(&[("portlens.json", TEST_CONFIG)]);
            let (mapper, hosts) = hosts_mapper(&dir);

            let signal = async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                "SIGTERM".to_string()
            };
            let code = tokio::time::timeout(
                Duration::from_secs(10),
                Orchestrator::new(dir.path(), mapper).run_with_signal(&invocation("sleep 30"), signal),
            )
            .await
            .unwrap();

            assert_eq!(code, 0);
            assert!(!std::fs::read_to_string(&hosts)
                .unwrap()
                .contains("session.localhost"));
        }

        #[tokio::test]
        async fn test_existing_entry_survives_session() {
            let dir = project(&[("portlens.json", TEST_CONFIG)]);
            let (mapper, hosts) = hosts_mapper(&dir);
            let before = "127.0.0.1 localhost\n127.0.0.1 session.localhost\n";
            std::fs::write(&hosts, before).unwrap();

            let code = Orchestrator::new(dir.path(), mapper)
                .run_with_signal(&invocation("exit 0"), no_signal())
                .await;

            assert_eq!(code, 0);
            assert_eq!(std::fs::read_to_string(&hosts).unwrap(), before);
        }

        #[tokio::test]
        async fn test_proxy_bind_failure_unmaps() {
            let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let busy = blocker.local_addr().unwrap().port();
            let config = format!(
                r#"{{"name": "blocked", "proxy": {{ "port": {}, "fallback_ports": [] }}, "ports": {{ "start": 4700 }}}}"#,
                busy
            );
            let dir = project(&[("portlens.json", config.as_str())]);
            let (mapper, hosts) = hosts_mapper(&dir);

            let code = Orchestrator::new(dir.path(), mapper)
                .run_with_signal(&invocation("exit 0"), no_signal())
                .await;

            assert_eq!(code, 1);
            assert_eq!(
                std::fs::read_to_string(&hosts).unwrap(),
                "127.0.0.1 localhost\n"
            );
        }
    }
}
