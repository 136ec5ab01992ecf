//! Replichat replica executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use log::{self, LevelFilter};

use replichat::{
    logger_init, pf_error, pf_info, pf_warn, Bootstrap, ChatError,
    ReplicaManager,
};

use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Identifier of this replica; higher ids win elections.
    #[arg(short, long)]
    id: u32,

    /// Local IP to use for binding the listening socket.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Port shared by front-ends and peer replicas.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52700)]
    port: u16,

    /// Identifier of the current leader to join, if any.
    #[arg(long)]
    leader_id: Option<u32>,

    /// Address of the current leader to join, if any.
    #[arg(long)]
    leader_addr: Option<SocketAddr>,

    /// Replica configuration in TOML format.
    #[arg(long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(bootstrap)` on success
    /// or `Err(ChatError)` on any error.
    fn sanitize(&self) -> Result<Option<Bootstrap>, ChatError> {
        if self.port <= 1024 {
            Err(ChatError::msg(format!("invalid port {}", self.port)))
        } else if self.id >= (1 << 16) {
            Err(ChatError::msg(format!("invalid replica id {}", self.id)))
        } else if self.threads < 2 {
            Err(ChatError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            match (self.leader_id, self.leader_addr) {
                (Some(id), Some(addr)) => Ok(Some(Bootstrap { id, addr })),
                (None, None) => Ok(None),
                _ => Err(ChatError::msg(
                    "leader_id and leader_addr must be given together",
                )),
            }
        }
    }
}

/// Reads admin commands from stdin until `stop`, EOF or termination.
async fn admin_console(
    manager: &Arc<ReplicaManager>,
    mut rx_term: watch::Receiver<bool>,
) -> Result<(), ChatError> {
    let me = format!("r{}", manager.id());
    let mut lines = BufReader::new(io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    pf_info!(me; "stdin closed");
                    break;
                };
                match line.trim() {
                    "leader" => {
                        let leader = manager.leader().await;
                        pf_info!(me; "leader is {} on port {}", leader.id, leader.port);
                    }
                    "state" => {
                        let summary = manager.state_summary().await;
                        pf_info!(me; "state:\n{}", summary);
                    }
                    "groups" => {
                        let summary = manager.groups_summary().await;
                        pf_info!(me; "groups:\n{}", summary);
                    }
                    "stop" => break,
                    "" => {}
                    other => pf_warn!(me; "unknown command '{}'", other),
                }
            },

            _ = rx_term.changed() => break,
        }
    }

    manager.stop().await;
    Ok(())
}

/// Actual main function of a Replichat replica.
fn server_main() -> Result<(), ChatError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let bootstrap = args.sanitize()?;

    let bind_addr: SocketAddr = format!("{}:{}", args.bind_ip, args.port)
        .parse()
        .map_err(|e| {
            ChatError::msg(format!(
                "failed to parse bind_addr: bind_ip {} port {}: {}",
                args.bind_ip, args.port, e
            ))
        })?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("s"; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-replica")
            .build()?;

        // enter tokio runtime, set up the replica, and serve the admin
        // console until told to stop
        runtime.block_on(async move {
            let manager = ReplicaManager::new_and_setup(
                args.id,
                bind_addr,
                bootstrap,
                args.config.as_deref(),
            )
            .await?;
            admin_console(&manager, rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), ChatError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of a Replichat replica.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("s"; "server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn valid_args() -> CliArgs {
        CliArgs {
            id: 3,
            bind_ip: Ipv4Addr::LOCALHOST,
            port: 40000,
            leader_id: None,
            leader_addr: None,
            config: None,
            threads: 2,
        }
    }

    #[test]
    fn sanitize_standalone() -> Result<(), ChatError> {
        assert_eq!(valid_args().sanitize()?, None);
        Ok(())
    }

    #[test]
    fn sanitize_with_leader() -> Result<(), ChatError> {
        let args = CliArgs {
            leader_id: Some(1),
            leader_addr: Some("127.0.0.1:40001".parse()?),
            ..valid_args()
        };
        let bootstrap = args.sanitize()?;
        assert_eq!(
            bootstrap,
            Some(Bootstrap {
                id: 1,
                addr: "127.0.0.1:40001".parse()?
            })
        );
        Ok(())
    }

    #[test]
    fn sanitize_half_leader() -> Result<(), ChatError> {
        let args = CliArgs {
            leader_id: Some(1),
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
        let args = CliArgs {
            leader_addr: Some("127.0.0.1:40001".parse()?),
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_port() {
        let args = CliArgs {
            port: 1023,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_id() {
        let args = CliArgs {
            id: 1 << 16,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let args = CliArgs {
            threads: 1,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
    }
}
