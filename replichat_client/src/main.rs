//! Replichat terminal front-end executable.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;

use log::{self, LevelFilter};

use replichat::chat::valid_name;
use replichat::protocol::RecordKind;
use replichat::{
    logger_init, pf_error, pf_info, ChatError, FrontEnd, FrontEndEvent,
};

use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// User name to log in as.
    #[arg(short, long)]
    user: String,

    /// Chat group to join.
    #[arg(short, long)]
    group: String,

    /// Address of the current leader replica.
    #[arg(short, long, default_value = "127.0.0.1:52700")]
    server: SocketAddr,

    /// Port on which a new leader reconnects after a failover.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52800)]
    listen_port: u16,

    /// Front-end configuration in TOML format.
    #[arg(long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(ChatError)` on any error.
    fn sanitize(&self) -> Result<(), ChatError> {
        if !valid_name(&self.user) {
            Err(ChatError::msg(format!("invalid user name '{}'", self.user)))
        } else if !valid_name(&self.group) {
            Err(ChatError::msg(format!(
                "invalid group name '{}'",
                self.group
            )))
        } else if self.listen_port <= 1024 {
            Err(ChatError::msg(format!(
                "invalid listen_port {}",
                self.listen_port
            )))
        } else if self.threads < 1 {
            Err(ChatError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Relays stdin lines to the group and prints whatever arrives, until EOF,
/// a refusal or termination.
async fn chat_loop(
    mut front_end: FrontEnd,
    mut rx_term: watch::Receiver<bool>,
) -> Result<(), ChatError> {
    let me = format!("fe:{}", front_end.user());
    pf_info!(me; "joined {}, reconnects accepted on {}",
                 front_end.group(), front_end.listen_addr());
    let mut lines = BufReader::new(io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !line.trim().is_empty() {
                    front_end.send_message(line.trim_end()).await?;
                }
            },

            event = front_end.recv_event() => match event? {
                FrontEndEvent::Message(record) => {
                    if record.kind == RecordKind::Server {
                        println!("*** {}", record.text);
                    } else {
                        println!("[{}] {}", record.sender, record.text);
                    }
                }
                FrontEndEvent::Refused(reason) => {
                    println!("*** {}", reason);
                    break;
                }
                FrontEndEvent::Reconnected(addr) => {
                    pf_info!(me; "now served by {}", addr);
                }
            },

            _ = rx_term.changed() => break,
        }
    }

    front_end.leave().await
}

/// Actual main function of a Replichat front-end.
fn client_main() -> Result<(), ChatError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("c"; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-client")
            .build()?;

        runtime.block_on(async move {
            let front_end = FrontEnd::connect(
                args.server,
                args.listen_port,
                &args.user,
                &args.group,
                args.config.as_deref(),
            )
            .await?;
            chat_loop(front_end, rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), ChatError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of a Replichat front-end.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("c"; "client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
