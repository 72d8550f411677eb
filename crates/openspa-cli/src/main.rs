mod http;
mod server_config;

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use ospa_client::{
    describe_public_ips, resolve_client_ip, resolve_server, AccessRequest, Client, ClientConfig,
    OspaFile, PublicIpResolver, IPV4_RESOLVER_DEFAULT, IPV6_RESOLVER_DEFAULT, OSPA_FILE_VERSION,
};
use ospa_client::ospa::{OspaAdk, OspaCrypto, OspaRsa, OspaRsaClient, OspaRsaServer};
use ospa_core::{CipherSuiteId, InternetProtocol, ADK_SECRET_ENCODED_LEN, DEFAULT_SERVER_PORT, PROTOCOL_VERSION};
use ospa_crypto::{
    encode_private_key, encode_public_key, generate_rsa_keypair, read_public_key, DEFAULT_RSA_BITS,
};
use ospa_server::{xdp_supported, Server, ServerMetrics};
use prometheus::Registry;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use http::HttpServer;
use server_config::load_server_config;

#[derive(Parser, Debug)]
#[command(
    name = "openspa",
    author,
    version,
    about = "OpenSPA: single packet authorization server and client",
    propagate_version = true
)]
struct Cli {
    /// Increase output verbosity (-v, -vv).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Output log format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the OpenSPA server.
    Server(ServerArgs),
    /// Send an OpenSPA request packet.
    Req(ReqArgs),
    /// Generate a client key pair and its OSPA file.
    GenClient(GenClientArgs),
    /// Anti DoS knocking utilities.
    Adk {
        #[command(subcommand)]
        command: AdkCommand,
    },
    /// Print the public IPv4 and IPv6 address of this host.
    Ip(IpArgs),
    /// Print version information.
    Version,
}

#[derive(Subcommand, Debug)]
enum AdkCommand {
    /// Generate an encoded ADK secret.
    Secret,
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Server configuration file (YAML).
    config: PathBuf,
}

#[derive(Args, Debug)]
struct ReqArgs {
    /// OSPA file with the client credentials.
    ospa: PathBuf,

    /// Client IP to request access for (resolved through the public resolver when empty).
    #[arg(long)]
    client_ip: Option<IpAddr>,

    /// Target IP to access (defaults to the server's IP).
    #[arg(short = 't', long)]
    target_ip: Option<IpAddr>,

    /// Target protocol (ICMP, IPv4, TCP, UDP, ICMPv6).
    #[arg(long, default_value = "TCP", value_parser = parse_protocol)]
    target_protocol: InternetProtocol,

    /// Target (start) port.
    #[arg(short = 'p', long, default_value_t = 22)]
    target_port_start: u16,

    /// End of the target port range, 0 requests a single port.
    #[arg(long, default_value_t = 0)]
    target_port_end: u16,

    /// Number of attempts before giving up.
    #[arg(long, default_value_t = 3)]
    retry_count: usize,

    /// Seconds to wait for each response.
    #[arg(long, default_value_t = 3)]
    timeout: u64,

    /// Renew the request when half of the granted duration has passed.
    #[arg(long)]
    auto_mode: bool,

    /// URL resolving the client's public IPv4 address.
    #[arg(long, default_value = IPV4_RESOLVER_DEFAULT)]
    ipv4_resolver_server: String,

    /// URL resolving the client's public IPv6 address.
    #[arg(long, default_value = IPV6_RESOLVER_DEFAULT)]
    ipv6_resolver_server: String,
}

#[derive(Args, Debug)]
struct GenClientArgs {
    /// Client UUID (random when omitted).
    #[arg(long)]
    uuid: Option<uuid::Uuid>,

    /// Server host name or address written into the OSPA file.
    #[arg(long)]
    server_host: String,

    /// Server UDP port.
    #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
    server_port: u16,

    /// Server public key (PEM).
    #[arg(long)]
    server_public_key: PathBuf,

    /// ADK secret shared with the server.
    #[arg(long)]
    adk_secret: Option<String>,

    /// Output directory for `<uuid>.ospa` and `<uuid>.pub`.
    #[arg(short, long, default_value = ".")]
    out: PathBuf,

    /// Overwrite existing files.
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct IpArgs {
    /// URL resolving the public IPv4 address.
    #[arg(short = '4', long, default_value = IPV4_RESOLVER_DEFAULT)]
    ipv4_server: String,

    /// URL resolving the public IPv6 address.
    #[arg(short = '6', long, default_value = IPV6_RESOLVER_DEFAULT)]
    ipv6_server: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn parse_protocol(raw: &str) -> Result<InternetProtocol, String> {
    raw.parse().map_err(|err| format!("{err}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match cli.command {
        Command::Server(args) => run_server(&args.config).await,
        Command::Req(args) => run_req(args).await,
        Command::GenClient(args) => run_gen_client(&args),
        Command::Adk {
            command: AdkCommand::Secret,
        } => {
            println!("Secret: {}", ospa_core::generate_secret());
            Ok(())
        }
        Command::Ip(args) => run_ip(&args).await,
        Command::Version => {
            println!("OpenSPA version: {}", env!("CARGO_PKG_VERSION"));
            println!("OpenSPA Protocol version: {PROTOCOL_VERSION}");
            println!("ADK XDP support: {}", xdp_supported());
            Ok(())
        }
    }
}

fn init_tracing(verbosity: u8, format: LogFormat) {
    let level = match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let _ = match format {
        LogFormat::Text => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            res = signal::ctrl_c() => res.context("failed to listen for SIGINT")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    Ok(())
}

async fn run_server(config_path: &Path) -> Result<()> {
    let file = load_server_config(config_path).await?;

    let registry = Arc::new(Registry::new());
    let metrics = ServerMetrics::register(&registry).context("failed to register metrics")?;
    let backends = file.backends()?;
    let server = Arc::new(
        Server::bind(file.server_config()?, backends, metrics)
            .await
            .context("failed to start server")?,
    );
    let local = server.local_addr()?;

    let http = match file.http_addr()? {
        Some(addr) => {
            let http = HttpServer::spawn(addr, Arc::clone(&registry)).await?;
            info!(target: "openspa::http", address = %http.local_addr(), "http server started");
            Some(http)
        }
        None => None,
    };

    info!(
        target: "openspa::server",
        address = %local,
        handlers = file.server.request_handlers,
        firewall = %file.firewall.backend,
        authorization = %file.authorization.backend,
        adk = !file.server.adk.secret.is_empty(),
        "OpenSPA server started"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run(shutdown_rx).await })
    };

    let outcome = tokio::select! {
        signal = shutdown_signal() => {
            if let Err(err) = signal {
                error!(target: "openspa::server", error = %err, "signal handling failed; shutting down");
            } else {
                info!(target: "openspa::server", "shutdown signal received; stopping server");
            }
            let _ = shutdown_tx.send(true);
            (&mut serving).await
        }
        joined = &mut serving => joined,
    };
    let result = match outcome {
        Ok(run) => run.map_err(anyhow::Error::from),
        Err(join) => Err(anyhow::Error::from(join).context("server task failed")),
    };

    if let Some(http) = http {
        if let Err(err) = http.shutdown().await {
            warn!(target: "openspa::http", error = %err, "http server shutdown failed");
        }
    }
    server.close().await;
    info!(target: "openspa::server", "server stopped");
    result
}

async fn run_req(args: ReqArgs) -> Result<()> {
    let ospa = OspaFile::from_file(&args.ospa)
        .with_context(|| format!("failed to read OSPA file {}", args.ospa.display()))?;
    ospa.verify()
        .with_context(|| format!("invalid OSPA file {}", args.ospa.display()))?;

    info!(target: "openspa::client", host = %ospa.server_host, "resolving server host");
    let server = resolve_server(&ospa.server_host, ospa.server_port).await?;

    let target_ip = args.target_ip.unwrap_or_else(|| {
        info!(target: "openspa::client", ip = %server.ip(), "target ip defaulting to server ip");
        server.ip()
    });
    let target_port_end = match args.target_port_end {
        0 => args.target_port_start,
        end => end,
    };
    ensure!(
        target_port_end >= args.target_port_start,
        "target port end {target_port_end} is below start {}",
        args.target_port_start
    );

    let client_ip = match args.client_ip {
        Some(ip) => ip,
        None => {
            let ip = resolve_client_ip(
                &args.ipv4_resolver_server,
                &args.ipv6_resolver_server,
                target_ip,
            )
            .await
            .context("failed to resolve client ip")?;
            info!(target: "openspa::client", ip = %ip, "resolved client ip");
            ip
        }
    };

    let access = AccessRequest {
        client_uuid: ospa.client_uuid.clone(),
        client_ip,
        target_protocol: args.target_protocol,
        target_ip,
        target_port_start: args.target_port_start,
        target_port_end,
    };
    let mut config = ClientConfig::default()
        .with_retry_count(args.retry_count)
        .with_timeout(Duration::from_secs(args.timeout));
    if let Some(secret) = ospa.adk_secret() {
        config = config.with_adk_secret(secret);
    }
    let client = Client::new(ospa.cipher_suite()?, config);

    if !args.auto_mode {
        let grant = client.request(server, &access).await?;
        println!(
            "Access granted to {} {}/{}-{} for {}",
            grant.target_ip,
            grant.target_protocol,
            grant.target_port_start,
            grant.target_port_end,
            humantime::format_duration(grant.duration)
        );
        return Ok(());
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let stopper = tokio::spawn(async move {
        if let Err(err) = shutdown_signal().await {
            warn!(target: "openspa::client", error = %err, "signal handling failed");
        }
        let _ = stop_tx.send(true);
    });
    info!(target: "openspa::client", "auto mode started");
    let result = client.auto_mode(server, &access, stop_rx).await;
    stopper.abort();
    result?;
    info!(target: "openspa::client", "auto mode stopped");
    Ok(())
}

async fn run_ip(args: &IpArgs) -> Result<()> {
    let v4 = PublicIpResolver::new(args.ipv4_server.clone())?;
    let v6 = PublicIpResolver::new(args.ipv6_server.clone())?;
    print!("{}", describe_public_ips(&v4, &v6).await);
    Ok(())
}

fn run_gen_client(args: &GenClientArgs) -> Result<()> {
    let files = generate_client(args)?;
    println!(
        "OSPA file: {}\nClient public key (copy into the server's publicKeyLookupDir): {}",
        files.ospa.display(),
        files.public_key.display()
    );
    Ok(())
}

struct ClientFiles {
    ospa: PathBuf,
    public_key: PathBuf,
}

fn generate_client(args: &GenClientArgs) -> Result<ClientFiles> {
    ensure!(
        args.out.is_dir(),
        "output directory {} does not exist",
        args.out.display()
    );
    if let Some(secret) = &args.adk_secret {
        ensure!(
            secret.len() == ADK_SECRET_ENCODED_LEN,
            "adk secret must be {ADK_SECRET_ENCODED_LEN} characters"
        );
    }

    let server_public = read_public_key(&args.server_public_key).with_context(|| {
        format!(
            "failed to read server public key {}",
            args.server_public_key.display()
        )
    })?;
    info!(path = %args.server_public_key.display(), "using server public key");

    let uuid = args.uuid.unwrap_or_else(uuid::Uuid::new_v4).to_string();
    let ospa_path = args.out.join(format!("{uuid}.ospa"));
    let public_path = args.out.join(format!("{uuid}.pub"));
    for path in [&ospa_path, &public_path] {
        if path.exists() && !args.force {
            bail!("{} already exists, pass --force to overwrite", path.display());
        }
    }

    let (private, public) = generate_rsa_keypair(DEFAULT_RSA_BITS)?;
    let client_public_pem = encode_public_key(&public)?;
    let file = OspaFile {
        version: OSPA_FILE_VERSION.to_string(),
        client_uuid: uuid,
        server_host: args.server_host.clone(),
        server_port: args.server_port,
        adk: args.adk_secret.clone().map(|secret| OspaAdk { secret }),
        crypto: OspaCrypto {
            cipher_suite_priority: vec![CipherSuiteId::RsaSha256Aes256Cbc.to_string()],
            rsa: OspaRsa {
                client: OspaRsaClient {
                    private_key: encode_private_key(&private)?.to_string(),
                    public_key: client_public_pem.clone(),
                },
                server: OspaRsaServer {
                    public_key: encode_public_key(&server_public)?,
                },
            },
        },
    };
    file.verify().context("generated OSPA file is invalid")?;

    fs::write(&ospa_path, file.to_yaml()?)
        .with_context(|| format!("failed to write {}", ospa_path.display()))?;
    fs::write(&public_path, client_public_pem)
        .with_context(|| format!("failed to write {}", public_path.display()))?;
    info!(ospa = %ospa_path.display(), public_key = %public_path.display(), "client files created");

    Ok(ClientFiles {
        ospa: ospa_path,
        public_key: public_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gen_args(out: &Path, server_public_key: PathBuf) -> GenClientArgs {
        GenClientArgs {
            uuid: Some("c3b7a8e0-1b2c-4d5e-8f90-a1b2c3d4e5f6".parse().expect("uuid")),
            server_host: "openspa.example.org".to_string(),
            server_port: DEFAULT_SERVER_PORT,
            server_public_key,
            adk_secret: Some(ospa_core::generate_secret()),
            out: out.to_path_buf(),
            force: false,
        }
    }

    #[test]
    fn gen_client_writes_ospa_and_public_key() {
        let dir = tempfile::tempdir().expect("dir");
        let (_, server_public) = generate_rsa_keypair(1024).expect("server keypair");
        let server_pub = dir.path().join("server.pub");
        fs::write(&server_pub, encode_public_key(&server_public).expect("pem")).expect("write");

        let args = gen_args(dir.path(), server_pub);
        let files = generate_client(&args).expect("generate");
        assert_eq!(
            files.ospa.file_name().and_then(|n| n.to_str()),
            Some("c3b7a8e0-1b2c-4d5e-8f90-a1b2c3d4e5f6.ospa")
        );

        let ospa = OspaFile::from_file(&files.ospa).expect("read ospa");
        ospa.verify().expect("valid");
        assert_eq!(ospa.adk_secret(), args.adk_secret.as_deref());
        let client_public = read_public_key(&files.public_key).expect("client pub");
        assert_eq!(
            encode_public_key(&client_public).expect("pem"),
            ospa.crypto.rsa.client.public_key
        );

        let err = generate_client(&args).err().expect("exists");
        assert!(err.to_string().contains("--force"));

        let forced = GenClientArgs { force: true, ..args };
        generate_client(&forced).expect("overwrite");
    }

    #[test]
    fn gen_client_rejects_bad_input() {
        let dir = tempfile::tempdir().expect("dir");
        let mut args = gen_args(&dir.path().join("missing"), dir.path().join("server.pub"));
        assert!(generate_client(&args).is_err());

        args.out = dir.path().to_path_buf();
        args.adk_secret = Some("ABC".to_string());
        let err = generate_client(&args).err().expect("secret");
        assert!(err.to_string().contains("adk secret"));
    }

    #[test]
    fn cli_parses_request_flags() {
        let cli = Cli::try_parse_from([
            "openspa",
            "-vv",
            "req",
            "client.ospa",
            "-t",
            "10.0.0.1",
            "--target-protocol",
            "udp",
            "-p",
            "3000",
            "--target-port-end",
            "3010",
            "--auto-mode",
        ])
        .expect("parse");
        assert_eq!(cli.verbose, 2);
        let Command::Req(req) = cli.command else {
            panic!("expected req");
        };
        assert_eq!(req.target_ip, Some("10.0.0.1".parse().expect("ip")));
        assert_eq!(req.target_protocol, InternetProtocol::Udp);
        assert_eq!((req.target_port_start, req.target_port_end), (3000, 3010));
        assert_eq!(req.retry_count, 3);
        assert!(req.auto_mode);
        assert!(req.client_ip.is_none());

        assert!(Cli::try_parse_from(["openspa", "req", "x.ospa", "--target-protocol", "sctp"]).is_err());
        assert!(matches!(
            Cli::try_parse_from(["openspa", "adk", "secret"]).expect("adk").command,
            Command::Adk {
                command: AdkCommand::Secret
            }
        ));
    }
}
