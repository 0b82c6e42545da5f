//! CIFS server binary

use clap::Parser;
use rust_cifs::config::{GlobalConfig, ShareConfig, SigningPolicy, UserConfig};
use rust_cifs::server::CifsServer;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cifs-server")]
#[command(about = "Rust SMB1/CIFS Server", long_about = None)]
struct Args {
    /// NetBIOS machine name
    #[arg(short = 'n', long, default_value = "RUST-CIFS")]
    netbios_name: String,

    /// Workgroup/domain name
    #[arg(short = 'w', long, default_value = "WORKGROUP")]
    workgroup: String,

    /// Port to listen on
    #[arg(short = 'p', long, default_value = "445")]
    port: u16,

    /// Bind address
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    bind: String,

    /// Signing policy: disable, auto or mandatory
    #[arg(long, default_value = "auto")]
    signing: String,

    /// Map unknown users to the guest account
    #[arg(long, default_value = "false")]
    map_to_guest: bool,

    /// Share definitions, repeatable. Format: name:path[:comment]
    #[arg(short = 's', long, value_parser = parse_share)]
    shares: Vec<ShareDef>,

    /// User definitions, repeatable. Format: name:password[:uid[:gid]]
    #[arg(short = 'u', long, value_parser = parse_user)]
    users: Vec<UserDef>,

    /// Default share root when no shares are given
    #[arg(short = 'r', long)]
    root_dir: Option<PathBuf>,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone)]
struct ShareDef {
    name: String,
    path: PathBuf,
    comment: String,
}

#[derive(Debug, Clone)]
struct UserDef {
    name: String,
    password: String,
    uid: u32,
    gid: u32,
}

fn parse_share(s: &str) -> Result<ShareDef, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 2 {
        return Err("share format: name:path[:comment]".to_string());
    }
    Ok(ShareDef {
        name: parts[0].to_string(),
        path: PathBuf::from(parts[1]),
        comment: parts.get(2).unwrap_or(&"").to_string(),
    })
}

fn parse_user(s: &str) -> Result<UserDef, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 2 {
        return Err("user format: name:password[:uid[:gid]]".to_string());
    }
    let uid = parts
        .get(2)
        .map(|v| v.parse().map_err(|_| "bad uid".to_string()))
        .transpose()?
        .unwrap_or(65534);
    let gid = parts
        .get(3)
        .map(|v| v.parse().map_err(|_| "bad gid".to_string()))
        .transpose()?
        .unwrap_or(uid);
    Ok(UserDef {
        name: parts[0].to_string(),
        password: parts[1].to_string(),
        uid,
        gid,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let signing = match args.signing.as_str() {
        "disable" => SigningPolicy::Disabled,
        "mandatory" => SigningPolicy::Mandatory,
        _ => SigningPolicy::Auto,
    };

    let config = GlobalConfig {
        workgroup: args.workgroup,
        netbios_name: args.netbios_name,
        signing,
        map_to_guest: args.map_to_guest,
        ..GlobalConfig::default()
    };

    let mut shares = Vec::new();
    if args.shares.is_empty() {
        let root = args
            .root_dir
            .ok_or("either --shares or --root-dir is required")?;
        tracing::info!("no shares given, exporting 'public' -> {}", root.display());
        let mut share = ShareConfig::new("public", &root);
        share.guest_ok = true;
        shares.push(share);
    } else {
        for def in &args.shares {
            tracing::info!("exporting share '{}' -> {}", def.name, def.path.display());
            let mut share = ShareConfig::new(&def.name, &def.path);
            share.comment = def.comment.clone();
            shares.push(share);
        }
    }

    let mut users: Vec<UserConfig> = args
        .users
        .iter()
        .map(|u| UserConfig::new(&u.name, &u.password, u.uid, u.gid))
        .collect();
    if args.map_to_guest || users.is_empty() {
        users.push(UserConfig::guest("nobody"));
    }

    let server = CifsServer::new(config, shares, users);
    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;

    tracing::info!("listening on {}", addr);
    tracing::info!("stop with Ctrl+C");

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received");
        std::process::exit(0);
    });

    server.run(addr).await?;
    Ok(())
}
