use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ipnet::Ipv4Net;
use vpcnet::app::AppSelector;
use vpcnet::nat::NatScope;
use vpcnet::policy::PolicyDoc;
use vpcnet::{Context, ContextConfig, Error, cidr, prereq};

#[derive(Parser)]
#[command(
    name = "vpcctl",
    version,
    about = "Single-host VPC simulator on Linux namespaces, bridges, and iptables"
)]
struct Cli {
    /// Directory holding vpc documents.
    #[arg(
        long,
        global = true,
        env = "VPCCTL_DATA_DIR",
        default_value = vpcnet::store::DEFAULT_DATA_DIR
    )]
    data_dir: PathBuf,

    /// Trace mutating commands instead of executing them.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Upper bound in seconds for one link/filter command.
    #[arg(long, global = true, default_value_t = 30)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a vpc: bridge, dedicated filter chain, forwarding
    Create { name: String, cidr: String },
    /// Attach a subnet namespace to a vpc
    AddSubnet {
        vpc: String,
        name: String,
        cidr: String,
        /// Gateway address; defaults to the subnet's first usable
        #[arg(long)]
        gw: Option<Ipv4Addr>,
    },
    /// Masquerade subnet traffic out of a host interface
    EnableNat {
        vpc: String,
        /// Host egress interface, e.g. eth0
        #[arg(long)]
        interface: String,
        /// Limit to one subnet
        #[arg(long, conflicts_with = "all_subnets")]
        subnet: Option<String>,
        /// Target every subnet in the vpc
        #[arg(long)]
        all_subnets: bool,
    },
    /// Connect two vpc bridges with filtered reachability
    Peer {
        vpc_a: String,
        vpc_b: String,
        /// Comma-separated ranges allowed across the peering
        #[arg(long, value_delimiter = ',')]
        allow_cidrs: Option<Vec<String>>,
    },
    /// Apply an ingress/egress policy document to a subnet
    ApplyPolicy {
        vpc: String,
        /// Path to the policy JSON file
        file: PathBuf,
    },
    /// Start a test HTTP listener inside a subnet
    DeployApp {
        vpc: String,
        subnet: String,
        port: u16,
    },
    /// Stop deployed test listeners
    StopApp {
        vpc: String,
        /// Select by namespace
        #[arg(long)]
        ns: Option<String>,
        /// Select by pid
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Tear down a vpc and everything it owns
    Delete { vpc: String },
    /// Delete every vpc in the store
    CleanupAll,
    /// List vpc names
    List,
    /// Print a vpc document
    Inspect { vpc: String },
    /// Cross-check metadata against live kernel state
    Verify,
}

impl Command {
    fn mutates(&self) -> bool {
        !matches!(self, Command::List | Command::Inspect { .. } | Command::Verify)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().init();

    let cli = Cli::parse();
    let ctx = Context::new(ContextConfig {
        data_dir: cli.data_dir,
        dry_run: cli.dry_run,
        timeout: Duration::from_secs(cli.timeout_secs),
    });

    match run(&ctx, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(ctx: &Context, command: Command) -> vpcnet::Result<()> {
    if command.mutates() {
        prereq::check(ctx).await?;
    }

    match command {
        Command::Create { name, cidr } => {
            let doc = vpcnet::create(ctx, &name, cidr::parse(&cidr)?).await?;
            println!("created vpc {} ({})", doc.name, doc.cidr);
        }
        Command::AddSubnet {
            vpc,
            name,
            cidr,
            gw,
        } => {
            let record = vpcnet::add_subnet(ctx, &vpc, &name, cidr::parse(&cidr)?, gw).await?;
            println!(
                "added subnet {} ({}) to vpc {vpc}, namespace {}",
                record.name, record.cidr, record.ns
            );
        }
        Command::EnableNat {
            vpc,
            interface,
            subnet,
            all_subnets,
        } => {
            let scope = match (subnet, all_subnets) {
                (Some(name), _) => NatScope::Subnet(name),
                (None, true) => NatScope::All,
                (None, false) => NatScope::Public,
            };
            let natted = vpcnet::enable_nat(ctx, &vpc, &interface, scope).await?;
            if natted.is_empty() {
                println!("nat unchanged for vpc {vpc}");
            } else {
                println!("nat enabled via {interface} for: {}", natted.join(", "));
            }
        }
        Command::Peer {
            vpc_a,
            vpc_b,
            allow_cidrs,
        } => {
            let allow = match allow_cidrs {
                Some(raw) => Some(
                    raw.iter()
                        .map(|s| cidr::parse(s))
                        .collect::<vpcnet::Result<Vec<Ipv4Net>>>()?,
                ),
                None => None,
            };
            vpcnet::peer(ctx, &vpc_a, &vpc_b, allow.as_deref()).await?;
            println!("peered {vpc_a} with {vpc_b}");
        }
        Command::ApplyPolicy { vpc, file } => {
            let json = tokio::fs::read_to_string(&file).await?;
            let policy = PolicyDoc::parse(&json)?;
            vpcnet::apply_policy(ctx, &vpc, &policy).await?;
            println!("applied policy to subnet {} in vpc {vpc}", policy.subnet);
        }
        Command::DeployApp { vpc, subnet, port } => {
            let record = vpcnet::deploy_app(ctx, &vpc, &subnet, port).await?;
            println!(
                "deployed listener on port {} in {} (pid {})",
                record.port, record.ns, record.pid
            );
        }
        Command::StopApp { vpc, ns, pid } => {
            let stopped = vpcnet::stop_app(ctx, &vpc, &AppSelector { ns, pid }).await?;
            println!("stopped {stopped} app(s) in vpc {vpc}");
        }
        Command::Delete { vpc } => {
            vpcnet::delete(ctx, &vpc).await?;
            println!("deleted vpc {vpc}");
        }
        Command::CleanupAll => {
            let deleted = vpcnet::cleanup_all(ctx).await?;
            println!("deleted {} vpc(s)", deleted.len());
        }
        Command::List => {
            for name in vpcnet::list(ctx).await? {
                println!("{name}");
            }
        }
        Command::Inspect { vpc } => {
            let doc = vpcnet::inspect(ctx, &vpc).await?;
            let json = serde_json::to_string_pretty(&doc)
                .map_err(|e| Error::StateCorrupt(e.to_string()))?;
            println!("{json}");
        }
        Command::Verify => {
            let report = vpcnet::verify(ctx).await?;
            let json = serde_json::to_string_pretty(&report)
                .map_err(|e| Error::StateCorrupt(e.to_string()))?;
            println!("{json}");
            if report.is_clean() {
                println!("ok: {} resource(s) accounted for", report.accounted.len());
            } else {
                println!("found {} orphan(s)", report.orphans.len());
            }
        }
    }
    Ok(())
}

/// Distinct exit code per error kind; 0 is success.
fn exit_code(err: &Error) -> u8 {
    match err {
        Error::NotFound(_) => 2,
        Error::Exists(_) => 3,
        Error::CidrOverlap(_) => 4,
        Error::CidrOutOfRange(_) => 5,
        Error::CidrInvalid(_) => 6,
        Error::PolicyMalformed(_) => 7,
        Error::NoMatchingSubnet(_) => 8,
        Error::Exec { .. } => 9,
        Error::Timeout { .. } => 10,
        Error::StateCorrupt(_) => 11,
        Error::Privilege(_) => 12,
        Error::SelfPeer(_) => 13,
        Error::AlreadyPeered(_, _) => 14,
        Error::Io(_) => 15,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn exit_codes_are_distinct() {
        let errors = [
            Error::NotFound(String::new()),
            Error::Exists(String::new()),
            Error::CidrOverlap(String::new()),
            Error::CidrOutOfRange(String::new()),
            Error::CidrInvalid(String::new()),
            Error::PolicyMalformed(String::new()),
            Error::NoMatchingSubnet(String::new()),
            Error::Exec {
                command: String::new(),
                stderr: String::new(),
            },
            Error::Timeout {
                command: String::new(),
                timeout_secs: 0,
            },
            Error::StateCorrupt(String::new()),
            Error::Privilege(String::new()),
            Error::SelfPeer(String::new()),
            Error::AlreadyPeered(String::new(), String::new()),
        ];
        let mut codes: Vec<u8> = errors.iter().map(exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn read_only_commands_skip_prerequisites() {
        assert!(!Command::List.mutates());
        assert!(!Command::Verify.mutates());
        assert!(
            Command::Delete {
                vpc: "x".to_string()
            }
            .mutates()
        );
    }
}
