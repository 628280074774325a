use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use toolgate_audit::{AuditHub, AuditLogger, AuditStore, FileAuditStore};
use toolgate_policy::CapabilityGrant;
use toolgate_protocol::{CallerId, Invocation, InvocationMetadata, Permission, RequestId};
use toolgate_server::{GatewayBuilder, GatewayConfig, GatewaySigners};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "toolgatectl")]
#[command(about = "Operate a toolgate gateway: tokens, invocations, audit trail")]
struct Cli {
    /// Gateway configuration (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Mint or inspect capability tokens.
    #[command(subcommand)]
    Token(TokenCommand),
    /// Run one invocation through an in-process gateway.
    Invoke(InvokeArgs),
    /// Inspect the persisted audit trail.
    #[command(subcommand)]
    Audit(AuditCommand),
}

#[derive(Debug, Subcommand)]
enum TokenCommand {
    Issue {
        #[arg(long)]
        subject: String,
        /// Granted permission; repeat for several. `scope:*` and `*` are wildcards.
        #[arg(long = "permission", required = true)]
        permissions: Vec<String>,
        /// Defaults to `tokens.default_ttl_secs`.
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    Inspect {
        token: String,
    },
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    Show { request_id: String },
    /// Recompute every record's signature.
    Verify,
}

#[derive(Debug, Args)]
struct InvokeArgs {
    #[arg(long)]
    tool: String,
    #[arg(long)]
    function: String,
    /// Function arguments as a JSON object.
    #[arg(long, default_value = "{}")]
    args: String,
    #[arg(long)]
    caller: String,
    #[arg(long)]
    token: String,
    /// Generated when omitted.
    #[arg(long)]
    request_id: Option<String>,
    #[arg(long)]
    trace_id: Option<String>,
    #[arg(long)]
    dry_run: bool,
}

impl InvokeArgs {
    fn to_invocation(&self) -> Result<Invocation> {
        let args: Value = serde_json::from_str(&self.args).context("--args is not valid JSON")?;
        if !args.is_object() {
            bail!("--args must be a JSON object");
        }
        let request_id = self
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(Invocation {
            request_id: RequestId::from(request_id),
            caller_id: CallerId::from(self.caller.as_str()),
            capability_token: self.token.clone(),
            tool_id: self.tool.clone(),
            function_name: self.function.clone(),
            args,
            metadata: InvocationMetadata {
                trace_id: self.trace_id.clone(),
                pr_id: None,
                dry_run: self.dry_run,
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => GatewayConfig::default(),
    };

    match cli.command {
        Command::Token(TokenCommand::Issue {
            subject,
            permissions,
            ttl_secs,
        }) => {
            let verifier = GatewaySigners::from_config(&config)?.verifier();
            let grant = CapabilityGrant::new(
                subject,
                permissions.into_iter().map(Permission::new).collect(),
            );
            let ttl = Duration::from_secs(ttl_secs.unwrap_or(config.tokens.default_ttl_secs));
            let token = verifier.generate_token(&grant, ttl)?;
            info!(subject = %grant.subject, ttl_secs = ttl.as_secs(), "token issued");
            println!("{token}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Token(TokenCommand::Inspect { token }) => {
            let verifier = GatewaySigners::from_config(&config)?.verifier();
            let (report, valid) = match verifier.check(&token) {
                Ok(claims) => (json!({ "valid": true, "claims": claims }), true),
                Err(rejection) => (
                    json!({ "valid": false, "reason": rejection.to_string() }),
                    false,
                ),
            };
            print_json(&report)?;
            Ok(exit_code(valid))
        }
        Command::Invoke(args) => {
            let invocation = args.to_invocation()?;
            let server = GatewayBuilder::from_config(&config)?.build()?;
            let response = server.invoke(invocation).await;
            print_json(&response)?;
            Ok(exit_code(response.is_ok()))
        }
        Command::Audit(AuditCommand::Show { request_id }) => {
            let store = FileAuditStore::new(&config.data_dir);
            match store.find_by_request(&RequestId::from(request_id.as_str())).await? {
                Some(event) => {
                    print_json(&event)?;
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    warn!(%request_id, path = %store.path().display(), "no audit record");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Audit(AuditCommand::Verify) => {
            let signers = GatewaySigners::from_config(&config)?;
            let logger = AuditLogger::new(
                Arc::new(FileAuditStore::new(&config.data_dir)),
                signers.records,
                AuditHub::default(),
            );
            let verification = logger.verify_all().await?;
            print_json(&json!({
                "total": verification.total,
                "tampered": verification.tampered,
            }))?;
            Ok(exit_code(verification.is_clean()))
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
