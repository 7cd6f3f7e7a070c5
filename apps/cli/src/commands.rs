//! CLI command implementations

use crate::output::{format_rate, print_output, print_runner, runner_table};
use crate::progress::wait_with_spinner;
use crate::{
    BandwidthArgs, DirectionArg, HostAction, InfoArg, OutputFormat, RemoteAction, RuleAction, SpoolArgs,
    TransferArgs, TransferRef,
};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use console::style;
use ferry_core::spooled::{SpoolMode, SpooledConfig, SpooledWatcher};
use ferry_core::{ControlRequest, FerryCore, InfoKind, SubmitRequest, TaskFilter};
use ferry_types::{BandwidthLimit, Direction, HostAuth, Role, Rule, TaskKey, TransferMode, TransferResult, UpdatedInfo};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

// ============================================================================
// Host Commands
// ============================================================================

pub async fn init(data_dir: &Path, host_id: &str, listen: &str, key: &str, format: OutputFormat) -> Result<()> {
    let address: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address {listen}"))?;
    let core = FerryCore::open(data_dir).await?;

    core.config().update(|s| {
        s.host_id = host_id.to_string();
        s.listen_address = listen.to_string();
    });
    core.config().save().await?;
    core.catalog()
        .save_host(HostAuth::new(host_id, address.ip().to_string(), address.port(), key))
        .await?;

    let settings = core.config().snapshot();
    print_output(&settings, format, |s| {
        println!(
            "{} Initialized host {} in {}",
            style("✓").green().bold(),
            style(&s.host_id).cyan(),
            data_dir.display()
        );
        println!("  Listening on: {}", s.listen_address);
        println!("  Incoming files: {}", s.in_dir.display());
        println!("  Outgoing files: {}", s.out_dir.display());
    })
}

/// Serve until shut down, reopening the host when a restart was asked for
pub async fn serve(data_dir: &Path) -> Result<()> {
    loop {
        let core = FerryCore::open(data_dir).await?;
        let engine = core.engine().clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                engine.request_shutdown(false);
            }
        });

        let restart = core.serve().await?;
        interrupt.abort();
        if !restart {
            return Ok(());
        }
        info!("Restarting host");
    }
}

// ============================================================================
// Transfer Commands
// ============================================================================

fn submit_request(args: TransferArgs) -> SubmitRequest {
    let mut request = SubmitRequest::new(args.rule, args.host, args.file)
        .with_info(args.info)
        .with_digest(args.digest);
    if let Some(blocksize) = args.blocksize {
        request = request.with_blocksize(blocksize);
    }
    if let Some(id) = args.id {
        request = request.with_special_id(id);
    }
    request
}

pub async fn submit(
    core: &FerryCore,
    args: TransferArgs,
    start: Option<String>,
    wait: bool,
    format: OutputFormat,
) -> Result<()> {
    let mut request = submit_request(args);
    if let Some(start) = start {
        let start: DateTime<Utc> = DateTime::parse_from_rfc3339(&start)
            .with_context(|| format!("invalid start time {start}"))?
            .with_timezone(&Utc);
        request = request.with_start_time(start);
    }

    let (runner, completion) = core.submit(request).await?;
    print_output(&runner, format, |r| {
        println!(
            "{} Queued transfer {} of {}",
            style("✓").green().bold(),
            style(r.special_id).bold(),
            style(&r.filename).cyan()
        );
        println!("  Key: {}", r.key());
    })?;

    if wait {
        let result = match format {
            OutputFormat::Json => completion.wait().await?,
            _ => wait_with_spinner(core, &runner, completion).await?,
        };
        report(&result, format)?;
    }
    Ok(())
}

pub async fn send(core: &FerryCore, args: TransferArgs, format: OutputFormat) -> Result<()> {
    let result = core.direct_transfer(submit_request(args)).await?;
    report(&result, format)
}

fn report(result: &TransferResult, format: OutputFormat) -> Result<()> {
    print_output(result, format, |r| {
        if r.success {
            println!("{} Transfer {} done", style("✓").green().bold(), r.key);
        } else {
            println!(
                "{} Transfer {} ended with {}: {}",
                style("✗").red().bold(),
                r.key,
                r.code,
                r.message.as_deref().unwrap_or(r.code.message())
            );
        }
        if let Some(runner) = &r.runner {
            print_runner(runner, true);
        }
    })?;
    if !result.success {
        bail!("transfer {} failed", result.key);
    }
    Ok(())
}

fn key_of(core: &FerryCore, target: &TransferRef) -> TaskKey {
    let local = core.config().host_id();
    if target.passive {
        TaskKey::new(target.id, target.remote.as_str(), local)
    } else {
        TaskKey::new(target.id, local, target.remote.as_str())
    }
}

pub async fn status(core: &FerryCore, target: TransferRef, format: OutputFormat) -> Result<()> {
    let runner = core.status(&key_of(core, &target)).await?;
    print_output(&runner, format, |r| print_runner(r, true))
}

pub async fn list(
    core: &FerryCore,
    status: Option<String>,
    rule: Option<String>,
    limit: usize,
    format: OutputFormat,
) -> Result<()> {
    let mut filter = TaskFilter::default();
    if let Some(status) = status {
        let info = UpdatedInfo::parse(&status.to_uppercase()).ok_or_else(|| anyhow!("unknown status {status}"))?;
        filter = filter.status(info);
    }
    filter.rule_id = rule;
    let runners = core.list(&filter, limit).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&runners)?),
        OutputFormat::Table => println!("{}", runner_table(&runners)),
        OutputFormat::Human => {
            if runners.is_empty() {
                println!("{}", style("No transfers found").dim());
                return Ok(());
            }
            for runner in &runners {
                print_runner(runner, false);
            }
            println!();
            println!("{} transfer(s)", style(runners.len()).bold());
        }
    }
    Ok(())
}

pub async fn stop(core: &FerryCore, target: TransferRef, format: OutputFormat) -> Result<()> {
    let runner = core.stop(&key_of(core, &target)).await?;
    print_output(&runner, format, |r| {
        println!("{} Stop sent to transfer {}", style("✓").green().bold(), r.key())
    })
}

pub async fn cancel(core: &FerryCore, target: TransferRef, format: OutputFormat) -> Result<()> {
    let runner = core.cancel(&key_of(core, &target)).await?;
    print_output(&runner, format, |r| {
        println!("{} Cancel sent to transfer {}", style("✓").green().bold(), r.key())
    })
}

pub async fn restart(core: &FerryCore, target: TransferRef, format: OutputFormat) -> Result<()> {
    let runner = core.restart(&key_of(core, &target)).await?;
    print_output(&runner, format, |r| {
        println!(
            "{} Transfer {} queued again from block {}",
            style("✓").green().bold(),
            r.key(),
            r.rank
        )
    })
}

pub async fn delete(core: &FerryCore, target: TransferRef) -> Result<()> {
    let key = key_of(core, &target);
    core.delete(&key).await?;
    println!("{} Transfer {} deleted", style("✓").green().bold(), key);
    Ok(())
}

pub async fn purge(core: &FerryCore, days: u32, format: OutputFormat) -> Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
    let removed = core.purge(cutoff).await?;
    print_output(&removed, format, |n| {
        println!("{} Removed {} finished transfer(s)", style("✓").green().bold(), n)
    })
}

// ============================================================================
// Bandwidth
// ============================================================================

impl BandwidthArgs {
    fn is_empty(&self) -> bool {
        self.global_read.is_none()
            && self.global_write.is_none()
            && self.session_read.is_none()
            && self.session_write.is_none()
            && self.interval_ms.is_none()
    }

    fn apply(&self, mut limit: BandwidthLimit) -> BandwidthLimit {
        limit.global_read = self.global_read.unwrap_or(limit.global_read);
        limit.global_write = self.global_write.unwrap_or(limit.global_write);
        limit.session_read = self.session_read.unwrap_or(limit.session_read);
        limit.session_write = self.session_write.unwrap_or(limit.session_write);
        limit.check_interval_ms = self.interval_ms.unwrap_or(limit.check_interval_ms);
        limit
    }
}

fn print_limits(limit: &BandwidthLimit) {
    println!("Global:  read {}, write {}", format_rate(limit.global_read), format_rate(limit.global_write));
    println!("Session: read {}, write {}", format_rate(limit.session_read), format_rate(limit.session_write));
    println!("Check interval: {} ms", limit.check_interval_ms);
}

/// Local limits. A running `serve` only sees them after a restart; use
/// `remote` to change a live host.
pub async fn bandwidth(core: &FerryCore, args: BandwidthArgs, format: OutputFormat) -> Result<()> {
    if !args.is_empty() {
        core.change_bandwidth(args.apply(core.bandwidth())).await?;
    }
    print_output(&core.bandwidth(), format, print_limits)
}

// ============================================================================
// Remote Control
// ============================================================================

pub async fn remote(core: &FerryCore, host: &str, action: RemoteAction, format: OutputFormat) -> Result<()> {
    let local = core.config().host_id();
    let remote_key = |id: i64, passive: bool| {
        if passive {
            TaskKey::new(id, host, local.as_str())
        } else {
            TaskKey::new(id, local.as_str(), host)
        }
    };

    let request = match action {
        RemoteAction::Stop { id, passive } => ControlRequest::Stop(remote_key(id, passive)),
        RemoteAction::Cancel { id, passive } => ControlRequest::Cancel(remote_key(id, passive)),
        RemoteAction::Bandwidth { limits } => {
            if limits.is_empty() {
                ControlRequest::Bandwidth(None)
            } else {
                // Unset axes fall back to the current remote values.
                let current = core.remote_control(host, ControlRequest::Bandwidth(None)).await?;
                let current: BandwidthLimit = serde_json::from_str(&current.info)
                    .with_context(|| format!("{host} answered unreadable limits"))?;
                ControlRequest::Bandwidth(Some(limits.apply(current)))
            }
        }
        RemoteAction::Shutdown { restart } => ControlRequest::Shutdown { restart },
        RemoteAction::Block => ControlRequest::Block(true),
        RemoteAction::Unblock => ControlRequest::Block(false),
        RemoteAction::Test { message } => ControlRequest::Test(message),
        RemoteAction::Info { kind, rule, file, id } => {
            let kind = match kind {
                InfoArg::Exist => InfoKind::Exist,
                InfoArg::List => InfoKind::List,
                InfoArg::MlsDetail => InfoKind::MlsDetail,
                InfoArg::MlsList => InfoKind::MlsList,
                InfoArg::Transfer => InfoKind::Transfer,
            };
            ControlRequest::Information {
                kind,
                rule_id: rule,
                filename: file,
                key: id.map(|id| remote_key(id, false)),
            }
        }
        RemoteAction::Business { name, args } => ControlRequest::Business { name, args },
    };

    let reply = core.remote_control(host, request).await?;
    print_output(&reply, format, |r| {
        let icon = if r.code.is_success() {
            style("✓").green().bold()
        } else {
            style("✗").red().bold()
        };
        println!("{} {} answered {}", icon, host, r.code);
        if !r.info.is_empty() {
            match serde_json::from_str::<serde_json::Value>(&r.info) {
                Ok(value) if value.is_object() || value.is_array() => {
                    println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| r.info.clone()))
                }
                _ => println!("{}", r.info),
            }
        }
    })
}

// ============================================================================
// Rules and Hosts
// ============================================================================

pub async fn rule_action(core: &FerryCore, action: RuleAction, format: OutputFormat) -> Result<()> {
    match action {
        RuleAction::List => {
            let rules = core.catalog().rules();
            print_output(&rules, format, |rules| {
                if rules.is_empty() {
                    println!("{}", style("No rules defined").dim());
                }
                for rule in rules {
                    let hosts = if rule.host_ids.is_empty() {
                        "all hosts".to_string()
                    } else {
                        rule.host_ids.join(", ")
                    };
                    println!(
                        "{} {:?} {} ({})",
                        style(&rule.id).bold(),
                        rule.direction,
                        rule.mode.as_str(),
                        hosts
                    );
                }
            })?;
        }
        RuleAction::Add {
            id,
            direction,
            mode,
            hosts,
            recv_path,
            send_path,
            work_path,
        } => {
            let direction = match direction {
                DirectionArg::Send => Direction::Send,
                DirectionArg::Recv => Direction::Recv,
            };
            let mut rule = Rule::new(id, direction);
            rule.mode = TransferMode::parse(&mode).ok_or_else(|| anyhow!("unknown mode {mode}"))?;
            rule.host_ids = hosts;
            rule.recv_path = recv_path;
            rule.send_path = send_path;
            rule.work_path = work_path;
            core.catalog().save_rule(rule.clone()).await?;
            print_output(&rule, format, |r| {
                println!("{} Rule {} saved", style("✓").green().bold(), style(&r.id).cyan())
            })?;
        }
        RuleAction::Remove { id } => {
            core.catalog().delete_rule(&id).await?;
            println!("{} Rule {} removed", style("✓").green().bold(), id);
        }
    }
    Ok(())
}

fn parse_role(name: &str) -> Result<Role> {
    Ok(match name.to_lowercase().as_str() {
        "transfer" => Role::Transfer,
        "control" => Role::Control,
        "read" => Role::Read,
        "system" => Role::System,
        "business" => Role::Business,
        other => bail!("unknown role {other}"),
    })
}

pub async fn host_action(core: &FerryCore, action: HostAction, format: OutputFormat) -> Result<()> {
    match action {
        HostAction::List => {
            // Secrets stay out of the listing.
            let hosts: Vec<HostAuth> = core
                .catalog()
                .hosts()
                .into_iter()
                .map(|mut h| {
                    h.key = "***".to_string();
                    h
                })
                .collect();
            print_output(&hosts, format, |hosts| {
                for host in hosts {
                    let flags = [
                        (host.is_ssl, "tls"),
                        (host.is_client, "client"),
                        (!host.is_active, "inactive"),
                    ]
                    .iter()
                    .filter(|(on, _)| *on)
                    .map(|(_, name)| *name)
                    .collect::<Vec<_>>()
                    .join(" ");
                    println!(
                        "{} {} {:?} {}",
                        style(&host.host_id).bold(),
                        host.socket_address(),
                        host.roles,
                        style(flags).dim()
                    );
                }
            })?;
        }
        HostAction::Add {
            id,
            address,
            port,
            key,
            ssl,
            client,
            roles,
        } => {
            let mut host = HostAuth::new(id, address, port, key);
            host.is_ssl = ssl;
            host.is_client = client;
            if !roles.is_empty() {
                let roles = roles.iter().map(|r| parse_role(r)).collect::<Result<Vec<_>>>()?;
                host = host.with_roles(&roles);
            }
            core.catalog().save_host(host.clone()).await?;
            print_output(&host.host_id, format, |id| {
                println!("{} Host {} saved", style("✓").green().bold(), style(id).cyan())
            })?;
        }
        HostAction::Remove { id } => {
            core.catalog().delete_host(&id).await?;
            println!("{} Host {} removed", style("✓").green().bold(), id);
        }
    }
    Ok(())
}

// ============================================================================
// Spooled Directories
// ============================================================================

async fn spool_config(args: SpoolArgs) -> Result<SpooledConfig> {
    if let Some(path) = args.config {
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        return serde_json::from_str(&content).with_context(|| format!("invalid spool config {}", path.display()));
    }

    let first = args.dir.first().cloned().unwrap_or_else(|| PathBuf::from("."));
    Ok(SpooledConfig {
        name: first.display().to_string(),
        status_file: args.status_file.unwrap_or_else(|| first.join(".ferry-spool.json")),
        stop_file: args.stop_file.unwrap_or_else(|| first.join(".ferry-spool.stop")),
        directories: args.dir,
        regex: args.regex,
        recursive: args.recursive,
        elapse_ms: args.elapse_ms,
        min_size: args.min_size,
        mode: if args.direct { SpoolMode::Direct } else { SpoolMode::Submit },
        limit_parallel: args.parallel,
        ignore_already_used: args.resend_changed,
        rule_id: args.rule.unwrap_or_default(),
        hosts: args.host,
        ..Default::default()
    })
}

pub async fn spool(core: &FerryCore, args: SpoolArgs, format: OutputFormat) -> Result<()> {
    let config = spool_config(args).await?;
    let queued = config.mode == SpoolMode::Submit;
    println!(
        "{} Watching {} (stop with {})",
        style("→").cyan(),
        config.name,
        config.stop_file.display()
    );

    let watcher = SpooledWatcher::new(core.clone(), config).await?;
    let stop = watcher.stop_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });

    // Queued transfers need a commander to run them.
    if queued {
        core.start_commander();
    }
    let stats = watcher.run().await;
    interrupt.abort();
    if queued {
        core.shutdown().await;
    }

    let summary = serde_json::json!({ "sent": stats.sent(), "errors": stats.errors() });
    print_output(&summary, format, |_| {
        println!(
            "{} Spool stopped: {} sent, {} error(s)",
            style("✓").green().bold(),
            stats.sent(),
            stats.errors()
        )
    })
}
