use std::{sync::Arc, time::Duration};

use {
    anyhow::Context,
    clap::Subcommand,
    codehost_common::{format_age, now_ms},
    codehost_hosts::{
        AppState, ClassRef, HostContext, HostFilter, HostManager, HostRecord, HostState,
        HttpProbe, ImageProto, UserRef,
    },
    codehost_swarm::{DockerSwarm, Orchestrator, Workload},
    tracing::debug,
};

use crate::{Settings, db_commands::open_store};

#[derive(Subcommand)]
pub enum HostAction {
    /// List code host records.
    Ls {
        /// Only hosts in this state (unknown, starting, running, mia).
        #[arg(long)]
        state: Option<HostState>,
        /// Only hosts whose application is in this state.
        #[arg(long)]
        app_state: Option<AppState>,
        #[arg(long)]
        class_id: Option<i64>,
        #[arg(long)]
        user_id: Option<i64>,
        /// List live orchestrator services and containers instead of records.
        #[arg(long)]
        live: bool,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Start a code host for a user (no-op when one already exists).
    Start {
        username: String,
        #[arg(long)]
        user_id: i64,
        /// Container image to run.
        #[arg(long)]
        image: String,
        /// Image prototype ID recorded on the host.
        #[arg(long, default_value_t = 0)]
        proto_id: i64,
        #[arg(long)]
        class_id: Option<i64>,
        #[arg(long, requires = "class_id")]
        class_name: Option<String>,
        /// Repository cloned into the workspace on first start.
        #[arg(long, requires = "class_id")]
        repo: Option<String>,
        /// Block until the host answers its readiness probe.
        #[arg(long)]
        wait: bool,
        /// Seconds to wait with `--wait` (defaults to the interactive timeout).
        #[arg(long, conflicts_with = "batch")]
        timeout: Option<u64>,
        /// Wait with the longer batch timeout (scripted bulk starts).
        #[arg(long)]
        batch: bool,
    },
    /// Stop a user's code host. The record is kept unless `--delete` is given.
    Stop {
        username: String,
        #[arg(long)]
        delete: bool,
    },
    /// Replace the containers behind a user's code host.
    Restart { username: String },
    /// Show a user's code host.
    Find { username: String },
    /// Reconcile records with the orchestrator.
    Sync {
        /// Probe not-ready hosts for readiness.
        #[arg(long)]
        check_ready: bool,
    },
    /// Remove missing and idle hosts.
    Reap {
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove every managed service and delete every record.
    Purge {
        #[arg(long)]
        dry_run: bool,
        /// Required unless `--dry-run` is given.
        #[arg(long)]
        yes: bool,
    },
}

async fn open_manager(settings: &Settings) -> anyhow::Result<HostManager> {
    let config = settings.config.clone();
    let store = open_store(&settings.database_url).await?;
    let probe = HttpProbe::new(Duration::from_millis(config.readiness.probe_timeout_ms))
        .context("failed to build readiness probe client")?;
    let swarm = DockerSwarm::new(config.swarm.clone());
    debug!(backend = swarm.backend_name(), database_url = %settings.database_url, "opening host manager");
    let ctx = HostContext::new(config, Arc::new(swarm), Arc::new(store), Arc::new(probe));
    Ok(HostManager::new(ctx))
}

pub async fn handle_host(action: HostAction, settings: &Settings) -> anyhow::Result<()> {
    let manager = open_manager(settings).await?;

    match action {
        HostAction::Ls {
            state,
            app_state,
            class_id,
            user_id,
            live,
            json,
        } => {
            if live {
                let swarm = DockerSwarm::new(settings.config.swarm.clone());
                if !swarm.is_available().await {
                    anyhow::bail!("docker is unreachable or not a swarm manager");
                }
                let filter = manager.context().managed_filter();
                let workloads = swarm.workloads(&filter).await?;
                print_workloads(&workloads);
                return Ok(());
            }
            let filter = HostFilter {
                state,
                app_state,
                class_id,
                user_id,
            };
            let records = manager.list(&filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_records(&records);
            }
        },
        HostAction::Start {
            username,
            user_id,
            image,
            proto_id,
            class_id,
            class_name,
            repo,
            wait,
            timeout,
            batch,
        } => {
            let user = UserRef {
                id: user_id,
                username,
            };
            let proto = ImageProto {
                id: proto_id,
                name: image.clone(),
                image,
            };
            let class = class_id.map(|id| ClassRef {
                id,
                name: class_name.unwrap_or_else(|| id.to_string()),
                repo_url: repo,
            });

            let record = if wait || batch {
                let ctx = manager.context();
                let timeout = match timeout {
                    Some(secs) => Duration::from_secs(secs),
                    None if batch => ctx.batch_timeout(),
                    None => ctx.interactive_timeout(),
                };
                manager
                    .start_and_wait(&user, &proto, class.as_ref(), timeout)
                    .await?
            } else {
                manager.new_cs(&user, &proto, class.as_ref()).await?
            };
            print_details(&record);
        },
        HostAction::Stop { username, delete } => {
            let record = manager.stop_cs(&username).await?;
            match record {
                Some(record) if delete => {
                    manager.context().store.delete(&record.service_id).await?;
                    println!("Stopped {} and deleted its record.", record.service_name);
                },
                Some(record) => println!("Stopped {}.", record.service_name),
                None => println!("Stopped {username} (no record)."),
            }
        },
        HostAction::Restart { username } => {
            let record = manager.restart_cs(&username).await?;
            println!("Restarted {}; state {}.", record.service_name, record.state);
        },
        HostAction::Find { username } => match manager.get_by_username(&username).await? {
            Some(record) => print_details(&record),
            None => anyhow::bail!("no code host for {username}"),
        },
        HostAction::Sync { check_ready } => {
            let report = manager.sync(check_ready).await?;
            for (label, ids) in [
                ("marked mia", &report.marked_mia),
                ("refreshed", &report.refreshed),
                ("created", &report.created),
                ("failed", &report.failed),
            ] {
                println!("{label:<11} {}", ids.len());
                for id in ids {
                    println!("  {id}");
                }
            }
            if !report.is_clean() {
                anyhow::bail!("{} host(s) failed to sync", report.failed.len());
            }
        },
        HostAction::Reap { dry_run } => {
            let reaped = manager.reap(dry_run).await?;
            let verb = if dry_run { "Would reap" } else { "Reaped" };
            for candidate in &reaped {
                println!(
                    "{verb} {} ({}, {})",
                    candidate.record.service_name, candidate.record.service_id, candidate.reason
                );
            }
            println!("{verb} {} host(s).", reaped.len());
        },
        HostAction::Purge { dry_run, yes } => {
            if !dry_run && !yes {
                anyhow::bail!("purge removes every managed host; pass --yes to confirm");
            }
            let report = manager.purge(dry_run).await?;
            let verb = if dry_run { "Would remove" } else { "Removed" };
            for name in &report.services {
                println!("{verb} service {name}");
            }
            println!(
                "{verb} {} service(s) and {} record(s).",
                report.services.len(),
                report.records.len()
            );
        },
    }
    Ok(())
}

fn print_records(records: &[HostRecord]) {
    if records.is_empty() {
        println!("No code hosts.");
        return;
    }
    let now = now_ms();
    println!(
        "{:<26} {:<20} {:>8} {:<9} {:<9} {:<16} {:>5}  URL",
        "SERVICE ID", "NAME", "USER", "STATE", "APP", "NODE", "AGE"
    );
    for r in records {
        println!(
            "{:<26} {:<20} {:>8} {:<9} {:<9} {:<16} {:>5}  {}",
            r.service_id,
            r.service_name,
            r.user_id,
            r.state,
            r.app_state,
            r.node_name.as_deref().unwrap_or("-"),
            format_age(r.created_at_ms, now),
            r.public_url.as_deref().unwrap_or("-"),
        );
    }
}

fn print_workloads(workloads: &[Workload]) {
    if workloads.is_empty() {
        println!("No managed services.");
        return;
    }
    println!("{:<10} {:<26} {:<30} STATUS", "KIND", "ID", "NAME");
    for w in workloads {
        let kind = match w {
            Workload::Service(_) => "service",
            Workload::Container(_) => "container",
        };
        println!("{kind:<10} {:<26} {:<30} {}", w.id(), w.name(), w.status());
    }
}

fn timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn print_details(r: &HostRecord) {
    let now = now_ms();
    println!("service:    {} ({})", r.service_name, r.service_id);
    println!("user:       {}", r.user_id);
    if let Some(class_id) = r.class_id {
        println!("class:      {class_id}");
    }
    if let Some(proto_id) = r.proto_id {
        println!("prototype:  {proto_id}");
    }
    println!("state:      {} / {}", r.state, r.app_state);
    if let Some(ref url) = r.public_url {
        println!("url:        {url}");
    }
    if let Some(ref password) = r.password {
        println!("password:   {password}");
    }
    if let Some(ref node) = r.node_name {
        println!("node:       {node}");
    }
    if let Some(ref container) = r.container_id {
        println!("container:  {container}");
    }
    println!(
        "created:    {} ({} ago)",
        timestamp(r.created_at_ms),
        format_age(r.created_at_ms, now)
    );
    if let Some(at) = r.last_activity_ms {
        println!("active:     {} ({} ago)", timestamp(at), format_age(at, now));
    }
}
