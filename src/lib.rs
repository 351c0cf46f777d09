//! mispfleet: provision a fleet of MISP instances and wire them into a
//! hub-and-spoke sync topology.
//!
//! Every operation is idempotent. Re-running `setup` against a converged
//! fleet changes nothing; re-running it after a partial failure picks up
//! where the previous run stopped.
//!
//! # Layout
//!
//! ```text
//! <root>/fleet.toml                 topology (optional, defaults apply)
//! <root>/misp-central/config.json   central node
//! <root>/misp-NN/config.json        clients
//! <root>/auth.json, auth.csv        exported credentials
//! <root>/fleet.events.jsonl         run journal
//! ```
//!
//! # Examples
//!
//! ```bash
//! mispfleet init --clients 3
//! mispfleet start
//! mispfleet setup
//! mispfleet export-auth --no-create
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: errors, registry, topology, credentials, journal, lock
//! - [`platform`]: the platform admin API and its REST client
//! - [`plugins`]: provisioning, tags, trust negotiation, export, push,
//!   container control, maintenance and event housekeeping

pub mod core;
pub mod platform;
pub mod plugins;

use crate::core::error::FleetError;
use crate::core::journal::Journal;
use crate::core::lock::LockState;
use crate::core::output::{self, OutputFormat};
use crate::core::registry::{self, Registry};
use crate::core::topology::TopologyConfig;
use crate::platform::{Definitions, Role};
use crate::platform::client::HttpConnector;
use crate::plugins::container::{ComposeRuntime, ContainerRuntime};
use crate::plugins::provision::ProvisionOptions;
use crate::plugins::setup::SetupOptions;
use crate::plugins::trust::NegotiateOptions;
use crate::plugins::{events, export, init, maintenance, push, refresh, setup};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(
    name = "mispfleet",
    version = env!("CARGO_PKG_VERSION"),
    about = "Idempotent sync topology setup for a fleet of MISP instances"
)]
struct Cli {
    /// Fleet root holding one directory per instance.
    #[clap(long, global = true, default_value = "misps")]
    root: PathBuf,
    /// Topology file (defaults to `<root>/fleet.toml` when present).
    #[clap(long, global = true)]
    topology: Option<PathBuf>,
    /// Output format: 'text' or 'json'.
    #[clap(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct SetupCli {
    /// Also link every client pair directly.
    #[clap(long)]
    mesh: bool,
    /// Reset site/org admin passwords even when already stored.
    #[clap(long)]
    force_reset_passwords: bool,
    /// Mint new site/org admin authkeys even when already stored.
    #[clap(long)]
    rotate_authkeys: bool,
    /// Mint new sync keys for existing server registrations.
    #[clap(long)]
    rotate_sync_keys: bool,
    /// Do not write auth.json / auth.csv afterwards.
    #[clap(long)]
    skip_export: bool,
}

#[derive(clap::Args, Debug)]
struct RuntimeCli {
    /// Run the container runtime through sudo.
    #[clap(long)]
    sudo: bool,
}

#[derive(clap::Args, Debug)]
struct LockCli {
    #[clap(subcommand)]
    command: LockCommand,
}

#[derive(Subcommand, Debug)]
enum LockCommand {
    /// Show the push lock state, removing it if stale.
    Status,
}

#[derive(clap::Args, Debug)]
struct UserCli {
    #[clap(subcommand)]
    command: UserCommand,
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Create (or converge) a user on every instance.
    Add {
        #[clap(long)]
        email: String,
        /// site_admin, org_admin, user or sync_user.
        #[clap(long, default_value = "user")]
        role: Role,
    },
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write config records for central and N clients
    #[clap(name = "init")]
    Init {
        #[clap(long, default_value_t = 2)]
        clients: u32,
    },

    /// Provision identities and tags, negotiate every link, export credentials
    #[clap(name = "setup")]
    Setup(SetupCli),

    /// Provision identities and tags only
    #[clap(name = "provision")]
    Provision {
        #[clap(long)]
        force_reset_passwords: bool,
        #[clap(long)]
        rotate_authkeys: bool,
    },

    /// Write auth.json and auth.csv
    #[clap(name = "export-auth")]
    ExportAuth {
        /// Build rows from config records without contacting any instance.
        #[clap(long)]
        no_create: bool,
    },

    /// Trigger a push on every server registration, under the push lock
    #[clap(name = "push")]
    Push,

    /// Inspect the push lock
    #[clap(name = "lock")]
    Lock(LockCli),

    /// Record current container addresses and repoint peers at them
    #[clap(name = "refresh-urls")]
    RefreshUrls(RuntimeCli),

    /// Bring every instance up, then refresh addresses
    #[clap(name = "start")]
    Start(RuntimeCli),

    /// Bring every instance down
    #[clap(name = "stop")]
    Stop(RuntimeCli),

    /// Set the session timeout on every instance
    #[clap(name = "timeouts")]
    Timeouts {
        /// Seconds; defaults to the topology's session_timeout.
        #[clap(long)]
        seconds: Option<u64>,
    },

    /// Reset one user's password
    #[clap(name = "reset-password")]
    ResetPassword {
        #[clap(long)]
        instance: String,
        #[clap(long)]
        user: String,
        #[clap(long)]
        password: Option<String>,
    },

    /// Manage users across the fleet
    #[clap(name = "user")]
    User(UserCli),

    /// Refresh taxonomies, galaxies, warninglists and friends on every instance
    #[clap(name = "update-definitions")]
    UpdateDefinitions {
        /// Only this set (repeatable); defaults to all of them.
        #[clap(long = "only")]
        only: Vec<Definitions>,
    },

    /// Ask every instance to update itself
    #[clap(name = "update-platform")]
    UpdatePlatform,

    /// Send one raw API call to every instance
    #[clap(name = "call")]
    Call {
        /// Endpoint path, e.g. /servers/getVersion.
        path: String,
        /// JSON body; the call is a POST when given, a GET otherwise.
        #[clap(long)]
        data: Option<String>,
    },

    /// Write usage statistics of every instance to a directory
    #[clap(name = "stats")]
    Stats {
        #[clap(long, default_value = "stats")]
        dest: PathBuf,
        #[clap(long, default_value = "data")]
        context: String,
    },

    /// Dump every instance's events as a feed
    #[clap(name = "dump-feeds")]
    DumpFeeds {
        /// Defaults to `<root>/feeds`.
        #[clap(long)]
        dest: Option<PathBuf>,
    },

    /// Delete events blocklisted on the other side of each link
    #[clap(name = "cleanup-blocklisted")]
    CleanupBlocklisted,

    /// Move every site admin into another organisation
    #[clap(name = "move-admins")]
    MoveAdmins {
        #[clap(long)]
        org_id: u64,
    },
}

struct Fleet {
    root: PathBuf,
    topology: TopologyConfig,
    journal: Journal,
    format: OutputFormat,
}

impl Fleet {
    fn registry(&self) -> Result<Registry, FleetError> {
        registry::list_instances(&self.root, &self.topology)
    }

    fn connector(&self) -> HttpConnector {
        HttpConnector::new(self.topology.secure_connection)
    }
}

pub fn run() -> Result<(), FleetError> {
    let cli = Cli::parse();
    let topology = TopologyConfig::load(&cli.root, cli.topology.as_deref())?;
    topology.validate()?;
    let fleet = Fleet {
        journal: Journal::new(&cli.root),
        root: cli.root,
        topology,
        format: cli.format,
    };

    match cli.command {
        Command::Init { clients } => run_init(&fleet, clients),
        Command::Setup(args) => run_setup(&fleet, args, false),
        Command::Provision {
            force_reset_passwords,
            rotate_authkeys,
        } => run_setup(
            &fleet,
            SetupCli {
                mesh: false,
                force_reset_passwords,
                rotate_authkeys,
                rotate_sync_keys: false,
                skip_export: true,
            },
            true,
        ),
        Command::ExportAuth { no_create } => run_export(&fleet, no_create),
        Command::Push => run_push(&fleet),
        Command::Lock(LockCli {
            command: LockCommand::Status,
        }) => run_lock_status(&fleet),
        Command::RefreshUrls(args) => run_refresh(&fleet, &ComposeRuntime::detect(args.sudo)?),
        Command::Start(args) => {
            let runtime = ComposeRuntime::detect(args.sudo)?;
            let registry = fleet.registry()?;
            for instance in registry.all() {
                runtime.up(instance)?;
                output::ok_line(&format!("{} up", instance.name));
            }
            run_refresh(&fleet, &runtime)
        }
        Command::Stop(args) => {
            let runtime = ComposeRuntime::detect(args.sudo)?;
            let registry = fleet.registry()?;
            for instance in registry.all() {
                runtime.down(instance)?;
                output::ok_line(&format!("{} down", instance.name));
            }
            Ok(())
        }
        Command::Timeouts { seconds } => {
            let seconds = seconds.unwrap_or(fleet.topology.session_timeout);
            let count = maintenance::change_session_timeout(
                &fleet.registry()?,
                &fleet.connector(),
                &fleet.journal,
                seconds,
            )?;
            output::emit(
                fleet.format,
                "timeouts",
                "ok",
                &json!({ "instances": count, "seconds": seconds }),
                |_| output::ok_line(&format!("session timeout {}s on {} instances", seconds, count)),
            )
        }
        Command::ResetPassword {
            instance,
            user,
            password,
        } => {
            let mut registry = fleet.registry()?;
            let reset = maintenance::reset_password(
                &mut registry,
                &fleet.connector(),
                &fleet.topology,
                &fleet.journal,
                &instance,
                &user,
                password.as_deref(),
            )?;
            output::emit(fleet.format, "reset-password", "ok", &reset, |r| {
                output::ok_line(&format!(
                    "{} on {}: {}",
                    r.login,
                    r.instance,
                    r.password.bright_white().bold()
                ))
            })
        }
        Command::User(UserCli {
            command: UserCommand::Add { email, role },
        }) => {
            let users = maintenance::add_user_everywhere(
                &fleet.registry()?,
                &fleet.connector(),
                &fleet.journal,
                &email,
                role,
            )?;
            let instances: Vec<&str> = users.iter().map(|(name, _)| name.as_str()).collect();
            output::emit(
                fleet.format,
                "user.add",
                "ok",
                &json!({ "email": email, "instances": instances }),
                |_| {
                    for name in &instances {
                        output::ok_line(&format!("{} on {}", email, name));
                    }
                },
            )
        }
        Command::UpdateDefinitions { only } => {
            let sets = if only.is_empty() {
                Definitions::ALL.to_vec()
            } else {
                only
            };
            let count = maintenance::update_definitions_everywhere(
                &fleet.registry()?,
                &fleet.connector(),
                &fleet.journal,
                &sets,
            )?;
            let names: Vec<String> = sets.iter().map(ToString::to_string).collect();
            output::emit(
                fleet.format,
                "update-definitions",
                "ok",
                &json!({ "instances": count, "sets": names }),
                |_| output::ok_line(&format!("{} updated on {} instances", names.join(", "), count)),
            )
        }
        Command::UpdatePlatform => {
            let count = maintenance::update_platform_everywhere(
                &fleet.registry()?,
                &fleet.connector(),
                &fleet.journal,
            )?;
            output::emit(
                fleet.format,
                "update-platform",
                "ok",
                &json!({ "instances": count }),
                |_| output::ok_line(&format!("update requested on {} instances", count)),
            )
        }
        Command::Call { path, data } => {
            let payload = data
                .as_deref()
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()?;
            let answers = maintenance::direct_call_everywhere(
                &fleet.registry()?,
                &fleet.connector(),
                &fleet.journal,
                &path,
                payload.as_ref(),
            )?;
            output::emit(
                fleet.format,
                "call",
                "ok",
                &json!({ "path": path, "answers": answers }),
                |_| {
                    for (name, answer) in &answers {
                        output::ok_line(&format!("{}: {}", name, answer));
                    }
                },
            )
        }
        Command::Stats { dest, context } => {
            let dump = maintenance::dump_statistics(
                &fleet.registry()?,
                &fleet.connector(),
                &dest,
                &context,
            )?;
            output::emit(fleet.format, "stats", "ok", &dump, |d| {
                output::ok_line(&format!("central: {}", d.central.display()));
                output::ok_line(&format!("clients: {}", d.clients.display()));
            })
        }
        Command::DumpFeeds { dest } => {
            let dest = dest.unwrap_or_else(|| fleet.root.join(events::FEEDS_DIR));
            run_dump_feeds(&fleet, &dest)
        }
        Command::CleanupBlocklisted => {
            let deleted =
                events::cleanup_blocklisted(&fleet.registry()?, &fleet.connector(), &fleet.journal)?;
            output::emit(
                fleet.format,
                "cleanup-blocklisted",
                "ok",
                &json!({ "deleted": deleted }),
                |_| {
                    if deleted.is_empty() {
                        output::ok_line("no blocklisted events left");
                    }
                    for d in &deleted {
                        output::ok_line(&format!("{} deleted on {}", d.uuid, d.instance));
                    }
                },
            )
        }
        Command::MoveAdmins { org_id } => {
            let moved = maintenance::move_site_admins(
                &fleet.registry()?,
                &fleet.connector(),
                &fleet.journal,
                org_id,
            )?;
            output::emit(
                fleet.format,
                "move-admins",
                "ok",
                &json!({ "org_id": org_id, "instances": moved }),
                |_| {
                    for name in &moved {
                        output::ok_line(&format!("site admin of {} now in org {}", name, org_id));
                    }
                },
            )
        }
    }
}

fn run_dump_feeds(fleet: &Fleet, dest: &Path) -> Result<(), FleetError> {
    let feeds = events::dump_all_feeds(&fleet.registry()?, &fleet.connector(), &fleet.journal, dest)?;
    output::emit(fleet.format, "dump-feeds", "ok", &json!({ "feeds": feeds }), |_| {
        for feed in &feeds {
            output::ok_line(&format!(
                "{}: {} events, {} hashes in {}",
                feed.instance,
                feed.events,
                feed.hashes,
                feed.dir.display()
            ));
        }
    })
}

fn run_init(fleet: &Fleet, clients: u32) -> Result<(), FleetError> {
    let report = init::init_fleet(&fleet.root, &fleet.topology, &fleet.journal, clients)?;
    output::emit(fleet.format, "init", "ok", &report, |r| {
        for name in &r.created {
            output::ok_line(&format!("created {}", name));
        }
        for name in &r.kept {
            output::warn_line(&format!("kept existing {}", name));
        }
        println!();
        println!("{}", "Add to /etc/hosts:".bold());
        for line in &r.hosts {
            println!("  {}", line);
        }
    })
}

fn run_setup(fleet: &Fleet, args: SetupCli, skip_links: bool) -> Result<(), FleetError> {
    let mut registry = fleet.registry()?;
    let connector = fleet.connector();
    let opts = SetupOptions {
        provision: ProvisionOptions {
            force_reset_passwords: args.force_reset_passwords,
            rotate_authkeys: args.rotate_authkeys,
        },
        negotiate: NegotiateOptions {
            rotate_sync_keys: args.rotate_sync_keys,
        },
        mesh: args.mesh || fleet.topology.mesh,
        skip_links,
    };
    let mut report =
        setup::run_setup(&mut registry, &connector, &fleet.topology, &fleet.journal, opts)?;
    if !args.skip_export {
        let auth = export::dump_all(&mut registry, &connector, &fleet.topology, &fleet.journal)?;
        export::write_report(&fleet.root, &auth)?;
        report.failures.extend(auth.failures.into_iter().map(|f| setup::Failure {
            scope: format!("export {}", f.scope),
            error: f.error,
        }));
    }

    let status = if report.is_clean() { "ok" } else { "partial" };
    output::emit(fleet.format, "setup", status, &report, |r| {
        for name in &r.provisioned {
            output::ok_line(&format!("{} provisioned", name));
        }
        for link in &r.links {
            let note = if link.changed.is_empty() {
                "unchanged".dimmed().to_string()
            } else {
                link.changed.join(", ")
            };
            output::ok_line(&format!(
                "{} -> {} ({}) {}",
                link.local, link.remote, link.direction, note
            ));
        }
        for failure in &r.failures {
            output::fail_line(&failure.scope, &failure.error);
        }
    })?;
    if report.is_clean() {
        Ok(())
    } else {
        Err(FleetError::ValidationError(format!(
            "{} setup step(s) failed; re-run to resume",
            report.failures.len()
        )))
    }
}

fn run_export(fleet: &Fleet, no_create: bool) -> Result<(), FleetError> {
    let report = if no_create {
        export::from_configs(&fleet.registry()?, &fleet.topology)
    } else {
        let mut registry = fleet.registry()?;
        export::dump_all(&mut registry, &fleet.connector(), &fleet.topology, &fleet.journal)?
    };
    export::write_report(&fleet.root, &report)?;
    let status = if report.is_complete() { "ok" } else { "partial" };
    output::emit(
        fleet.format,
        "export-auth",
        status,
        &json!({
            "rows": report.rows.len(),
            "json": export::AUTH_JSON,
            "csv": export::AUTH_CSV,
            "failures": report.failures,
        }),
        |_| {
            output::ok_line(&format!(
                "{} credentials written to {} and {}",
                report.rows.len(),
                fleet.root.join(export::AUTH_JSON).display(),
                fleet.root.join(export::AUTH_CSV).display()
            ));
            for failure in &report.failures {
                output::fail_line(&failure.scope, &failure.error);
            }
        },
    )?;
    if report.is_complete() {
        Ok(())
    } else {
        Err(FleetError::ValidationError(format!(
            "{} instance(s) missing from the credential export",
            report.failures.len()
        )))
    }
}

fn run_push(fleet: &Fleet) -> Result<(), FleetError> {
    let outcome =
        push::trigger_push_all(&fleet.registry()?, &fleet.connector(), &fleet.topology, &fleet.journal)?;
    output::emit(fleet.format, "push", "ok", &outcome, |o| match o {
        push::PushOutcome::Triggered { servers } => {
            output::ok_line(&format!("push triggered on {} servers", servers))
        }
        push::PushOutcome::Skipped { holder_pid } => {
            output::warn_line(&format!("push skipped, lock held by pid {}", holder_pid))
        }
    })
}

fn run_lock_status(fleet: &Fleet) -> Result<(), FleetError> {
    let path = fleet.topology.lock_path(&fleet.root);
    let state = push::lock_status(&path, fleet.topology.lock.max_age_secs)?;
    let (status, pid) = match state {
        LockState::Free => ("free", None),
        LockState::Held(r) => ("held", Some(r.pid)),
        LockState::Reclaimed(r) => ("reclaimed", Some(r.pid)),
    };
    output::emit(
        fleet.format,
        "lock.status",
        "ok",
        &json!({ "lock": status, "pid": pid, "path": path.display().to_string() }),
        |_| match pid {
            Some(pid) => output::ok_line(&format!("{} ({}, pid {})", path.display(), status, pid)),
            None => output::ok_line(&format!("{} ({})", path.display(), status)),
        },
    )
}

fn run_refresh(fleet: &Fleet, runtime: &dyn ContainerRuntime) -> Result<(), FleetError> {
    let mut registry = fleet.registry()?;
    let report = refresh::refresh(
        &mut registry,
        runtime,
        &fleet.connector(),
        &fleet.topology,
        &fleet.journal,
    )?;
    output::emit(fleet.format, "refresh-urls", "ok", &report, |r| {
        if r.moved.is_empty() {
            output::ok_line("all addresses current");
        }
        for m in &r.moved {
            output::ok_line(&format!("{}: {} -> {}", m.instance, m.from, m.to));
        }
        for p in &r.repointed {
            output::ok_line(&format!("{}: '{}' now at {}", p.on, p.server, p.url));
        }
    })
}
