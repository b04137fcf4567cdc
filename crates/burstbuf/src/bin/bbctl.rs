use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, ValueEnum};
use cli_table::format::{Justify, Separator};
use cli_table::{Cell, CellStruct, ColorChoice, Style, Table, print_stdout};

use bbcore::common::size::human_size;
use burstbuf::common::setup::setup_logging;
use burstbuf::common::utils::fs::absolute_path;
use burstbuf::common::utils::time::from_unix_seconds;
use burstbuf::config::BbConfig;
use burstbuf::persist::read_state;
use burstbuf::tool::create_executor;
use burstbuf::tool::query::{query_configurations, query_pools, query_sessions};

#[derive(ValueEnum, Clone)]
enum ColorPolicy {
    /// Use colors if the stdout is detected to be a terminal.
    Auto,
    /// Always use colors.
    Always,
    /// Never use colors.
    Never,
}

impl From<ColorPolicy> for ColorChoice {
    fn from(policy: ColorPolicy) -> Self {
        match policy {
            ColorPolicy::Auto => ColorChoice::Auto,
            ColorPolicy::Always => ColorChoice::Always,
            ColorPolicy::Never => ColorChoice::Never,
        }
    }
}

#[derive(Parser)]
#[command(
    about = "Inspects burst buffer controller state and the storage system",
    version(burstbuf::BB_VERSION),
    disable_help_subcommand(true)
)]
struct RootOptions {
    /// Enables more detailed log output
    #[arg(long, env = "BB_DEBUG", global = true)]
    debug: bool,

    /// Sets console color policy
    #[arg(long, default_value_t = ColorPolicy::Auto, value_enum, global = true)]
    colors: ColorPolicy,

    #[command(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser)]
enum SubCommand {
    /// Commands for the state file
    #[command(subcommand)]
    State(StateCommand),
    /// Shows the pools reported by the storage system
    Pools(ConfigOpts),
    /// Shows the sessions reported by the storage system
    Sessions(ConfigOpts),
    /// Commands for the configuration file
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Parser)]
enum StateCommand {
    /// Prints the allocations recorded in a state file
    Show(StateShowOpts),
}

#[derive(Parser)]
struct StateShowOpts {
    /// Path of the state file
    file: PathBuf,
    /// Print the allocations as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
enum ConfigCommand {
    /// Loads and validates a configuration file
    Check(ConfigCheckOpts),
}

#[derive(Parser)]
struct ConfigCheckOpts {
    /// Path of the configuration file
    file: PathBuf,
}

#[derive(Parser)]
struct ConfigOpts {
    /// Path of the controller configuration file
    #[arg(long, env = "BB_CONFIG")]
    config: PathBuf,
}

fn print_table(rows: Vec<Vec<CellStruct>>, header: &[&str], colors: ColorChoice) {
    let header: Vec<_> = header.iter().map(|name| name.cell().bold(true)).collect();
    let table = rows
        .table()
        .separator(
            Separator::builder()
                .title(Some(Default::default()))
                .column(Some(Default::default()))
                .build(),
        )
        .title(header)
        .color_choice(colors);
    if let Err(error) = print_stdout(table) {
        log::error!("Cannot print table to stdout: {error:?}");
    }
}

fn format_time(seconds: i64) -> String {
    from_unix_seconds(seconds)
        .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| seconds.to_string())
}

fn load_config(path: PathBuf) -> anyhow::Result<BbConfig> {
    Ok(BbConfig::load(&absolute_path(path)?)?)
}

fn command_state_show(opts: StateShowOpts, colors: ColorChoice) -> anyhow::Result<()> {
    let path = absolute_path(opts.file)?;
    let Some(state) = read_state(&path)? else {
        anyhow::bail!("No state file found at {}", path.display());
    };
    if opts.json {
        let allocations: Vec<_> = state
            .allocations
            .iter()
            .map(|allocation| {
                serde_json::json!({
                    "name": allocation.name,
                    "job_id": allocation.id,
                    "user_id": allocation.user_id,
                    "pool": allocation.pool,
                    "size": state.emulated.then_some(allocation.size),
                    "account": allocation.account,
                    "partition": allocation.partition,
                    "qos": allocation.qos,
                    "create_time": allocation.create_time,
                })
            })
            .collect();
        let output = serde_json::json!({
            "emulated": state.emulated,
            "allocations": allocations,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let rows = state
        .allocations
        .iter()
        .map(|allocation| {
            vec![
                allocation.name.as_str().cell(),
                allocation.id.cell().justify(Justify::Right),
                allocation.user_id.cell().justify(Justify::Right),
                allocation.pool.as_str().cell(),
                if state.emulated {
                    human_size(allocation.size).cell()
                } else {
                    "".cell()
                },
                allocation.account.as_str().cell(),
                format_time(allocation.create_time).cell(),
            ]
        })
        .collect();
    print_table(
        rows,
        &["Name", "Job", "User", "Pool", "Size", "Account", "Created"],
        colors,
    );
    Ok(())
}

async fn command_pools(opts: ConfigOpts, colors: ColorChoice) -> anyhow::Result<()> {
    let config = load_config(opts.config)?;
    let executor = create_executor(&config)?;
    let pools = query_pools(executor.as_ref(), config.timeouts.other).await?;
    let rows = pools
        .into_iter()
        .map(|pool| {
            vec![
                pool.name.cell(),
                human_size(pool.granularity).cell().justify(Justify::Right),
                human_size(pool.total).cell().justify(Justify::Right),
                human_size(pool.used).cell().justify(Justify::Right),
                human_size(pool.total.saturating_sub(pool.used))
                    .cell()
                    .justify(Justify::Right),
            ]
        })
        .collect();
    print_table(
        rows,
        &["Pool", "Granularity", "Total", "Used", "Free"],
        colors,
    );
    Ok(())
}

async fn command_sessions(opts: ConfigOpts, colors: ColorChoice) -> anyhow::Result<()> {
    let config = load_config(opts.config)?;
    let executor = create_executor(&config)?;
    let timeout = config.timeouts.other;
    let (sessions, configurations) = futures::try_join!(
        query_sessions(executor.as_ref(), timeout, Utc::now()),
        query_configurations(executor.as_ref(), timeout),
    )?;
    let rows = sessions
        .into_iter()
        .map(|session| {
            vec![
                session.name.cell(),
                session.user_id.cell().justify(Justify::Right),
                session
                    .pool
                    .unwrap_or_default()
                    .cell(),
                session
                    .size
                    .map(human_size)
                    .unwrap_or_default()
                    .cell()
                    .justify(Justify::Right),
                session.created.format("%Y-%m-%d %H:%M:%S").to_string().cell(),
            ]
        })
        .collect();
    print_table(rows, &["Session", "User", "Pool", "Size", "Created"], colors);
    println!("{} configuration(s)", configurations.configurations.len());
    Ok(())
}

fn command_config_check(opts: ConfigCheckOpts) -> anyhow::Result<()> {
    let config = load_config(opts.file)?;
    println!(
        "Configuration is valid: backend {}, state directory {}",
        config.backend,
        config.state_dir.display()
    );
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> burstbuf::Result<()> {
    let opts = RootOptions::parse();
    setup_logging(opts.debug);
    let colors: ColorChoice = opts.colors.into();

    let result = match opts.subcmd {
        SubCommand::State(StateCommand::Show(opts)) => command_state_show(opts, colors),
        SubCommand::Pools(opts) => command_pools(opts, colors).await,
        SubCommand::Sessions(opts) => command_sessions(opts, colors).await,
        SubCommand::Config(ConfigCommand::Check(opts)) => command_config_check(opts),
    };

    if let Err(error) = result {
        log::error!("{error:?}");
        std::process::exit(1);
    }
    Ok(())
}
