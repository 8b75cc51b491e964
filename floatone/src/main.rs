mod app;
mod ipc;
mod rotation;
mod settings;

use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;
use floatone_ipc::{ConfigPatch, RotateInterval, Theme};
use tracing_subscriber::EnvFilter;

use app::App;
use settings::Settings;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// FloatOne - floating tip widget and its shared config store
#[derive(FromArgs)]
struct Cli {
    /// store file (default: <config dir>/floatone/store.bin, or $FLOATONE_STORE)
    #[argh(option)]
    store: Option<PathBuf>,
    /// bus hub socket (default: /tmp/floatone-bus.sock, or $FLOATONE_SOCKET)
    #[argh(option)]
    socket: Option<PathBuf>,
    #[argh(subcommand)]
    command: Option<SubCommand>,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum SubCommand {
    Hub(HubCmd),
    Watch(WatchCmd),
    Tip(TipCmd),
    Get(GetCmd),
    Set(SetCmd),
    Config(ConfigCmd),
    Tips(TipsCmd),
    Version(VersionCmd),
}

/// Run the bus hub that relays changes between windows
#[derive(FromArgs)]
#[argh(subcommand, name = "hub")]
struct HubCmd {}

/// Print store changes as JSON lines
#[derive(FromArgs)]
#[argh(subcommand, name = "watch")]
struct WatchCmd {
    /// only watch this key
    #[argh(option)]
    key: Option<String>,
}

/// Run a headless tip bar
#[derive(FromArgs)]
#[argh(subcommand, name = "tip")]
struct TipCmd {
    /// print the current tip and exit
    #[argh(switch)]
    once: bool,
}

/// Print the value of a key
#[derive(FromArgs)]
#[argh(subcommand, name = "get")]
struct GetCmd {
    /// key name (e.g., config)
    #[argh(positional)]
    key: String,
}

/// Set a key to a JSON value
#[derive(FromArgs)]
#[argh(subcommand, name = "set")]
struct SetCmd {
    /// key name (e.g., newVersionDownloaded)
    #[argh(positional)]
    key: String,
    /// value as json (e.g., true or {"theme": "light"})
    #[argh(positional)]
    value: String,
}

/// Show the config, or change some of its fields
#[derive(FromArgs)]
#[argh(subcommand, name = "config")]
struct ConfigCmd {
    /// theme: light, dark, system
    #[argh(option)]
    theme: Option<Theme>,
    /// seconds between tips (at least 30)
    #[argh(option)]
    rotate_interval: Option<u32>,
    /// rotate tips automatically (true or false)
    #[argh(option)]
    auto_rotate: Option<bool>,
    /// launch on login (true or false)
    #[argh(option)]
    auto_start: Option<bool>,
}

impl ConfigCmd {
    fn into_patch(self) -> ConfigPatch {
        ConfigPatch {
            tips: None,
            auto_rotate: self.auto_rotate,
            rotate_interval: self.rotate_interval.map(RotateInterval),
            theme: self.theme,
            auto_start: self.auto_start,
        }
    }
}

/// List or replace tips
#[derive(FromArgs)]
#[argh(subcommand, name = "tips")]
struct TipsCmd {
    #[argh(subcommand)]
    command: TipsSubCommand,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum TipsSubCommand {
    List(TipsListCmd),
    Set(TipsSetCmd),
}

/// List the configured tips
#[derive(FromArgs)]
#[argh(subcommand, name = "list")]
struct TipsListCmd {
    /// print the editable text form
    #[argh(switch)]
    raw: bool,
}

/// Replace all tips; separate tips with a blank line or a `--` line
#[derive(FromArgs)]
#[argh(subcommand, name = "set")]
struct TipsSetCmd {
    /// tips text, `> ` lines become descriptions
    #[argh(positional)]
    text: String,
}

/// Show version information
#[derive(FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCmd {}

fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    let command = match cli.command {
        None => {
            // No subcommand - show help (simulate --help)
            let args: Vec<&str> = vec!["floatone", "--help"];
            if let Err(e) = Cli::from_args(&args[..1], &args[1..]) {
                println!("{}", e.output);
            }
            return Ok(());
        }
        Some(SubCommand::Version(_)) => {
            println!("floatone {}", VERSION);
            return Ok(());
        }
        Some(command) => command,
    };

    // stdout carries command output; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::load(cli.store, cli.socket)?;
    tracing::debug!("Using {:?}", settings);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(App::new(settings), command))
}

async fn run(app: App, command: SubCommand) -> Result<()> {
    let mut stdout = std::io::stdout();

    match command {
        SubCommand::Hub(_) => app.run_hub().await,
        SubCommand::Watch(cmd) => app.watch(cmd.key.as_deref(), &mut stdout).await,
        SubCommand::Tip(cmd) => app.tip(cmd.once, &mut stdout).await,
        SubCommand::Get(cmd) => app.get(&cmd.key, &mut stdout).await,
        SubCommand::Set(cmd) => app.set(&cmd.key, &cmd.value).await,
        SubCommand::Config(cmd) => app.config(&cmd.into_patch(), &mut stdout).await,
        SubCommand::Tips(TipsCmd {
            command: TipsSubCommand::List(cmd),
        }) => app.list_tips(cmd.raw, &mut stdout).await,
        SubCommand::Tips(TipsCmd {
            command: TipsSubCommand::Set(cmd),
        }) => app.set_tips(&cmd.text, &mut stdout).await,
        SubCommand::Version(_) => {
            println!("floatone {}", VERSION);
            Ok(())
        }
    }
}
