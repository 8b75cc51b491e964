use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};

use floatone_ipc::{parse_all_tips, parse_tips_from_text, tips_to_text, ChangeEvent, ConfigPatch};
use floatone_store::{
    app_schema, update_config, EventBus, LocalBus, Store, Window, CONFIG, NEW_VERSION_DOWNLOADED,
};

use crate::ipc::{BusServer, SocketBus};
use crate::rotation::{Rotation, RotationSettings};
use crate::settings::Settings;

/// A window opened for one command, connected to the hub when it is running
struct Session {
    window: Window,
    socket: Option<Arc<SocketBus>>,
}

impl Session {
    async fn open(settings: &Settings, label: &str) -> Result<Self> {
        let schema = Arc::new(app_schema().context("Invalid store schema")?);

        let socket = match SocketBus::connect(&settings.socket_path, label).await {
            Ok(bus) => Some(Arc::new(bus)),
            Err(e) => {
                tracing::warn!("{:#}; changes will not reach other windows", e);
                None
            }
        };
        let bus: Arc<dyn EventBus> = match &socket {
            Some(socket) => Arc::clone(socket) as Arc<dyn EventBus>,
            None => Arc::new(LocalBus::new()),
        };

        let window = Window::open(label, schema, &settings.store_path, bus);
        window.init().await.context("Failed to initialize store")?;
        Ok(Self { window, socket })
    }

    fn store(&self) -> &Store {
        self.window.store()
    }

    /// Make sure published changes left the process before it exits
    async fn finish(&self) {
        if let Some(socket) = &self.socket {
            if let Err(e) = socket.flush().await {
                tracing::warn!("Changes may not have reached the hub: {:#}", e);
            }
        }
    }
}

pub struct App {
    settings: Settings,
}

impl App {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub async fn run_hub(&self) -> Result<()> {
        let server = BusServer::new(&self.settings.socket_path);
        let listener = server.bind()?;
        let broadcaster = server.broadcaster().clone();

        tokio::select! {
            result = server.serve(listener) => result,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(
                    "Bus hub shutting down with {} windows connected",
                    broadcaster.connection_count()
                );
                Ok(())
            }
        }
    }

    /// Print every change event as a JSON line
    pub async fn watch(&self, key: Option<&str>, out: &mut impl Write) -> Result<()> {
        let schema = app_schema()?;
        let keys: Vec<&str> = match key {
            Some(key) if !schema.contains(key) => bail!("Unknown key: {}", key),
            Some(key) => vec![key],
            None => schema.keys().map(|k| k.name()).collect(),
        };
        let events: Vec<String> = keys.iter().map(|k| ChangeEvent::event_name(k)).collect();

        let bus = SocketBus::connect_filtered(&self.settings.socket_path, "watch", events.clone())
            .await
            .context("watch needs a running hub (start one with `floatone hub`)")?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut forwards = Vec::new();
        for event in &events {
            let mut subscription = bus.subscribe(event);
            let tx = tx.clone();
            forwards.push(tokio::spawn(async move {
                while let Some(envelope) = subscription.recv().await {
                    if tx.send(envelope).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(tx);

        loop {
            tokio::select! {
                Some(envelope) = rx.recv() => {
                    writeln!(out, "{}", serde_json::to_string(&envelope.payload)?)?;
                    out.flush()?;
                }
                _ = bus.closed() => break,
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        for forward in forwards {
            forward.abort();
        }
        Ok(())
    }

    /// Headless tip bar: print the current tip and follow rotation and config changes
    pub async fn tip(&self, once: bool, out: &mut impl Write) -> Result<()> {
        let session = Session::open(&self.settings, "tipbar").await?;
        let store = session.store();

        let mut settings = store
            .use_key(&CONFIG)?
            .select(|config| RotationSettings::from(config))?;
        let mut rotation = Rotation::new(settings.get());
        show_tip(out, &rotation)?;
        if once {
            return Ok(());
        }

        let mut downloaded = store.use_key(&NEW_VERSION_DOWNLOADED)?;
        let mut ticker = rotation_timer(rotation.interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if rotation.advance() {
                        show_tip(out, &rotation)?;
                    }
                }
                changed = settings.changed() => {
                    let changed = changed?;
                    let interval = rotation.interval();
                    rotation.update(&changed);
                    if rotation.interval() != interval {
                        ticker = rotation_timer(rotation.interval());
                    }
                    show_tip(out, &rotation)?;
                }
                ready = downloaded.changed() => {
                    if ready? {
                        writeln!(out, "A new version has been downloaded, restart to update")?;
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        Ok(())
    }

    pub async fn get(&self, key: &str, out: &mut impl Write) -> Result<()> {
        let session = Session::open(&self.settings, "cli").await?;
        let value = session.store().get_raw(key)?;
        writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
        Ok(())
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let value: serde_json::Value = serde_json::from_str(value)
            .with_context(|| format!("Value for {} is not valid JSON: {}", key, value))?;

        let session = Session::open(&self.settings, "cli").await?;
        let result = session.store().set_raw(key, value).await;
        session.finish().await;
        result.with_context(|| format!("Failed to set {}", key))
    }

    /// Print the config, or merge `patch` into it and print the result
    pub async fn config(&self, patch: &ConfigPatch, out: &mut impl Write) -> Result<()> {
        let session = Session::open(&self.settings, "settings").await?;

        let config = if patch.is_empty() {
            session.store().get(&CONFIG)?
        } else {
            let result = update_config(session.store(), patch).await;
            session.finish().await;
            result.context("Failed to save config")?
        };

        writeln!(out, "{}", serde_json::to_string_pretty(&config)?)?;
        Ok(())
    }

    pub async fn list_tips(&self, raw: bool, out: &mut impl Write) -> Result<()> {
        let session = Session::open(&self.settings, "cli").await?;
        let config = session.store().get(&CONFIG)?;

        if raw {
            writeln!(out, "{}", tips_to_text(&config.tips))?;
            return Ok(());
        }

        for (i, tip) in parse_all_tips(&config.tips).iter().enumerate() {
            writeln!(out, "{}. {}", i + 1, tip.main.replace('\n', "\n   "))?;
            if let Some(description) = &tip.description {
                writeln!(out, "   > {}", description)?;
            }
        }
        Ok(())
    }

    /// Replace all tips with the ones parsed from `text`
    pub async fn set_tips(&self, text: &str, out: &mut impl Write) -> Result<()> {
        let tips = parse_tips_from_text(text);
        if tips.is_empty() {
            bail!("No tips found in the given text");
        }

        let count = tips.len();
        let patch = ConfigPatch {
            tips: Some(tips),
            ..ConfigPatch::default()
        };
        self.save_patch(&patch).await?;
        writeln!(out, "Saved {} tips", count)?;
        Ok(())
    }

    async fn save_patch(&self, patch: &ConfigPatch) -> Result<()> {
        let session = Session::open(&self.settings, "settings").await?;
        let result = update_config(session.store(), patch).await;
        session.finish().await;
        result.context("Failed to save tips")?;
        Ok(())
    }
}

fn rotation_timer(period: Duration) -> Interval {
    let period = period.max(Duration::from_secs(1));
    tokio::time::interval_at(Instant::now() + period, period)
}

fn show_tip(out: &mut impl Write, rotation: &Rotation) -> Result<()> {
    match rotation.current() {
        Some(tip) => {
            writeln!(out, "{}", tip.main)?;
            if let Some(description) = &tip.description {
                writeln!(out, "  > {}", description)?;
            }
        }
        None => writeln!(out, "(no tips)")?,
    }
    out.flush()?;
    Ok(())
}
