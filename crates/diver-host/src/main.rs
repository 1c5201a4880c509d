//! Diver Demo Host
//!
//! A stand-in target process: it builds a small game world on the simulated
//! runtime, runs a game loop that keeps calling into it, and hosts a diver
//! the way a bootstrap loader would.
//!
//! Types exposed:
//! - `Demo.Player` (`Name`, `Health`, `Gold`, `TakeDamage(int)`, event `Damaged`)
//! - `Demo.Enemy` (`Name`, `Hp`, `Level`)
//! - `Demo.Game` statics (`Player`, `Enemies`, `Ticks`, `Tick()`)

use anyhow::{bail, Context, Result};
use clap::Parser;
use diver_agent::runtime::sim::{SimRuntime, TypeBuilder};
use diver_agent::runtime::{ManagedRuntime, Value};
use diver_common::ipc::DEFAULT_DIVER_PORT;
use diver_common::{init_logging, LogConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "diver-host")]
#[command(about = "Demo target process hosting a diver")]
#[command(version)]
struct Args {
    /// Diver TCP port
    #[arg(short, long, default_value_t = DEFAULT_DIVER_PORT)]
    port: u16,

    /// Diver TOML config; `--port` still wins
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Game loop period in milliseconds
    #[arg(long, default_value_t = 500)]
    tick_ms: u64,

    /// Number of enemies to spawn
    #[arg(long, default_value_t = 5)]
    enemies: usize,
}

impl Args {
    /// Argument string handed to the diver entry point
    fn diver_argument(&self) -> String {
        let mut argument = format!("port={};log_level={}", self.port, self.log_level);
        if let Some(config) = &self.config {
            argument.push_str(&format!(";config={}", config.display()));
        }
        argument
    }
}

const ENEMY_NAMES: &[&str] = &["goblin", "orc", "troll", "wraith", "kobold", "slime", "imp"];

fn int_field(rt: &SimRuntime, target: Option<diver_agent::runtime::ObjectId>, type_name: &str, field: &str) -> diver_common::Result<i64> {
    Ok(rt
        .get_field(target, type_name, field)?
        .as_primitive()
        .and_then(|p| p.as_i64())
        .unwrap_or(0))
}

fn define_types(rt: &SimRuntime) {
    rt.define_type(
        TypeBuilder::new("Demo", "Demo.Player")
            .field("Name", "string")
            .field("Health", "int")
            .field("Gold", "int")
            .event("Damaged", &["int"])
            .method("TakeDamage", "int", &[("amount", "int")], |rt, frame| {
                let this = frame.this()?.id;
                let amount = frame.int_arg(0)?;
                let health = (int_field(rt, Some(this), "Demo.Player", "Health")? - amount).max(0);
                rt.set_field(Some(this), "Demo.Player", "Health", Value::from(health))?;
                rt.raise_event(this, "Damaged", &[Value::from(amount)])?;
                Ok(Some(Value::from(health)))
            })
            .method("AddGold", "int", &[("amount", "int")], |rt, frame| {
                let this = frame.this()?.id;
                let gold = int_field(rt, Some(this), "Demo.Player", "Gold")? + frame.int_arg(0)?;
                rt.set_field(Some(this), "Demo.Player", "Gold", Value::from(gold))?;
                Ok(Some(Value::from(gold)))
            }),
    );
    rt.define_type(
        TypeBuilder::new("Demo", "Demo.Enemy")
            .field("Name", "string")
            .field("Hp", "int")
            .field("Level", "int")
            .constructor(&[("name", "string"), ("level", "int")], |rt, frame| {
                let this = frame.this()?.id;
                let level = frame.int_arg(1)?;
                rt.set_field(Some(this), "Demo.Enemy", "Name", frame.arg(0)?.clone())?;
                rt.set_field(Some(this), "Demo.Enemy", "Level", Value::from(level))?;
                rt.set_field(Some(this), "Demo.Enemy", "Hp", Value::from(level * 10))?;
                Ok(None)
            }),
    );
    rt.define_type(TypeBuilder::new("Demo", "Demo.EnemyList").collection_of("Demo.Enemy"));
    rt.define_type(
        TypeBuilder::new("Demo", "Demo.Game")
            .static_field("Player", "Demo.Player", Value::Null)
            .static_field("Enemies", "Demo.EnemyList", Value::Null)
            .static_field("Ticks", "int", Value::from(0))
            .static_method("Tick", "int", &[], |rt, _| {
                let ticks = int_field(rt, None, "Demo.Game", "Ticks")? + 1;
                rt.set_field(None, "Demo.Game", "Ticks", Value::from(ticks))?;

                if let Value::Object(player) = rt.get_field(None, "Demo.Game", "Player")? {
                    if ticks % 5 == 0 {
                        rt.invoke(Some(player.id), "Demo.Player", "TakeDamage", &[], vec![Value::from(3)])?;
                    }
                    rt.invoke(Some(player.id), "Demo.Player", "AddGold", &[], vec![Value::from(1)])?;
                }
                Ok(Some(Value::from(ticks)))
            }),
    );
}

fn build_world(rt: &SimRuntime, enemies: usize) -> Result<()> {
    define_types(rt);

    let player = rt.new_object("Demo.Player").context("Failed to create player")?;
    rt.set_field(Some(player.id), "Demo.Player", "Name", Value::from("hero"))?;
    rt.set_field(Some(player.id), "Demo.Player", "Health", Value::from(100))?;
    rt.set_field(None, "Demo.Game", "Player", Value::Object(player))?;

    let list = rt.new_object("Demo.EnemyList").context("Failed to create enemy list")?;
    rt.set_field(None, "Demo.Game", "Enemies", Value::Object(list.clone()))?;
    for i in 0..enemies {
        let name = format!("{}-{}", ENEMY_NAMES[i % ENEMY_NAMES.len()], i);
        let enemy = rt
            .create_object("Demo.Enemy", vec![Value::from(name), Value::from((i % 7 + 1) as i64)])
            .with_context(|| format!("Failed to spawn enemy {}", i))?;
        rt.push_item(list.id, Value::Object(enemy))?;
    }

    info!(target: "diver_host", enemies, objects = rt.object_count(), "World ready");
    Ok(())
}

/// Tick the game until `running` clears. Every tenth tick also garbage
/// collects and compacts, so unpinned objects move around.
fn game_loop(rt: Arc<SimRuntime>, period: Duration, running: Arc<AtomicBool>) {
    let mut ticks: u64 = 0;
    while running.load(Ordering::SeqCst) {
        thread::sleep(period);
        ticks += 1;
        if let Err(e) = rt.invoke(None, "Demo.Game", "Tick", &[], Vec::new()) {
            warn!(target: "diver_host", error = %e, "Tick failed");
        }
        if ticks % 10 == 0 {
            let freed = rt.collect();
            let moved = rt.compact();
            debug!(target: "diver_host", ticks, freed, moved, "Heap maintenance");
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&LogConfig::default().with_level(&args.log_level));

    let runtime = Arc::new(SimRuntime::new());
    build_world(&runtime, args.enemies)?;

    let running = Arc::new(AtomicBool::new(true));
    let game = {
        let rt = runtime.clone();
        let running = running.clone();
        let period = Duration::from_millis(args.tick_ms.max(1));
        thread::Builder::new()
            .name("game-loop".to_string())
            .spawn(move || game_loop(rt, period, running))
            .context("Failed to start game loop")?
    };

    let argument = args.diver_argument();
    info!(target: "diver_host", argument = %argument, "Loading diver");
    let code = diver_agent::entry_point(runtime, &argument);

    running.store(false, Ordering::SeqCst);
    if game.join().is_err() {
        warn!(target: "diver_host", "Game loop panicked");
    }

    if code != diver_agent::EXIT_OK {
        bail!("Diver exited with code {}", code);
    }
    info!(target: "diver_host", "Diver stopped, exiting");
    Ok(())
}
